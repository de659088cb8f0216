use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("msgrpc {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: msgrpc");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "target: {}",
        option_env!("MSGRPC_BUILD_TARGET").unwrap_or("unknown")
    );
    println!(
        "rustc: {}",
        option_env!("RUSTC_VERSION").unwrap_or("unknown")
    );
    println!("git_hash: {}", option_env!("GIT_HASH").unwrap_or("unknown"));
    println!("features: peer={}, cli=true", cfg!(feature = "peer"));
    println!(
        "max_frame_size: {}",
        msgrpc_frame::DEFAULT_MAX_FRAME
    );
    println!("max_depth: {}", msgrpc_frame::DEFAULT_MAX_DEPTH);

    Ok(SUCCESS)
}
