//! Launch an embedded peer and make a few calls.
//!
//! ```text
//! cargo run --example embedded-call -- nvim --clean
//! ```
//!
//! Arguments after the program are passed to it after `--embed`.
//!
//! Any program that speaks the protocol after `--embed` works, including
//! `msgrpc` itself (built with the `cli` feature).

use msgrpc::frame::Value;
use msgrpc::peer::{EmbedConfig, EmbeddedPeer, EndpointOptions};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let program = args.next().unwrap_or_else(|| "nvim".to_string());
    let config = EmbedConfig::new(program).with_args(args);
    let peer = EmbeddedPeer::spawn(&config, EndpointOptions::new())?;

    println!("channel: {}", peer.channel_id()?);

    let mut pipeline = peer.endpoint().pipeline();
    let version = pipeline.call::<Value>("nvim_eval", ("v:version",));
    let cwd = pipeline.call::<String>("nvim_call_function", ("getcwd", Vec::<Value>::new()));
    pipeline.wait()?;
    println!("version: {:?}", version.take());
    println!("cwd: {:?}", cwd.take());

    let status = peer.shutdown()?;
    println!("exited: {status}");
    Ok(())
}
