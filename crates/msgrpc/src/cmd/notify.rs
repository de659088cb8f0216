use crate::cmd::connect::{parse_args, Connection};
use crate::cmd::NotifyArgs;
use crate::exit::{peer_error, CliResult, SUCCESS};

pub fn run(args: NotifyArgs) -> CliResult<i32> {
    let notify_args = parse_args(&args.args)?;
    let connection = Connection::open(&args.target)?;

    let sent = connection
        .endpoint()
        .notify(&args.method, notify_args)
        .map_err(|err| peer_error("notify failed", err));
    if let Err(err) = sent {
        let _ = connection.finish();
        return Err(err);
    }
    tracing::debug!(method = %args.method, "notification sent");

    connection.finish()?;
    Ok(SUCCESS)
}
