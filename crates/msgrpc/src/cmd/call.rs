use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use msgrpc_frame::Value;

use crate::cmd::connect::{parse_args, parse_duration, Connection};
use crate::cmd::CallArgs;
use crate::exit::{peer_error, CliError, CliResult, SUCCESS, TIMEOUT};
use crate::output::{print_result, OutputFormat};

pub fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let call_args = parse_args(&args.args)?;
    let connection = Connection::open(&args.target)?;

    let started = Instant::now();
    let pending = connection
        .endpoint()
        .go::<Value>(&args.method, call_args);
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(pending.wait());
    });

    let outcome = match rx.recv_timeout(timeout) {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(peer_error("call failed", err)),
        Err(_) => Err(CliError::new(
            TIMEOUT,
            format!("call failed: no response to {} within {timeout:?}", args.method),
        )),
    };
    let elapsed = started.elapsed();

    let result = match outcome {
        Ok(result) => result,
        Err(err) => {
            let _ = connection.finish();
            return Err(err);
        }
    };

    let registry = if contains_ext(&result) {
        connection.extensions()
    } else {
        connection.endpoint().extensions().clone()
    };
    print_result(&args.method, &result, elapsed, &registry, format);

    connection.finish()?;
    Ok(SUCCESS)
}

fn contains_ext(value: &Value) -> bool {
    match value {
        Value::Ext(..) => true,
        Value::Array(items) => items.iter().any(contains_ext),
        Value::Map(entries) => entries
            .iter()
            .any(|(k, v)| contains_ext(k) || contains_ext(v)),
        _ => false,
    }
}
