use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use msgrpc_frame::Value;
use msgrpc_peer::{
    attach_stdio, Endpoint, EndpointOptions, ErrorValue, HandlerError, PeerListener, Rest,
    API_INFO_METHOD, EXCEPTION,
};
use tracing::{debug, info, warn};

use crate::cmd::ServeArgs;
use crate::exit::{peer_error, CliError, CliResult, SUCCESS};

/// Longest `sleep` a caller may request.
const MAX_SLEEP_MS: u64 = 60_000;

static NEXT_CHANNEL: AtomicI64 = AtomicI64::new(1);

pub fn run(args: ServeArgs) -> CliResult<i32> {
    match args.socket {
        Some(path) => serve_socket(&path),
        None => serve_stdio(),
    }
}

/// Serve the peer that launched us over stdin/stdout.
pub fn serve_stdio() -> CliResult<i32> {
    let endpoint = attach_stdio(EndpointOptions::new());
    register_handlers(&endpoint).map_err(|err| peer_error("register failed", err))?;
    info!("serving on stdio");
    endpoint
        .serve()
        .map_err(|err| peer_error("serve failed", err))?;
    Ok(SUCCESS)
}

fn serve_socket(path: &std::path::Path) -> CliResult<i32> {
    let listener = PeerListener::bind(path).map_err(|err| peer_error("bind failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone(), listener.path().to_path_buf())?;

    while running.load(Ordering::SeqCst) {
        let endpoint = match listener.accept() {
            Ok(endpoint) => endpoint,
            Err(err) => return Err(peer_error("accept failed", err)),
        };
        if !running.load(Ordering::SeqCst) {
            break;
        }
        register_handlers(&endpoint).map_err(|err| peer_error("register failed", err))?;

        let spawned = thread::Builder::new()
            .name("msgrpc-conn".to_string())
            .spawn(move || match endpoint.serve() {
                Ok(()) => debug!("connection closed"),
                Err(err) => warn!(error = %err, "connection failed"),
            });
        if let Err(err) = spawned {
            warn!(error = %err, "cannot start connection thread");
        }
    }

    Ok(SUCCESS)
}

/// On Ctrl-C, stop accepting. A throwaway connection wakes the blocked
/// `accept` so the listener is dropped and its socket file removed.
fn install_ctrlc_handler(running: Arc<AtomicBool>, path: std::path::PathBuf) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
        let _ = std::os::unix::net::UnixStream::connect(&path);
    })
    .map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}

/// The demo handlers every served connection gets.
pub fn register_handlers(endpoint: &Endpoint) -> msgrpc_peer::Result<()> {
    let channel = NEXT_CHANNEL.fetch_add(1, Ordering::Relaxed);

    endpoint.register("echo", |args: Rest<Value>| -> Result<Vec<Value>, HandlerError> {
        Ok(args.into_inner())
    })?;

    endpoint.register("add", |a: i64, b: i64| -> Result<i64, HandlerError> {
        a.checked_add(b)
            .ok_or_else(|| HandlerError::msg(format!("{a} + {b} overflows")))
    })?;

    endpoint.register(
        "concat",
        |first: String, rest: Rest<String>| -> Result<String, HandlerError> {
            Ok(rest.iter().fold(first, |mut out, s| {
                out.push_str(s);
                out
            }))
        },
    )?;

    endpoint.register("fail", |message: String| -> Result<(), ErrorValue> {
        Err(ErrorValue(Value::Array(vec![
            Value::from(EXCEPTION),
            Value::from(message),
        ])))
    })?;

    endpoint.register("sleep", |ms: u64| -> Result<u64, HandlerError> {
        if ms > MAX_SLEEP_MS {
            return Err(HandlerError::msg(format!(
                "sleep of {ms}ms exceeds {MAX_SLEEP_MS}ms"
            )));
        }
        thread::sleep(Duration::from_millis(ms));
        Ok(ms)
    })?;

    let host = endpoint.downgrade();
    endpoint.register(
        "call_host",
        move |method: String, args: Rest<Value>| -> Result<Value, HandlerError> {
            let host = host
                .upgrade()
                .ok_or_else(|| HandlerError::msg("connection is gone"))?;
            Ok(host.call::<Value>(&method, args.into_inner())?)
        },
    )?;

    endpoint.register(API_INFO_METHOD, move || -> Result<(i64, Value), HandlerError> {
        Ok((channel, api_info()))
    })?;

    endpoint.register("log", |level: String, message: String| match level.as_str() {
        "error" => tracing::error!(%message, "peer log"),
        "warn" => tracing::warn!(%message, "peer log"),
        "debug" => tracing::debug!(%message, "peer log"),
        _ => tracing::info!(%message, "peer log"),
    })?;

    Ok(())
}

fn api_info() -> Value {
    let handle = |id: i64| Value::Map(vec![(Value::from("id"), Value::from(id))]);
    Value::Map(vec![
        (
            Value::from("version"),
            Value::Map(vec![
                (Value::from("name"), Value::from("msgrpc")),
                (Value::from("version"), Value::from(env!("CARGO_PKG_VERSION"))),
            ]),
        ),
        (
            Value::from("types"),
            Value::Map(vec![
                (Value::from("Buffer"), handle(0)),
                (Value::from("Window"), handle(1)),
                (Value::from("Tabpage"), handle(2)),
            ]),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;

    use msgrpc_peer::PeerError;
    use msgrpc_transport::DuplexStream;

    use super::*;

    fn demo_pair() -> (Endpoint, Endpoint) {
        let (left, right) = UnixStream::pair().expect("pair should open");
        let host = Endpoint::new(
            DuplexStream::from_unix(left).expect("stream should split"),
            EndpointOptions::new(),
        );
        let demo = Endpoint::new(
            DuplexStream::from_unix(right).expect("stream should split"),
            EndpointOptions::new(),
        );
        register_handlers(&demo).expect("handlers should register");
        for endpoint in [host.clone(), demo.clone()] {
            thread::spawn(move || endpoint.serve());
        }
        (host, demo)
    }

    #[test]
    fn demo_handlers_answer() {
        let (host, _demo) = demo_pair();

        assert_eq!(host.call::<i64>("add", (2, 40)).unwrap(), 42);
        assert_eq!(
            host.call::<String>("concat", ("a", "b", "c")).unwrap(),
            "abc"
        );
        assert_eq!(
            host.call::<Vec<i64>>("echo", (1, 2, 3)).unwrap(),
            vec![1, 2, 3]
        );
        assert_eq!(host.call::<u64>("sleep", (1,)).unwrap(), 1);

        let err = host.call::<Value>("fail", ("nope",)).unwrap_err();
        assert!(matches!(err, PeerError::Exception { ref message, .. } if message == "nope"));

        let err = host.call::<i64>("add", (i64::MAX, 1)).unwrap_err();
        assert!(err.is_remote());
    }

    #[test]
    fn call_host_reaches_back() {
        let (host, _demo) = demo_pair();
        host.register("triple", |n: i64| -> Result<i64, HandlerError> { Ok(n * 3) })
            .unwrap();

        let out: i64 = host.call("call_host", ("triple", 5)).unwrap();
        assert_eq!(out, 15);
    }

    #[test]
    fn api_info_announces_handles() {
        let (host, _demo) = demo_pair();
        let (channel, info): (i64, Value) = host.call(API_INFO_METHOD, ()).unwrap();
        assert!(channel > 0);

        let Value::Map(fields) = info else {
            panic!("api info should be a map");
        };
        let types = fields
            .iter()
            .find(|(k, _)| k.as_str() == Some("types"))
            .map(|(_, v)| v.clone())
            .unwrap();
        let registry = msgrpc_frame::ExtensionRegistry::from_api_types(&types);
        assert_eq!(registry.name(1), Some("Window"));
    }
}
