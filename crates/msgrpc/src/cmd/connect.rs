use std::thread::{self, JoinHandle};
use std::time::Duration;

use msgrpc_frame::{ExtensionRegistry, Value};
use msgrpc_peer::{
    dial, EmbedConfig, EmbeddedPeer, Endpoint, EndpointOptions, PeerError, API_INFO_METHOD,
};
use tracing::debug;

use crate::cmd::TargetArgs;
use crate::exit::{io_error, peer_error, CliError, CliResult, USAGE};
use crate::output::json_to_value;

/// An open connection to the peer named on the command line.
pub enum Connection {
    Socket {
        endpoint: Endpoint,
        serve: JoinHandle<msgrpc_peer::Result<()>>,
    },
    Embedded(EmbeddedPeer),
}

impl Connection {
    pub fn open(target: &TargetArgs) -> CliResult<Self> {
        if let Some(path) = &target.socket {
            let endpoint = dial(path, EndpointOptions::new())
                .map_err(|err| peer_error("connect failed", err))?;
            let serving = endpoint.clone();
            let serve = thread::Builder::new()
                .name("msgrpc-serve".to_string())
                .spawn(move || serving.serve())
                .map_err(|err| io_error("cannot start serve thread", err))?;
            return Ok(Self::Socket { endpoint, serve });
        }

        let Some(program) = &target.program else {
            return Err(CliError::new(USAGE, "either --socket or --program is required"));
        };
        let config = EmbedConfig::new(program).with_args(&target.program_args);
        let peer = EmbeddedPeer::spawn(&config, EndpointOptions::new())
            .map_err(|err| peer_error("spawn failed", err))?;
        Ok(Self::Embedded(peer))
    }

    pub fn endpoint(&self) -> &Endpoint {
        match self {
            Self::Socket { endpoint, .. } => endpoint,
            Self::Embedded(peer) => peer.endpoint(),
        }
    }

    /// Extension codes announced by the peer, falling back to the defaults
    /// when it does not answer the API info method.
    pub fn extensions(&self) -> ExtensionRegistry {
        let info = self
            .endpoint()
            .call::<(i64, Value)>(API_INFO_METHOD, ());
        match info {
            Ok((_, info)) => {
                let types = match &info {
                    Value::Map(fields) => fields
                        .iter()
                        .find(|(key, _)| key.as_str() == Some("types"))
                        .map(|(_, types)| types.clone()),
                    _ => None,
                };
                match types.map(|types| ExtensionRegistry::from_api_types(&types)) {
                    Some(registry) if !registry.is_empty() => registry,
                    _ => self.endpoint().extensions().clone(),
                }
            }
            Err(err) => {
                debug!(error = %err, "peer has no API info; using default extensions");
                self.endpoint().extensions().clone()
            }
        }
    }

    /// Close the connection. For an embedded peer this waits for it to exit.
    pub fn finish(self) -> CliResult<()> {
        match self {
            Self::Socket { endpoint, serve } => {
                match endpoint.close() {
                    Ok(()) | Err(PeerError::Closed) => {}
                    Err(err) => return Err(peer_error("close failed", err)),
                }
                match serve.join() {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(err)) => Err(peer_error("serve loop failed", err)),
                    Err(_) => Err(CliError::new(crate::exit::INTERNAL, "serve thread panicked")),
                }
            }
            Self::Embedded(peer) => {
                let status = peer
                    .shutdown()
                    .map_err(|err| peer_error("shutdown failed", err))?;
                debug!(%status, "peer exited");
                Ok(())
            }
        }
    }
}

/// Parse each command-line argument as one JSON value.
pub fn parse_args(args: &[String]) -> CliResult<Vec<Value>> {
    args.iter()
        .enumerate()
        .map(|(i, arg)| {
            serde_json::from_str::<serde_json::Value>(arg)
                .map(|json| json_to_value(&json))
                .map_err(|err| {
                    CliError::new(
                        USAGE,
                        format!("argument {} is not valid JSON ({arg:?}): {err}", i + 1),
                    )
                })
        })
        .collect()
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(match unit {
        "ms" => Duration::from_millis(value),
        _ => Duration::from_secs(value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("7").unwrap(), Duration::from_secs(7));
        assert_eq!(parse_duration("0s").unwrap_err().code, USAGE);
        assert_eq!(parse_duration("soon").unwrap_err().code, USAGE);
    }

    #[test]
    fn json_args_are_parsed_individually() {
        let args = vec!["1".to_string(), "\"two\"".to_string(), "[3]".to_string()];
        assert_eq!(
            parse_args(&args).unwrap(),
            vec![
                Value::from(1),
                Value::from("two"),
                Value::Array(vec![Value::from(3)])
            ]
        );

        let err = parse_args(&["{oops".to_string()]).unwrap_err();
        assert_eq!(err.code, USAGE);
        assert!(err.message.contains("argument 1"));
    }
}
