use std::fmt;
use std::sync::Arc;

use msgrpc_frame::{ConvertError, FrameError, Value};

/// Error code of a peer-raised exception in a `[code, message]` error.
pub const EXCEPTION: u64 = 0;

/// Error code of a peer-side argument validation failure.
pub const VALIDATION: u64 = 1;

/// Errors that can occur in endpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// The endpoint is closed. Pending calls drained by `close` see this too.
    #[error("endpoint is closed")]
    Closed,

    /// An outbound message could not be written. The endpoint closed itself
    /// and every pending call got a copy of this error.
    #[error("write failed, endpoint closed: {0}")]
    Encode(Arc<FrameError>),

    /// The inbound stream broke the protocol or failed.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The response arrived but its result did not fit the reply slot.
    #[error("{method}: cannot decode result: {source}")]
    Convert {
        method: String,
        #[source]
        source: ConvertError,
    },

    /// The peer reported `[0, message]`.
    #[error("{method}: exception: {message}")]
    Exception { method: String, message: String },

    /// The peer reported `[1, message]`.
    #[error("{method}: validation error: {message}")]
    Validation { method: String, message: String },

    /// The peer reported any other error value.
    #[error("{method}: {value}")]
    Remote { method: String, value: ErrorValue },

    /// A call completed without filling its reply slot.
    #[error("{method}: response carried no result")]
    MissingResult { method: String },

    /// The handler's signature does not fit the endpoint configuration.
    #[error("cannot register {method}: {reason}")]
    Registration { method: String, reason: String },

    /// A caller-supplied done channel had no buffer.
    #[error("done channel must be buffered")]
    UnbufferedDone,

    /// `serve` was called a second time.
    #[error("endpoint is already being served")]
    AlreadyServing,

    /// Several pipelined calls failed.
    #[error("{} pipelined calls failed: {}", .0.len(), join_errors(.0))]
    Batch(Vec<CallError>),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] msgrpc_transport::TransportError),

    /// I/O error outside the message stream (closing, child process control).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PeerError {
    /// Method name carried by errors that are tied to one call.
    pub fn method(&self) -> Option<&str> {
        match self {
            PeerError::Convert { method, .. }
            | PeerError::Exception { method, .. }
            | PeerError::Validation { method, .. }
            | PeerError::Remote { method, .. }
            | PeerError::MissingResult { method } => Some(method),
            _ => None,
        }
    }

    /// True for errors reported by the peer itself rather than by this side.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            PeerError::Exception { .. } | PeerError::Validation { .. } | PeerError::Remote { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PeerError>;

/// A structured error value, sent or received as-is.
///
/// Handlers return it to put an arbitrary value in the error slot of a
/// response; callers receive it inside [`PeerError::Remote`].
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorValue(pub Value);

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_str() {
            Some(text) => f.write_str(text),
            None => write!(f, "{}", self.0),
        }
    }
}

impl std::error::Error for ErrorValue {}

/// One failed call inside a [`PeerError::Batch`].
#[derive(Debug)]
pub struct CallError {
    pub method: String,
    pub error: PeerError,
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.error.method().is_some() {
            write!(f, "{}", self.error)
        } else {
            write!(f, "{}: {}", self.method, self.error)
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

fn join_errors(errors: &[CallError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Map the error slot of a response to a call error.
pub(crate) fn remote_error(method: &str, error: Value) -> PeerError {
    if let Value::Array(items) = &error {
        if let [code, message] = items.as_slice() {
            if let (Some(code), Some(message)) = (code.as_u64(), message.as_str()) {
                match code {
                    EXCEPTION => {
                        return PeerError::Exception {
                            method: method.to_string(),
                            message: message.to_string(),
                        }
                    }
                    VALIDATION => {
                        return PeerError::Validation {
                            method: method.to_string(),
                            message: message.to_string(),
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    PeerError::Remote {
        method: method.to_string(),
        value: ErrorValue(error),
    }
}
