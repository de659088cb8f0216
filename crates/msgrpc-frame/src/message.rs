//! The three message kinds and their array shapes.

use rmpv::Value;

use crate::error::{FrameError, Result};
use crate::value::value_kind;

/// `[0, id, method, args]`
pub const REQUEST: u64 = 0;

/// `[1, id, error, result]`
pub const RESPONSE: u64 = 1;

/// `[2, method, args]`
pub const NOTIFICATION: u64 = 2;

/// One top-level wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: u32,
        method: String,
        args: Vec<Value>,
    },
    Response {
        id: u32,
        error: Value,
        result: Value,
    },
    Notification {
        method: String,
        args: Vec<Value>,
    },
}

impl Message {
    /// Human-readable name of the message kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request { .. } => "request",
            Message::Response { .. } => "response",
            Message::Notification { .. } => "notification",
        }
    }

    /// Interpret a decoded top-level value as a message.
    ///
    /// Anything other than the three exact shapes is an error.
    pub fn from_value(value: Value) -> Result<Self> {
        let items = match value {
            Value::Array(items) => items,
            other => {
                return Err(FrameError::InvalidMessage(format!(
                    "expected array, found {}",
                    value_kind(&other)
                )))
            }
        };

        let len = items.len();
        let mut items = items.into_iter();
        let tag = match items.next() {
            Some(tag) => tag
                .as_u64()
                .ok_or_else(|| invalid(format!("message type is {}", value_kind(&tag))))?,
            None => return Err(invalid("empty message array".to_string())),
        };

        match (tag, len) {
            (REQUEST, 4) => {
                let id = take_id(items.next())?;
                let method = take_method(items.next())?;
                let args = take_args(items.next())?;
                Ok(Message::Request { id, method, args })
            }
            (RESPONSE, 4) => {
                let id = take_id(items.next())?;
                let error = items.next().unwrap_or(Value::Nil);
                let result = items.next().unwrap_or(Value::Nil);
                Ok(Message::Response { id, error, result })
            }
            (NOTIFICATION, 3) => {
                let method = take_method(items.next())?;
                let args = take_args(items.next())?;
                Ok(Message::Notification { method, args })
            }
            (REQUEST | RESPONSE | NOTIFICATION, _) => Err(invalid(format!(
                "message type {tag} with {len} elements"
            ))),
            _ => Err(invalid(format!("unknown message type {tag}"))),
        }
    }
}

fn invalid(reason: String) -> FrameError {
    FrameError::InvalidMessage(reason)
}

fn take_id(value: Option<Value>) -> Result<u32> {
    let value = value.unwrap_or(Value::Nil);
    value
        .as_u64()
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| invalid(format!("message id is {value}")))
}

fn take_method(value: Option<Value>) -> Result<String> {
    match value {
        Some(Value::String(method)) => method
            .into_str()
            .ok_or_else(|| invalid("method name is not valid UTF-8".to_string())),
        Some(Value::Binary(bytes)) => String::from_utf8(bytes)
            .map_err(|_| invalid("method name is not valid UTF-8".to_string())),
        other => Err(invalid(format!(
            "method name is {}",
            other.as_ref().map_or("missing", value_kind)
        ))),
    }
}

fn take_args(value: Option<Value>) -> Result<Vec<Value>> {
    match value {
        Some(Value::Array(args)) => Ok(args),
        other => Err(invalid(format!(
            "arguments are {}",
            other.as_ref().map_or("missing", value_kind)
        ))),
    }
}
