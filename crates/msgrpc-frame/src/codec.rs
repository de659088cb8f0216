use std::io::ErrorKind;

use bytes::{Buf, BufMut, BytesMut};
use rmpv::Value;

use crate::error::{FrameError, Result};
use crate::message::{Message, NOTIFICATION, REQUEST, RESPONSE};

/// Default maximum encoded message size: 64 MiB.
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024 * 1024;

/// Default decoder depth budget. Every array or map level spends two.
pub const DEFAULT_MAX_DEPTH: usize = 256;

/// Configuration for message framing.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Largest encoded message accepted or produced, in bytes. Default: 64 MiB.
    pub max_frame_size: usize,
    /// Recursion budget for decoding one message. Deeper input is malformed.
    pub max_depth: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl FrameConfig {
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }
}

/// Encode a message into the wire format.
///
/// ```text
/// request       [0, id, method, args]
/// response      [1, id, error, result]
/// notification  [2, method, args]
/// ```
pub fn encode_message(msg: &Message, dst: &mut BytesMut) -> Result<()> {
    let mut wr = dst.writer();
    match msg {
        Message::Request { id, method, args } => {
            rmp::encode::write_array_len(&mut wr, 4).map_err(encode_err)?;
            rmp::encode::write_uint(&mut wr, REQUEST).map_err(encode_err)?;
            rmp::encode::write_uint(&mut wr, u64::from(*id)).map_err(encode_err)?;
            rmp::encode::write_str(&mut wr, method).map_err(encode_err)?;
            write_args(&mut wr, args)?;
        }
        Message::Response { id, error, result } => {
            rmp::encode::write_array_len(&mut wr, 4).map_err(encode_err)?;
            rmp::encode::write_uint(&mut wr, RESPONSE).map_err(encode_err)?;
            rmp::encode::write_uint(&mut wr, u64::from(*id)).map_err(encode_err)?;
            rmpv::encode::write_value(&mut wr, error).map_err(encode_err)?;
            rmpv::encode::write_value(&mut wr, result).map_err(encode_err)?;
        }
        Message::Notification { method, args } => {
            rmp::encode::write_array_len(&mut wr, 3).map_err(encode_err)?;
            rmp::encode::write_uint(&mut wr, NOTIFICATION).map_err(encode_err)?;
            rmp::encode::write_str(&mut wr, method).map_err(encode_err)?;
            write_args(&mut wr, args)?;
        }
    }
    Ok(())
}

fn write_args<W: std::io::Write>(wr: &mut W, args: &[Value]) -> Result<()> {
    let len = u32::try_from(args.len())
        .map_err(|_| FrameError::Encode(format!("{} arguments", args.len())))?;
    rmp::encode::write_array_len(wr, len).map_err(encode_err)?;
    for arg in args {
        rmpv::encode::write_value(wr, arg).map_err(encode_err)?;
    }
    Ok(())
}

fn encode_err(err: impl std::fmt::Display) -> FrameError {
    FrameError::Encode(err.to_string())
}

/// Decode one message from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't hold a complete message yet.
/// On success, consumes the message bytes from the buffer. A complete value
/// that is not a valid message is consumed and reported as an error.
pub fn decode_message(src: &mut BytesMut, config: &FrameConfig) -> Result<Option<Message>> {
    if src.is_empty() {
        return Ok(None);
    }

    let max_frame = config.max_frame_size;
    let mut cursor: &[u8] = &src[..];
    match rmpv::decode::read_value_with_max_depth(&mut cursor, config.max_depth) {
        Ok(value) => {
            let consumed = src.len() - cursor.len();
            if consumed > max_frame {
                return Err(FrameError::FrameTooLarge {
                    size: consumed,
                    max: max_frame,
                });
            }
            src.advance(consumed);
            Message::from_value(value).map(Some)
        }
        Err(err) if is_incomplete(&err) => {
            if src.len() > max_frame {
                return Err(FrameError::FrameTooLarge {
                    size: src.len(),
                    max: max_frame,
                });
            }
            Ok(None) // Need more data
        }
        Err(err) => Err(FrameError::Malformed(err.to_string())),
    }
}

fn is_incomplete(err: &rmpv::decode::Error) -> bool {
    match err {
        rmpv::decode::Error::InvalidMarkerRead(io) | rmpv::decode::Error::InvalidDataRead(io) => {
            io.kind() == ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: u32, method: &str, args: Vec<Value>) -> Message {
        Message::Request {
            id,
            method: method.to_string(),
            args,
        }
    }

    #[test]
    fn request_wire_bytes() {
        let mut buf = BytesMut::new();
        encode_message(
            &request(1, "add", vec![Value::from(1), Value::from(2)]),
            &mut buf,
        )
        .unwrap();

        // [0, 1, "add", [1, 2]]
        assert_eq!(
            buf.as_ref(),
            &[0x94, 0x00, 0x01, 0xa3, b'a', b'd', b'd', 0x92, 0x01, 0x02]
        );
    }

    #[test]
    fn notification_wire_bytes() {
        let mut buf = BytesMut::new();
        let msg = Message::Notification {
            method: "n1".to_string(),
            args: vec![Value::from("hello")],
        };
        encode_message(&msg, &mut buf).unwrap();

        assert_eq!(buf[0], 0x93);
        assert_eq!(buf[1], 0x02);
        let decoded = decode_message(&mut buf, &FrameConfig::default()).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn response_keeps_error_and_result_values() {
        let mut buf = BytesMut::new();
        let msg = Message::Response {
            id: 9,
            error: Value::Array(vec![Value::from(0), Value::from("bad")]),
            result: Value::Nil,
        };
        encode_message(&msg, &mut buf).unwrap();
        assert_eq!(decode_message(&mut buf, &FrameConfig::default()).unwrap(), Some(msg));
    }

    #[test]
    fn decode_incomplete() {
        let mut full = BytesMut::new();
        encode_message(&request(3, "slow", vec![Value::from("x")]), &mut full).unwrap();

        for cut in 0..full.len() {
            let mut partial = BytesMut::from(&full[..cut]);
            assert!(decode_message(&mut partial, &FrameConfig::default())
                .unwrap()
                .is_none());
            assert_eq!(partial.len(), cut, "incomplete data must not be consumed");
        }
    }

    #[test]
    fn decode_multiple_messages() {
        let mut buf = BytesMut::new();
        encode_message(&request(1, "first", vec![]), &mut buf).unwrap();
        encode_message(&request(2, "second", vec![]), &mut buf).unwrap();

        let m1 = decode_message(&mut buf, &FrameConfig::default()).unwrap().unwrap();
        let m2 = decode_message(&mut buf, &FrameConfig::default()).unwrap().unwrap();
        assert_eq!(m1, request(1, "first", vec![]));
        assert_eq!(m2, request(2, "second", vec![]));
        assert!(buf.is_empty());
    }

    #[test]
    fn invalid_shape_is_consumed_then_rejected() {
        // [5, nil, nil] followed by a valid notification
        let mut buf = BytesMut::from(&[0x93, 0x05, 0xc0, 0xc0][..]);
        encode_message(
            &Message::Notification {
                method: "after".to_string(),
                args: vec![],
            },
            &mut buf,
        )
        .unwrap();

        let err = decode_message(&mut buf, &FrameConfig::default()).unwrap_err();
        assert!(matches!(err, FrameError::InvalidMessage(_)));
        assert_eq!(buf[0], 0x93, "the bad message is consumed");
    }

    #[test]
    fn runaway_nesting_is_malformed() {
        let mut bytes = vec![0x91; 2000];
        bytes.push(0xc0);
        let mut buf = BytesMut::from(&bytes[..]);
        let err = decode_message(&mut buf, &FrameConfig::default()).unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
    }

    #[test]
    fn nesting_within_depth_budget_decodes() {
        // [2, "n", [[[[nil]]]]]
        let mut bytes = vec![0x93, 0x02, 0xa1, b'n', 0x91, 0x91, 0x91, 0x91, 0xc0];
        let mut buf = BytesMut::from(&bytes[..]);
        let msg = decode_message(&mut buf, &FrameConfig::default()).unwrap();
        assert!(matches!(msg, Some(Message::Notification { .. })));

        bytes.truncate(4);
        bytes.extend(std::iter::repeat(0x91).take(20));
        bytes.push(0xc0);
        let shallow = FrameConfig::default().with_max_depth(16);
        let err = decode_message(&mut BytesMut::from(&bytes[..]), &shallow).unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
    }

    #[test]
    fn bare_scalar_is_invalid() {
        let mut buf = BytesMut::from(&[0x2a][..]);
        let err = decode_message(&mut buf, &FrameConfig::default()).unwrap_err();
        assert!(matches!(err, FrameError::InvalidMessage(_)));
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_message_rejected() {
        let mut buf = BytesMut::new();
        encode_message(
            &request(1, "big", vec![Value::Binary(vec![0; 256])]),
            &mut buf,
        )
        .unwrap();

        let limit = FrameConfig::default().with_max_frame_size(64);
        let err = decode_message(&mut buf.clone(), &limit).unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { max: 64, .. }));

        // Also when only a prefix has arrived.
        let mut prefix = BytesMut::from(&buf[..128]);
        let err = decode_message(&mut prefix, &limit).unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { size: 128, .. }));
    }

    #[test]
    fn empty_args_encode_as_empty_array() {
        let mut buf = BytesMut::new();
        encode_message(&request(7, "m", vec![]), &mut buf).unwrap();
        assert_eq!(buf.last(), Some(&0x90));
    }
}
