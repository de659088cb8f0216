use std::io::{ErrorKind, Write};

use bytes::BytesMut;

use crate::codec::{encode_message, FrameConfig};
use crate::error::{FrameError, Result};
use crate::message::Message;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete messages to any `Write` stream.
///
/// Each message is encoded into an internal buffer first, so a message is
/// either written whole or fails before any byte reaches the stream.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Encode and write one message, then flush (blocking).
    pub fn write_message(&mut self, msg: &Message) -> Result<()> {
        self.buf.clear();
        encode_message(msg, &mut self.buf)?;

        if self.buf.len() > self.config.max_frame_size {
            let size = self.buf.len();
            self.buf.clear();
            return Err(FrameError::FrameTooLarge {
                size,
                max: self.config.max_frame_size,
            });
        }

        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use rmpv::Value;

    use super::*;
    use crate::codec::decode_message;
    use crate::reader::FrameReader;

    fn written(writer: FrameWriter<Cursor<Vec<u8>>>) -> BytesMut {
        BytesMut::from(writer.into_inner().into_inner().as_slice())
    }

    #[test]
    fn write_single_request() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        let msg = Message::Request {
            id: 1,
            method: "add".to_string(),
            args: vec![Value::from(1), Value::from(2)],
        };
        writer.write_message(&msg).unwrap();

        let mut wire = written(writer);
        assert_eq!(decode_message(&mut wire, &FrameConfig::default()).unwrap(), Some(msg));
        assert!(wire.is_empty());
    }

    #[test]
    fn messages_are_not_interleaved() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        for id in 1..=3 {
            writer
                .write_message(&Message::Response {
                    id,
                    error: Value::Nil,
                    result: Value::from(id * 10),
                })
                .unwrap();
        }

        let mut wire = written(writer);
        for id in 1..=3u32 {
            let msg = decode_message(&mut wire, &FrameConfig::default()).unwrap().unwrap();
            assert!(matches!(msg, Message::Response { id: got, .. } if got == id));
        }
    }

    #[test]
    fn frame_too_large_rejected_before_writing() {
        let cfg = FrameConfig::default().with_max_frame_size(8);
        let mut writer = FrameWriter::with_config(Cursor::new(Vec::<u8>::new()), cfg);

        let err = writer
            .write_message(&Message::Notification {
                method: "oversized".to_string(),
                args: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { max: 8, .. }));
        assert!(written(writer).is_empty());
    }

    #[test]
    fn flush_propagates() {
        let sink = FlushTrackingWriter::default();
        let flag = Arc::clone(&sink.flushed);
        let mut writer = FrameWriter::new(sink);

        writer
            .write_message(&Message::Notification {
                method: "x".to_string(),
                args: vec![],
            })
            .unwrap();

        assert!(flag.load(Ordering::SeqCst));
        assert!(!writer.get_ref().data.is_empty());
    }

    #[test]
    fn handles_interrupted_and_would_block() {
        let mut writer = FrameWriter::new(FlakyWriter::default());
        let msg = Message::Notification {
            method: "retry".to_string(),
            args: vec![Value::from(true)],
        };
        writer.write_message(&msg).unwrap();

        let inner = writer.into_inner();
        let mut reader = FrameReader::new(Cursor::new(inner.data));
        assert_eq!(reader.read_message().unwrap(), Some(msg));
    }

    #[test]
    fn connection_closed_when_write_returns_zero() {
        let mut writer = FrameWriter::new(ZeroWriter);
        let err = writer
            .write_message(&Message::Notification {
                method: "x".to_string(),
                args: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[derive(Default)]
    struct FlushTrackingWriter {
        flushed: Arc<AtomicBool>,
        data: Vec<u8>,
    }

    impl Write for FlushTrackingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.flushed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Fails each call once, alternating Interrupted and WouldBlock, and
    /// accepts at most three bytes per write.
    #[derive(Default)]
    struct FlakyWriter {
        calls: usize,
        data: Vec<u8>,
    }

    impl FlakyWriter {
        fn hiccup(&mut self) -> Option<std::io::Error> {
            self.calls += 1;
            match self.calls % 3 {
                1 => Some(std::io::Error::from(ErrorKind::Interrupted)),
                2 => Some(std::io::Error::from(ErrorKind::WouldBlock)),
                _ => None,
            }
        }
    }

    impl Write for FlakyWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if let Some(err) = self.hiccup() {
                return Err(err);
            }
            let n = buf.len().min(3);
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            match self.hiccup() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    struct ZeroWriter;

    impl Write for ZeroWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
