use std::io::{ErrorKind, Read};

use bytes::BytesMut;

use crate::codec::{decode_message, FrameConfig};
use crate::error::{FrameError, Result};
use crate::message::Message;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete messages from any `Read` stream.
///
/// Handles partial reads internally; callers always get whole messages.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    /// Create a new reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Read the next complete message (blocking).
    ///
    /// Returns `Ok(None)` on EOF at a message boundary and
    /// `Err(FrameError::ConnectionClosed)` on EOF in the middle of one.
    pub fn read_message(&mut self) -> Result<Option<Message>> {
        loop {
            if let Some(msg) = decode_message(&mut self.buf, &self.config)? {
                return Ok(Some(msg));
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(FrameError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the reader and return the inner stream.
    ///
    /// Any buffered bytes of a partial message are lost.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}
