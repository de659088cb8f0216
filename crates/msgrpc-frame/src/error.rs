/// Errors that can occur while reading or writing messages.
///
/// All of these leave the stream in an unknown state and are fatal to
/// whoever owns it.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The bytes are not valid MessagePack.
    #[error("malformed message data: {0}")]
    Malformed(String),

    /// Valid MessagePack, but not one of the three message shapes.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A message (or the unfinished prefix of one) exceeds the configured maximum.
    #[error("message too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// A value could not be written.
    #[error("encode failed: {0}")]
    Encode(String),

    /// An I/O error occurred while reading or writing.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream ended in the middle of a message.
    #[error("connection closed (incomplete message)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;

/// A wire value did not fit the type it was decoded into.
///
/// The offending value has already been consumed, so the stream stays usable.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConvertError {
    #[error("expected {expected}, found {found}")]
    Mismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("{value} is out of range for {expected}")]
    OutOfRange {
        expected: &'static str,
        value: String,
    },

    #[error("expected a sequence of length {expected}, found length {found}")]
    Length { expected: usize, found: usize },

    #[error("expected extension {expected} (code {code}), found code {found}")]
    Extension {
        expected: &'static str,
        code: i8,
        found: i8,
    },

    #[error("no value for {expected} and the type has no zero value")]
    Missing { expected: &'static str },

    #[error("{0}")]
    Custom(String),
}
