//! MessagePack value codec and message framing for msgrpc.
//!
//! Every message on the wire is one MessagePack array:
//! - `[0, id, method, args]` request
//! - `[1, id, error, result]` response
//! - `[2, method, args]` notification
//!
//! The reader hands out whole messages; values inside them stay as
//! [`Value`] until a caller converts them with [`FromValue`]. A failed
//! conversion is a [`ConvertError`] and never desynchronizes the stream.

pub mod codec;
pub mod error;
pub mod ext;
pub mod message;
pub mod reader;
pub mod value;
pub mod writer;

pub use codec::{decode_message, encode_message, FrameConfig, DEFAULT_MAX_DEPTH, DEFAULT_MAX_FRAME};
pub use error::{ConvertError, FrameError, Result};
pub use ext::{Buffer, Extension, ExtensionRegistry, ExtensionValue, Tabpage, Window};
pub use message::{Message, NOTIFICATION, REQUEST, RESPONSE};
pub use reader::FrameReader;
pub use rmpv::Value;
pub use value::{from_value, to_value, value_kind, FromValue, IntoArgs, IntoValue, Msgpack};
pub use writer::FrameWriter;
