//! Bidirectional MessagePack RPC endpoints.
//!
//! Either side of a connection can call, notify, and answer. An
//! [`Endpoint`] issues calls from any thread, runs registered handlers on
//! their own threads, and correlates responses by id in its serve loop.
//! [`Pipeline`] batches calls, and [`EmbeddedPeer`] launches the other side
//! as a child process.

pub mod call;
pub mod connector;
pub mod embed;
pub mod endpoint;
pub mod error;
pub mod handler;
#[cfg(unix)]
pub mod listener;
pub mod options;
pub mod pipeline;

pub use call::{done_channel, Call, Done, PendingCall, Reply};
#[cfg(unix)]
pub use connector::dial;
pub use connector::{attach, attach_stdio};
pub use embed::{channel_id, EmbedConfig, EmbeddedPeer, API_INFO_METHOD, DEFAULT_PROGRAM};
pub use endpoint::{Endpoint, WeakEndpoint};
pub use error::{CallError, ErrorValue, PeerError, Result, EXCEPTION, VALIDATION};
pub use handler::{
    ArgCursor, ArgumentError, Handler, HandlerError, IntoReply, MarshalReply, Param, ParamKind,
    Prefixed, Rest,
};
#[cfg(unix)]
pub use listener::PeerListener;
pub use options::{DiagnosticSink, EndpointOptions};
pub use pipeline::Pipeline;
