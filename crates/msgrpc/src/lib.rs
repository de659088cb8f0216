//! Bidirectional MessagePack RPC over pipes, sockets, and embedded child
//! processes.
//!
//! # Crate Structure
//!
//! - [`transport`]: duplex byte streams (stdio, Unix sockets, child pipes)
//! - [`frame`]: MessagePack codec, typed values, message framing
//! - [`peer`]: endpoints, handlers, pipelines, embedded peers (behind `peer` feature)

/// Re-export transport types.
pub mod transport {
    pub use msgrpc_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use msgrpc_frame::*;
}

/// Re-export peer types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use msgrpc_peer::*;
}
