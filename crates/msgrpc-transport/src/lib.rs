//! Duplex byte streams for msgrpc.
//!
//! An RPC endpoint needs exactly three things from its transport: a blocking
//! reader, a blocking writer, and a way to close the connection. This crate
//! produces those three parts from the places a peer usually lives:
//! - the process's own stdin/stdout (the peer spawned us)
//! - a Unix domain socket (dial an address, or listen for one)
//! - the stdin/stdout pipes of a child process we spawned
//!
//! This is the lowest layer of msgrpc. Everything else builds on top of
//! [`DuplexStream`].

pub mod child;
pub mod error;
pub mod stream;

#[cfg(unix)]
pub mod uds;

pub use child::{resolve_program, spawn_piped, ChildCommand};
pub use error::{Result, TransportError};
pub use stream::{Closer, DuplexStream, SharedWriter};

#[cfg(unix)]
pub use uds::UnixDomainSocket;
