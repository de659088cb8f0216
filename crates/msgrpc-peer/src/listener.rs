use std::path::Path;

use msgrpc_transport::UnixDomainSocket;

use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::options::EndpointOptions;

/// Listens for peers connecting over a Unix domain socket.
///
/// The host side of "editor connects to us": bind a path, hand it to the
/// peer, and accept its connection as an [`Endpoint`].
pub struct PeerListener {
    socket: UnixDomainSocket,
    options: EndpointOptions,
}

impl PeerListener {
    /// Bind to a Unix domain socket path.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let socket = UnixDomainSocket::bind(path)?;
        Ok(Self {
            socket,
            options: EndpointOptions::default(),
        })
    }

    /// Options applied to every accepted endpoint.
    pub fn with_options(mut self, options: EndpointOptions) -> Self {
        self.options = options;
        self
    }

    /// Accept the next connection (blocking).
    pub fn accept(&self) -> Result<Endpoint> {
        let stream = self.socket.accept()?;
        Ok(Endpoint::new(stream, self.options.clone()))
    }

    /// Bound socket path.
    pub fn path(&self) -> &Path {
        self.socket.path()
    }
}

impl std::fmt::Debug for PeerListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerListener")
            .field("path", &self.path())
            .finish()
    }
}
