use std::io::{Read, Write};
#[cfg(unix)]
use std::path::Path;

use msgrpc_transport::{Closer, DuplexStream};
#[cfg(unix)]
use msgrpc_transport::UnixDomainSocket;

use crate::endpoint::Endpoint;
#[cfg(unix)]
use crate::error::Result;
use crate::options::EndpointOptions;

/// Build an endpoint over caller-supplied stream halves.
///
/// `closer` runs once when the endpoint closes; without one, closing only
/// stops the endpoint.
pub fn attach(
    reader: impl Read + Send + 'static,
    writer: impl Write + Send + 'static,
    closer: Option<Box<dyn Closer>>,
    options: EndpointOptions,
) -> Endpoint {
    Endpoint::new(DuplexStream::from_parts(reader, writer, closer), options)
}

/// Build an endpoint over this process's stdin and stdout, for a process
/// that was launched by its peer.
pub fn attach_stdio(options: EndpointOptions) -> Endpoint {
    Endpoint::new(DuplexStream::stdio(), options)
}

/// Connect to a peer listening on a Unix domain socket.
#[cfg(unix)]
pub fn dial(path: impl AsRef<Path>, options: EndpointOptions) -> Result<Endpoint> {
    let stream = UnixDomainSocket::connect(path)?;
    Ok(Endpoint::new(stream, options))
}
