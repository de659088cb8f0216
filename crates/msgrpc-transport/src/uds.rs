use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::DuplexStream;

/// Unix domain socket endpoint address.
///
/// `connect` dials a peer that is already listening (an editor started with a
/// listen address). `bind` + `accept` is the reverse arrangement, where the
/// host listens and the editor connects to it.
pub struct UnixDomainSocket {
    listener: UnixListener,
    path: PathBuf,
    created_inode: (u64, u64),
}

impl UnixDomainSocket {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;
    /// `sockaddr_un.sun_path` is 108 bytes on Linux, 104 elsewhere.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind and listen on a filesystem path.
    ///
    /// A stale socket at `path` is removed first; any other kind of file is
    /// left alone and reported as a bind error.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        check_path_len(&path)?;

        let bind_err = |source: std::io::Error| TransportError::Bind {
            path: path.clone(),
            source,
        };

        if let Ok(metadata) = std::fs::symlink_metadata(&path) {
            if !metadata.file_type().is_socket() {
                return Err(bind_err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "existing path is not a unix socket",
                )));
            }
            debug!(?path, "removing stale socket");
            std::fs::remove_file(&path).map_err(bind_err)?;
        }

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        std::fs::set_permissions(
            &path,
            std::fs::Permissions::from_mode(Self::DEFAULT_SOCKET_MODE),
        )
        .map_err(bind_err)?;
        let created = std::fs::symlink_metadata(&path).map_err(bind_err)?;

        info!(?path, "listening for peers on unix domain socket");

        Ok(Self {
            listener,
            created_inode: (created.dev(), created.ino()),
            path,
        })
    }

    /// Accept one peer connection (blocking).
    pub fn accept(&self) -> Result<DuplexStream> {
        let (stream, _addr) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(path = ?self.path, "accepted peer connection");
        DuplexStream::from_unix(stream).map_err(TransportError::Accept)
    }

    /// Dial a listening peer (blocking).
    pub fn connect(path: impl AsRef<Path>) -> Result<DuplexStream> {
        let path = path.as_ref();
        let connect_err = |source| TransportError::Connect {
            path: path.to_path_buf(),
            source,
        };
        let stream = UnixStream::connect(path).map_err(connect_err)?;
        debug!(?path, "connected to peer socket");
        DuplexStream::from_unix(stream).map_err(connect_err)
    }

    /// The path this socket is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UnixDomainSocket {
    fn drop(&mut self) {
        let (dev, ino) = self.created_inode;
        match std::fs::symlink_metadata(&self.path) {
            Ok(metadata)
                if metadata.file_type().is_socket()
                    && metadata.dev() == dev
                    && metadata.ino() == ino =>
            {
                debug!(path = ?self.path, "removing socket file");
                let _ = std::fs::remove_file(&self.path);
            }
            Ok(_) => debug!(path = ?self.path, "socket path replaced; leaving it"),
            Err(_) => {}
        }
    }
}

fn check_path_len(path: &Path) -> Result<()> {
    let len = path.as_os_str().len();
    if len >= UnixDomainSocket::MAX_PATH_LEN {
        return Err(TransportError::PathTooLong {
            path: path.to_path_buf(),
            len,
            max: UnixDomainSocket::MAX_PATH_LEN,
        });
    }
    Ok(())
}
