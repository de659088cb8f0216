//! Launching a peer program as a child process.
//!
//! The child speaks the protocol on its stdin/stdout. `EmbeddedPeer` owns
//! the process, the endpoint over its pipes, and (optionally) the thread
//! running the serve loop.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Child, ExitStatus};
use std::sync::OnceLock;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use msgrpc_frame::Value;
use msgrpc_transport::{spawn_piped, ChildCommand};
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::error::{PeerError, Result};
use crate::options::EndpointOptions;

/// Method that returns `[channel_id, api_info]`.
pub const API_INFO_METHOD: &str = "nvim_get_api_info";

/// Program launched when none is configured.
pub const DEFAULT_PROGRAM: &str = "nvim";

/// Flag prepended to the child's arguments.
pub const EMBED_FLAG: &str = "--embed";

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How to launch an embedded peer.
#[derive(Debug, Clone)]
pub struct EmbedConfig {
    /// Program path, or a bare name looked up on `PATH`.
    pub program: PathBuf,
    /// Arguments passed after `--embed`.
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
    /// Start the child with only `env` in its environment.
    pub clear_env: bool,
    pub dir: Option<PathBuf>,
    /// How long `shutdown` waits for the child to exit before killing it.
    pub shutdown_timeout: Duration,
    /// Run the serve loop on a background thread.
    pub serve: bool,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_PROGRAM),
            args: Vec::new(),
            env: Vec::new(),
            clear_env: false,
            dir: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            serve: true,
        }
    }
}

impl EmbedConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_clear_env(mut self, clear: bool) -> Self {
        self.clear_env = clear;
        self
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Whether `spawn` starts the serve loop. Without it the caller must
    /// run [`Endpoint::serve`] before any call can complete.
    pub fn with_serve(mut self, serve: bool) -> Self {
        self.serve = serve;
        self
    }

    fn command(&self) -> ChildCommand {
        let mut args = Vec::with_capacity(self.args.len() + 1);
        args.push(OsString::from(EMBED_FLAG));
        args.extend(self.args.iter().cloned());
        ChildCommand {
            program: self.program.clone(),
            args,
            env: self.env.clone(),
            clear_env: self.clear_env,
            dir: self.dir.clone(),
        }
    }
}

/// Ask the peer which channel this connection is.
pub fn channel_id(endpoint: &Endpoint) -> Result<i64> {
    let (channel, _info): (i64, Value) = endpoint.call(API_INFO_METHOD, ())?;
    Ok(channel)
}

/// A peer running as our child process.
///
/// Dropping it without [`shutdown`](Self::shutdown) kills the child.
pub struct EmbeddedPeer {
    endpoint: Endpoint,
    child: Child,
    serve: Option<JoinHandle<Result<()>>>,
    channel: OnceLock<i64>,
    shutdown_timeout: Duration,
    reaped: bool,
}

impl EmbeddedPeer {
    /// Launch the configured program and connect to it.
    pub fn spawn(config: &EmbedConfig, options: EndpointOptions) -> Result<Self> {
        let (mut child, stream) = spawn_piped(&config.command())?;
        let endpoint = Endpoint::new(stream, options);

        let serve = if config.serve {
            let serving = endpoint.clone();
            let spawned = thread::Builder::new()
                .name("msgrpc-serve".to_string())
                .spawn(move || serving.serve());
            match spawned {
                Ok(handle) => Some(handle),
                Err(err) => {
                    let _ = endpoint.close();
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(PeerError::Io(err));
                }
            }
        } else {
            None
        };

        info!(pid = child.id(), program = %config.program.display(), "embedded peer started");
        Ok(Self {
            endpoint,
            child,
            serve,
            channel: OnceLock::new(),
            shutdown_timeout: config.shutdown_timeout,
            reaped: false,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// This connection's channel id, asked once and cached.
    pub fn channel_id(&self) -> Result<i64> {
        if let Some(id) = self.channel.get() {
            return Ok(*id);
        }
        let id = channel_id(&self.endpoint)?;
        Ok(*self.channel.get_or_init(|| id))
    }

    /// Close the connection and wait for the child to exit, killing it if
    /// it outlives the shutdown timeout.
    pub fn shutdown(mut self) -> Result<ExitStatus> {
        match self.endpoint.close() {
            Ok(()) | Err(PeerError::Closed) => {}
            Err(err) => debug!(error = %err, "closing child pipes"),
        }

        let deadline = Instant::now() + self.shutdown_timeout;
        let status = loop {
            if let Some(status) = self.child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                warn!(
                    pid = self.child.id(),
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "embedded peer did not exit; killing it"
                );
                // Already exited between the poll and the kill is fine.
                let _ = self.child.kill();
                break self.child.wait()?;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        };
        self.reaped = true;

        if let Some(handle) = self.serve.take() {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(error = %err, "serve loop ended with error"),
                Err(_) => warn!("serve thread panicked"),
            }
        }

        info!(%status, "embedded peer exited");
        Ok(status)
    }
}

impl Drop for EmbeddedPeer {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        let _ = self.endpoint.close();
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl std::fmt::Debug for EmbeddedPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedPeer")
            .field("pid", &self.child.id())
            .field("endpoint", &self.endpoint)
            .field("serving", &self.serve.is_some())
            .finish()
    }
}
