use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Closes the underlying connection of a [`DuplexStream`].
///
/// Called at most once, when the endpoint that owns the stream closes.
pub trait Closer: Send {
    fn close(&mut self) -> io::Result<()>;
}

impl<F> Closer for F
where
    F: FnMut() -> io::Result<()> + Send,
{
    fn close(&mut self) -> io::Result<()> {
        self()
    }
}

/// A connected duplex byte stream, split into its three parts.
///
/// The reader is owned by the serve loop, the writer by the endpoint's write
/// path, and the closer by whoever tears the connection down.
pub struct DuplexStream {
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    closer: Option<Box<dyn Closer>>,
    kind: &'static str,
}

impl DuplexStream {
    /// Assemble a stream from caller-supplied parts.
    pub fn from_parts(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
        closer: Option<Box<dyn Closer>>,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            closer,
            kind: "attached",
        }
    }

    /// Use this process's stdin and stdout.
    ///
    /// Closing only stops further writes; the process's stdout itself stays open.
    pub fn stdio() -> Self {
        let writer = SharedWriter::new(io::stdout());
        let closer = writer.closer();
        Self {
            reader: Box::new(io::stdin()),
            writer: Box::new(writer),
            closer: Some(Box::new(closer)),
            kind: "stdio",
        }
    }

    /// Wrap a connected Unix stream. Closing shuts down both directions,
    /// which also unblocks a reader parked on the other clone.
    #[cfg(unix)]
    pub fn from_unix(stream: std::os::unix::net::UnixStream) -> io::Result<Self> {
        let reader = stream.try_clone()?;
        let shutdown = stream.try_clone()?;
        Ok(Self {
            reader: Box::new(reader),
            writer: Box::new(stream),
            closer: Some(Box::new(move || match shutdown.shutdown(std::net::Shutdown::Both) {
                Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
                other => other,
            })),
            kind: "unix",
        })
    }

    pub(crate) fn with_kind(mut self, kind: &'static str) -> Self {
        self.kind = kind;
        self
    }

    /// Transport name for diagnostics.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Split into reader, writer, and closer.
    #[allow(clippy::type_complexity)]
    pub fn into_parts(
        self,
    ) -> (
        Box<dyn Read + Send>,
        Box<dyn Write + Send>,
        Option<Box<dyn Closer>>,
    ) {
        (self.reader, self.writer, self.closer)
    }
}

impl std::fmt::Debug for DuplexStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexStream")
            .field("type", &self.kind)
            .field("closable", &self.closer.is_some())
            .finish()
    }
}

/// A writer that can be closed from another handle.
///
/// Closing drops the inner writer (closing a pipe's write end, for example);
/// later writes fail with `BrokenPipe`.
pub struct SharedWriter<W> {
    inner: Arc<Mutex<Option<W>>>,
}

impl<W: Write + Send + 'static> SharedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(inner))),
        }
    }

    /// A closer that drops the inner writer.
    pub fn closer(&self) -> impl Closer + 'static {
        let inner = Arc::clone(&self.inner);
        move || -> io::Result<()> {
            if let Some(mut writer) = lock(&inner).take() {
                writer.flush()?;
            }
            Ok(())
        }
    }
}

impl<W: Write> Write for SharedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match lock(&self.inner).as_mut() {
            Some(writer) => writer.write(buf),
            None => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match lock(&self.inner).as_mut() {
            Some(writer) => writer.flush(),
            None => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
