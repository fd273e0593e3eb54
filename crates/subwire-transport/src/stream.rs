use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::debug;

use crate::error::{Result, TransportError};

/// A connected full-duplex byte stream.
///
/// This is the I/O type the client and the broker speak the protocol over.
pub struct WireStream {
    inner: WireStreamInner,
}

enum WireStreamInner {
    Tcp(TcpStream),
    Stdio {
        stdin: tokio::io::Stdin,
        stdout: tokio::io::Stdout,
    },
    Duplex(DuplexStream),
    Child {
        // Held so the process is killed when the stream is dropped.
        _child: Child,
        stdin: ChildStdin,
        stdout: ChildStdout,
    },
}

impl WireStream {
    /// Connect to a TCP endpoint.
    pub async fn connect_tcp(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::Connect {
                addr: addr.to_string(),
                source: e,
            })?;
        let _ = stream.set_nodelay(true);
        debug!(addr, "connected over tcp");
        Ok(Self::from_tcp(stream))
    }

    /// Wrap the current process's stdin (read half) and stdout (write half).
    pub fn stdio() -> Self {
        Self {
            inner: WireStreamInner::Stdio {
                stdin: tokio::io::stdin(),
                stdout: tokio::io::stdout(),
            },
        }
    }

    /// Create a connected in-process pair. Bytes written to one end are read
    /// from the other; `capacity` bounds the bytes buffered per direction.
    pub fn pipe(capacity: usize) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(capacity);
        (
            Self {
                inner: WireStreamInner::Duplex(a),
            },
            Self {
                inner: WireStreamInner::Duplex(b),
            },
        )
    }

    /// Spawn `program` and speak over its stdin/stdout. Its stderr is inherited.
    pub fn spawn<I, S>(program: &str, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let spawn_error = |source| TransportError::Spawn {
            program: program.to_string(),
            source,
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        let missing = |what: &str| {
            spawn_error(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("child {what} was not captured"),
            ))
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;

        debug!(program, pid = ?child.id(), "spawned child carrier");
        Ok(Self {
            inner: WireStreamInner::Child {
                _child: child,
                stdin,
                stdout,
            },
        })
    }

    pub(crate) fn from_tcp(stream: TcpStream) -> Self {
        Self {
            inner: WireStreamInner::Tcp(stream),
        }
    }

    /// Carrier name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match &self.inner {
            WireStreamInner::Tcp(_) => "tcp",
            WireStreamInner::Stdio { .. } => "stdio",
            WireStreamInner::Duplex(_) => "pipe",
            WireStreamInner::Child { .. } => "child",
        }
    }
}

impl AsyncRead for WireStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            WireStreamInner::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            WireStreamInner::Stdio { stdin, .. } => Pin::new(stdin).poll_read(cx, buf),
            WireStreamInner::Duplex(stream) => Pin::new(stream).poll_read(cx, buf),
            WireStreamInner::Child { stdout, .. } => Pin::new(stdout).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for WireStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().inner {
            WireStreamInner::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            WireStreamInner::Stdio { stdout, .. } => Pin::new(stdout).poll_write(cx, buf),
            WireStreamInner::Duplex(stream) => Pin::new(stream).poll_write(cx, buf),
            WireStreamInner::Child { stdin, .. } => Pin::new(stdin).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            WireStreamInner::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            WireStreamInner::Stdio { stdout, .. } => Pin::new(stdout).poll_flush(cx),
            WireStreamInner::Duplex(stream) => Pin::new(stream).poll_flush(cx),
            WireStreamInner::Child { stdin, .. } => Pin::new(stdin).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            WireStreamInner::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            WireStreamInner::Stdio { stdout, .. } => Pin::new(stdout).poll_shutdown(cx),
            WireStreamInner::Duplex(stream) => Pin::new(stream).poll_shutdown(cx),
            WireStreamInner::Child { stdin, .. } => Pin::new(stdin).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for WireStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireStream")
            .field("type", &self.transport_name())
            .finish()
    }
}
