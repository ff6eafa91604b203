use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use super::Addr;

/// A raw byte stream to a peer, over TCP or a Unix socket.
///
/// Wrap it with [`Conn::wrap`](super::Conn::wrap) to speak Messages.
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Listener accepting raw streams on a TCP or Unix address.
pub struct Listener {
    inner: Inner,
    /// Socket file to unlink when the listener goes away.
    unix_path: Option<PathBuf>,
}

enum Inner {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    /// Announce on `addr` and listen for connections.
    pub async fn bind(addr: &Addr) -> io::Result<Listener> {
        match addr {
            Addr::Tcp(spec) => {
                let listener = TcpListener::bind(spec.as_str()).await?;
                Ok(Listener {
                    inner: Inner::Tcp(listener),
                    unix_path: None,
                })
            }
            Addr::Unix(path) => {
                // A stale socket file from a previous run would make the bind
                // fail; a live listener on it is gone once we get here.
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)?;
                Ok(Listener {
                    inner: Inner::Unix(listener),
                    unix_path: Some(path.clone()),
                })
            }
        }
    }

    /// Wait for and return the next incoming stream.
    pub async fn accept(&self) -> io::Result<Stream> {
        match &self.inner {
            Inner::Tcp(l) => {
                let (stream, _) = l.accept().await?;
                Ok(Stream::Tcp(stream))
            }
            Inner::Unix(l) => {
                let (stream, _) = l.accept().await?;
                Ok(Stream::Unix(stream))
            }
        }
    }

    /// The actual bound address, resolving an ephemeral TCP port.
    pub fn local_addr(&self) -> io::Result<Addr> {
        match &self.inner {
            Inner::Tcp(l) => Ok(Addr::Tcp(l.local_addr()?.to_string())),
            Inner::Unix(_) => {
                let path = self.unix_path.clone().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::AddrNotAvailable, "unnamed unix socket")
                })?;
                Ok(Addr::Unix(path))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(path) = &self.unix_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Connect to `addr` and return the raw stream.
pub(super) async fn connect(addr: &Addr) -> io::Result<Stream> {
    match addr {
        Addr::Tcp(spec) => Ok(Stream::Tcp(TcpStream::connect(spec.as_str()).await?)),
        Addr::Unix(path) => Ok(Stream::Unix(UnixStream::connect(path).await?)),
    }
}
