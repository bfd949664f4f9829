//! The byte streams connections run over, and the seam through which they are opened.

use std::{
    fmt::Debug,
    net::SocketAddr,
    ops::DerefMut,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures_util::future::BoxFuture;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use crate::{
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
};

#[cfg(not(target_os = "wasi"))]
const KEEPALIVE_TIME: Duration = Duration::from_secs(120);

/// Any bidirectional byte stream a [`StreamFactory`] can hand out.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin + Debug {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + Debug> StreamIo for T {}

/// An open stream to a server.
#[derive(Debug)]
#[non_exhaustive]
pub enum AsyncStream {
    /// A stream that has been taken or closed. Reads see end of file and writes are dropped.
    Null,

    /// A TCP connection to the server.
    Tcp(TcpStream),

    /// A stream supplied by a custom factory, such as an in-process pipe.
    Custom(Box<dyn StreamIo>),
}

impl AsyncStream {
    /// Wraps a stream produced outside this crate.
    pub fn custom(stream: impl StreamIo + 'static) -> Self {
        Self::Custom(Box::new(stream))
    }
}

/// Opens streams to servers. The default factory connects over plain TCP; tests and embedders
/// can supply their own.
pub trait StreamFactory: Send + Sync + 'static {
    /// Opens a stream to `address`. The caller bounds the returned future with the connect
    /// timeout.
    fn connect<'a>(&'a self, address: &'a ServerAddress) -> BoxFuture<'a, Result<AsyncStream>>;
}

/// Connects over TCP with `TCP_NODELAY` and keepalive enabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpStreamFactory;

impl StreamFactory for TcpStreamFactory {
    fn connect<'a>(&'a self, address: &'a ServerAddress) -> BoxFuture<'a, Result<AsyncStream>> {
        Box::pin(async move {
            let resolved: Vec<SocketAddr> =
                tokio::net::lookup_host((address.host(), address.port()))
                    .await?
                    .collect();
            if resolved.is_empty() {
                return Err(Error::not_established(format!(
                    "No DNS results for domain {address}"
                )));
            }
            Ok(AsyncStream::Tcp(tcp_connect(resolved).await?))
        })
    }
}

async fn tcp_try_connect(address: &SocketAddr) -> Result<TcpStream> {
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;

    #[cfg(not(target_os = "wasi"))]
    {
        let sock_ref = socket2::SockRef::from(&stream);
        let conf = socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME);
        sock_ref.set_tcp_keepalive(&conf)?;
    }

    Ok(stream)
}

/// Tries each resolved address in turn, alternating between IPv6 and IPv4, and returns the first
/// connection that succeeds or the first error.
async fn tcp_connect(resolved: Vec<SocketAddr>) -> Result<TcpStream> {
    let (v6, v4): (Vec<_>, Vec<_>) = resolved.into_iter().partition(SocketAddr::is_ipv6);

    let mut first_error = None;
    for address in interleave(v6, v4) {
        match tcp_try_connect(&address).await {
            Ok(stream) => return Ok(stream),
            Err(error) => {
                tracing::trace!(%address, %error, "TCP connect attempt failed");
                first_error.get_or_insert(error);
            }
        }
    }

    Err(first_error.unwrap_or_else(|| {
        ErrorKind::Internal {
            message: "connecting to all DNS results failed but no error reported".to_string(),
        }
        .into()
    }))
}

fn interleave<T>(left: Vec<T>, right: Vec<T>) -> Vec<T> {
    let mut out = Vec::with_capacity(left.len() + right.len());
    let (mut left, mut right) = (left.into_iter(), right.into_iter());
    while let Some(a) = left.next() {
        out.push(a);
        std::mem::swap(&mut left, &mut right);
    }
    out.extend(right);
    out
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(())),
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_read(cx, buf),
            Self::Custom(ref mut inner) => Pin::new(inner).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(0)),
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_write(cx, buf),
            Self::Custom(ref mut inner) => Pin::new(inner).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(())),
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_flush(cx),
            Self::Custom(ref mut inner) => Pin::new(inner).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(())),
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_shutdown(cx),
            Self::Custom(ref mut inner) => Pin::new(inner).poll_shutdown(cx),
        }
    }
}
