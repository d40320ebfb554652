use std::{
    net::SocketAddr,
    ops::DerefMut,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use super::tls::{TlsConfig, TlsStream};
use crate::{
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
    runtime,
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_TIME: Duration = Duration::from_secs(120);

/// A stream to a MongoDB server, possibly using TLS.
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
pub(crate) enum AsyncStream {
    /// A placeholder stream, used to move a live stream out of a connection being dropped.
    Null,

    /// A basic TCP connection to the server.
    Tcp(TcpStream),

    /// A TLS connection over TCP.
    Tls(TlsStream),
}

/// Opens one TCP socket, bounded by the connect timeout, and applies the driver's socket
/// options: Nagle off, keepalive on.
async fn try_connect(address: &SocketAddr, connect_timeout: Duration) -> Result<TcpStream> {
    let connecting = TcpStream::connect(address);
    let stream = if connect_timeout.is_zero() {
        connecting.await?
    } else {
        runtime::timeout(connect_timeout, connecting).await??
    };

    stream.set_nodelay(true)?;

    // Keepalive configuration goes through socket2, which means a round-trip out of tokio and
    // back.
    let raw = socket2::Socket::from(stream.into_std()?);
    raw.set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME))?;
    Ok(TcpStream::from_std(raw.into())?)
}

/// Resolves the address and tries each result in turn, IPv4 first (as most drivers prefer),
/// reporting the final attempt's failure if none connects.
async fn tcp_connect(
    address: &ServerAddress,
    connect_timeout: Option<Duration>,
) -> Result<TcpStream> {
    let timeout = connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);

    let no_results = || {
        Error::from(ErrorKind::DnsResolve {
            message: format!("address {} did not resolve to any hosts", address),
        })
    };

    let mut resolved = runtime::AsyncResolver::resolve_address(address).await?;
    resolved.sort_by_key(SocketAddr::is_ipv6);

    let mut last_failure = None;
    for socket_addr in &resolved {
        match try_connect(socket_addr, timeout).await {
            Ok(stream) => return Ok(stream),
            Err(failure) => last_failure = Some(failure),
        }
    }

    Err(last_failure.unwrap_or_else(no_results))
}

impl AsyncStream {
    /// Creates a new stream connected to the given address, wrapping it with TLS when a config is
    /// provided.
    pub(crate) async fn connect(
        address: &ServerAddress,
        connect_timeout: Option<Duration>,
        tls_config: Option<&TlsConfig>,
    ) -> Result<Self> {
        let inner = tcp_connect(address, connect_timeout).await?;

        match tls_config {
            Some(cfg) => Ok(Self::Tls(cfg.wrap(address.host(), inner).await?)),
            None => Ok(Self::Tcp(inner)),
        }
    }
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
            Self::Tls(ref mut inner) => Pin::new(inner).poll_read(cx, buf),
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
            Self::Tls(ref mut inner) => Pin::new(inner).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(())),
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_flush(cx),
            Self::Tls(ref mut inner) => Pin::new(inner).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(())),
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_shutdown(cx),
            Self::Tls(ref mut inner) => Pin::new(inner).poll_shutdown(cx),
        }
    }
}
