//! Raw transport: TCP establishment and the in-band TLS upgrade.
use bytes::BytesMut;
use std::{
    io,
    net::SocketAddr,
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, lookup_host},
    time::timeout,
};

use crate::{
    Result, verbose,
    connection::{Config, SslMode},
    protocol::frontend::SslRequest,
};

mod tls;

pub use tls::{CertValidator, CertificateErrors};

/// The stream under the framed buffer, plaintext or TLS.
///
/// TLS is negotiated in-band: the preamble and the handshake run on the raw
/// TCP socket, then the socket is wrapped.
pub struct Stream {
    kind: Kind,
}

enum Kind {
    Tcp(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Stream {
    pub fn is_secure(&self) -> bool {
        matches!(self.kind, Kind::Tls(_))
    }
}

/// Tracks the total connect budget across DNS and per-address TCP attempts.
struct Deadline {
    end: Instant,
}

impl Deadline {
    fn new(total: Duration) -> Self {
        Self { end: Instant::now() + total }
    }

    fn remaining(&self) -> Duration {
        self.end.saturating_duration_since(Instant::now())
    }
}

/// Open the raw transport for `config`.
///
/// Resolves the host, tries each address with an equal share of the remaining
/// timeout, then performs the SSL negotiation preamble when requested. All
/// partially constructed sockets are dropped on failure.
pub(crate) async fn connect(config: &Config) -> Result<Stream> {
    let deadline = Deadline::new(config.timeout);

    // IPv6 addresses in URLs will be wrapped in brackets and we don't trim those.
    let host = config.host.trim_matches(&['[', ']'][..]);

    let addrs: Vec<SocketAddr> = timeout(deadline.remaining(), lookup_host((host, config.port)))
        .await
        .map_err(|_| TimeoutError { phase: "resolving host" })??
        .collect();

    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("host {host} resolved to no addresses"),
        )
        .into());
    }

    let total = addrs.len();
    let mut tcp = None;
    let mut last_err = None;

    for (done, addr) in addrs.into_iter().enumerate() {
        // partition what is left of the budget across the untried addresses
        let budget = deadline.remaining() / (total - done) as u32;
        verbose!("connecting to {addr} with budget {budget:?}");

        match timeout(budget, TcpStream::connect(addr)).await {
            Ok(Ok(socket)) => {
                tcp = Some(socket);
                break;
            }
            Ok(Err(err)) => last_err = Some(crate::Error::from(err)),
            Err(_) => last_err = Some(TimeoutError { phase: "connecting" }.into()),
        }
    }

    let Some(tcp) = tcp else {
        return Err(last_err.expect("at least one address was attempted"));
    };
    tcp.set_nodelay(true)?;

    if config.wants_ssl() {
        return negotiate_ssl(tcp, config).await;
    }

    Ok(Stream { kind: Kind::Tcp(tcp) })
}

/// Send the SSL preamble and upgrade on `'S'`.
///
/// Any other reply byte keeps the session plaintext, unless SSL is required
/// in which case the socket is dropped and open fails.
async fn negotiate_ssl(mut tcp: TcpStream, config: &Config) -> Result<Stream> {
    let mut buf = BytesMut::with_capacity(8);
    SslRequest.write(&mut buf);
    tcp.write_all(&buf).await?;

    let mut reply = [0u8; 1];
    tcp.read_exact(&mut reply).await?;
    verbose!("ssl negotiation reply {:?}", reply[0] as char);

    if reply[0] == b'S' {
        let tls = tls::handshake(tcp, config).await?;
        return Ok(Stream { kind: Kind::Tls(Box::new(tls)) });
    }

    if config.ssl_required() {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "server refused SSL and sslmode is Require",
        )
        .into());
    }

    Ok(Stream { kind: Kind::Tcp(tcp) })
}

/// Open a side transport and fire a single out of band cancel packet.
///
/// No startup and no authentication take place; the packet is trusted on the
/// strength of the backend secret key.
pub(crate) async fn send_cancel(config: &Config, packet: &[u8]) -> Result<()> {
    let mut stream = connect(config).await?;
    stream.write_all(packet).await?;
    stream.flush().await?;
    stream.shutdown().await.ok();
    Ok(())
}

impl tokio::io::AsyncRead for Stream {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        use std::pin::Pin;
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_read(cx, buf),
            Kind::Tls(t) => Pin::new(t.as_mut()).poll_read(cx, buf),
        }
    }
}

impl tokio::io::AsyncWrite for Stream {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        use std::pin::Pin;
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_write(cx, buf),
            Kind::Tls(t) => Pin::new(t.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        use std::pin::Pin;
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_flush(cx),
            Kind::Tls(t) => Pin::new(t.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        use std::pin::Pin;
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_shutdown(cx),
            Kind::Tls(t) => Pin::new(t.as_mut()).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            Kind::Tcp(t) => std::fmt::Debug::fmt(t, f),
            Kind::Tls(t) => std::fmt::Debug::fmt(t.get_ref().0, f),
        }
    }
}

/// The connect budget ran out.
pub struct TimeoutError {
    phase: &'static str,
}

impl std::error::Error for TimeoutError { }

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "timed out while {}", self.phase)
    }
}

impl std::fmt::Debug for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl Config {
    fn wants_ssl(&self) -> bool {
        self.ssl || matches!(self.ssl_mode, SslMode::Prefer | SslMode::Require)
    }

    fn ssl_required(&self) -> bool {
        self.ssl || matches!(self.ssl_mode, SslMode::Require)
    }
}
