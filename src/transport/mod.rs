//! Socket transport for the I/O engine
//!
//! A [`SocketTransport`] owns exactly one TCP connection. Reconnecting creates a new
//! transport; the previous one is dropped with its socket. All reads and writes on
//! the engine's hot path are non-blocking (`try_*`), driven by tokio readiness.

use bytes::BytesMut;
use percent_encoding::percent_decode_str;
use std::borrow::Cow;
use std::fmt;
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::TcpStream;
use url::Url;

/// Default NATS client port
pub const DEFAULT_PORT: u16 = 4222;

/// Read chunk reserved in the decoder buffer before each read
const READ_CHUNK: usize = 64 * 1024;

/// Parsed server endpoint, with credentials taken from URL userinfo
#[derive(Clone, PartialEq, Eq)]
pub struct ServerAddress {
    host: String,
    port: u16,
    user: Option<String>,
    password: Option<String>,
}

impl ServerAddress {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Username, or token when the userinfo has no password part
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Host as it appears in a URL; IPv6 literals are bracketed
    fn url_host(&self) -> Cow<'_, str> {
        if self.host.contains(':') {
            Cow::Owned(format!("[{}]", self.host))
        } else {
            Cow::Borrowed(&self.host)
        }
    }

    /// `host:port` without credentials
    pub fn authority(&self) -> String {
        format!("{}:{}", self.url_host(), self.port)
    }
}

impl fmt::Debug for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerAddress")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("has_credentials", &self.user.is_some())
            .finish()
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nats://{}", self.authority())
    }
}

impl FromStr for ServerAddress {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err("server address is empty".to_string());
        }
        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("nats://{trimmed}")
        };

        let url = Url::parse(&with_scheme).map_err(|e| format!("invalid server address: {e}"))?;
        match url.scheme() {
            "nats" => {}
            "tls" => return Err("TLS connections are not supported".to_string()),
            other => return Err(format!("unsupported scheme: {other}")),
        }

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| "server address has no host".to_string())?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port().unwrap_or(DEFAULT_PORT);

        let user = Some(url.username())
            .filter(|user| !user.is_empty())
            .map(decode_userinfo);
        let password = url.password().map(decode_userinfo);

        Ok(Self {
            host,
            port,
            user,
            password,
        })
    }
}

/// Percent-decode a userinfo component (`url` keeps it encoded)
fn decode_userinfo(part: &str) -> String {
    percent_decode_str(part).decode_utf8_lossy().into_owned()
}

/// Socket readiness reported by the multiplexer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Peer closed its write half or the socket errored
    pub closed: bool,
}

/// Result of a non-blocking read
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    WouldBlock,
    Closed,
}

/// One TCP connection to a NATS server
#[derive(Debug)]
pub struct SocketTransport {
    stream: TcpStream,
    peer: SocketAddr,
}

impl SocketTransport {
    /// Resolve and connect, bounded by `timeout`
    pub async fn connect(address: &ServerAddress, timeout: Duration) -> io::Result<Self> {
        let authority = address.authority();
        let stream = tokio::time::timeout(timeout, TcpStream::connect(authority.as_str()))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TCP connect timed out"))??;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        Ok(Self { stream, peer })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Wait until the socket is ready for any of the requested directions
    pub async fn readiness(&self, want_write: bool) -> io::Result<Readiness> {
        let interest = if want_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let ready = self.stream.ready(interest).await?;
        Ok(Readiness {
            readable: ready.is_readable(),
            writable: ready.is_writable(),
            closed: ready.is_read_closed() || ready.is_write_closed(),
        })
    }

    /// Non-blocking gather write; `Ok(0)` means the socket would block
    pub fn try_write_vectored(&self, slices: &[IoSlice<'_>]) -> io::Result<usize> {
        match self.stream.try_write_vectored(slices) {
            Ok(written) => Ok(written),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Non-blocking read appended to `buffer`
    pub fn try_read(&self, buffer: &mut BytesMut) -> io::Result<ReadOutcome> {
        buffer.reserve(READ_CHUNK);
        match self.stream.try_read_buf(buffer) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(read) => Ok(ReadOutcome::Data(read)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
            Err(e) => Err(e),
        }
    }

    /// Awaiting read used during the handshake
    pub async fn read_some(&mut self, buffer: &mut BytesMut) -> io::Result<usize> {
        buffer.reserve(READ_CHUNK);
        self.stream.read_buf(buffer).await
    }

    /// Awaiting write used during the handshake
    pub async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}
