//! Connection handshake: INFO, CONNECT, PING/PONG
//!
//! The server speaks first with `INFO`. The client answers with `CONNECT`
//! followed by `PING`; a `PONG` means the server accepted the options and
//! credentials, while `-ERR` before the `PONG` is a rejection.

use crate::config::{ConnectOptions, Credentials};
use crate::protocol::codec::{ClientOp, CodecError, StreamDecoder};
use crate::protocol::messages::{ConnectInfo, ServerInfo};
use crate::protocol::ServerOp;
use crate::transport::{ServerAddress, SocketTransport};
use bytes::BytesMut;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum HandshakeError {
    /// `-ERR` during the handshake, usually an authorization failure
    #[error("server rejected connection: {0}")]
    Rejected(String),
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("I/O error during handshake: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error during handshake: {0}")]
    Protocol(#[from] CodecError),
    #[error("server requires TLS")]
    TlsRequired,
}

impl HandshakeError {
    /// Whether another attempt can succeed without configuration changes
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandshakeError::Timeout(_) | HandshakeError::Io(_))
    }
}

/// Build the CONNECT body. Userinfo in the server URL overrides configured
/// credentials; a user without a password is sent as a token.
pub fn build_connect_info(
    options: &ConnectOptions,
    credentials: &Credentials,
    address: &ServerAddress,
) -> ConnectInfo {
    let (auth_token, user, password) = match (address.user(), address.password()) {
        (Some(user), Some(password)) => (None, Some(user.to_string()), Some(password.to_string())),
        (Some(token), None) => (Some(token.to_string()), None, None),
        _ => (
            credentials.token.clone(),
            credentials.user.clone(),
            credentials.password.clone(),
        ),
    };

    ConnectInfo {
        verbose: options.verbose,
        pedantic: options.pedantic,
        name: options.name.clone(),
        echo: !options.no_echo,
        headers: true,
        no_responders: true,
        auth_token,
        user,
        password,
        ..Default::default()
    }
}

/// Open a socket and complete the handshake, all within `timeout`
///
/// Bytes the server sent after the final `PONG` stay in `decoder` for the engine.
pub async fn connect(
    address: &ServerAddress,
    connect_info: &ConnectInfo,
    timeout: Duration,
    decoder: &mut StreamDecoder<ServerOp>,
) -> Result<(SocketTransport, ServerInfo), HandshakeError> {
    decoder.clear();
    tokio::time::timeout(timeout, async {
        let mut transport = SocketTransport::connect(address, timeout).await?;
        let info = negotiate(&mut transport, connect_info, decoder).await?;
        Ok((transport, info))
    })
    .await
    .map_err(|_| HandshakeError::Timeout(timeout))?
}

async fn negotiate(
    transport: &mut SocketTransport,
    connect_info: &ConnectInfo,
    decoder: &mut StreamDecoder<ServerOp>,
) -> Result<ServerInfo, HandshakeError> {
    let info = match next_op(transport, decoder).await? {
        ServerOp::Info(info) => *info,
        ServerOp::Err(reason) => return Err(HandshakeError::Rejected(reason)),
        other => {
            return Err(HandshakeError::Protocol(CodecError::UnknownOp(format!(
                "expected INFO, got {other:?}"
            ))))
        }
    };
    if info.tls_required {
        return Err(HandshakeError::TlsRequired);
    }
    debug!(
        peer = %transport.peer_addr(),
        server_id = %info.server_id,
        version = %info.version,
        max_payload = info.max_payload,
        headers = info.headers,
        "received server INFO"
    );
    decoder.set_max_payload(info.max_payload);

    let mut out = BytesMut::new();
    ClientOp::Connect(Box::new(connect_info.clone())).encode(&mut out)?;
    ClientOp::Ping.encode(&mut out)?;
    transport.write_all(&out).await?;

    loop {
        match next_op(transport, decoder).await? {
            ServerOp::Pong => return Ok(info),
            ServerOp::Ok | ServerOp::Info(_) => {}
            ServerOp::Ping => transport.write_all(b"PONG\r\n").await?,
            ServerOp::Err(reason) => return Err(HandshakeError::Rejected(reason)),
            ServerOp::Msg { .. } => {
                return Err(HandshakeError::Protocol(CodecError::UnknownOp(
                    "MSG before handshake completed".to_string(),
                )))
            }
        }
    }
}

async fn next_op(
    transport: &mut SocketTransport,
    decoder: &mut StreamDecoder<ServerOp>,
) -> Result<ServerOp, HandshakeError> {
    loop {
        if let Some(op) = decoder.next_frame()? {
            return Ok(op);
        }
        if transport.read_some(decoder.buffer_mut()).await? == 0 {
            return Err(HandshakeError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed the connection during handshake",
            )));
        }
    }
}
