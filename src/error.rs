//! Error taxonomy for the blocking NATS client
//!
//! Every public operation returns [`ClientResult`]. Transient network failures are
//! absorbed by the I/O engine's reconnect logic; only fatal conditions (protocol
//! violations, authorization failures, exhausted retry budgets) are surfaced, and
//! they are surfaced to every caller operation after the fact.

use crate::protocol::codec::CodecError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use thiserror::Error;

/// Which deadline expired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Flush,
    Handshake,
    Request,
    NextMessage,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TimeoutKind::Flush => "flush",
            TimeoutKind::Handshake => "handshake",
            TimeoutKind::Request => "request",
            TimeoutKind::NextMessage => "next message",
        };
        f.write_str(name)
    }
}

/// Main error type for client operations
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Handshake or authorization failure. Not retried.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Socket failure. Only surfaced once the reconnect budget is exhausted.
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// Malformed or oversized frame from the server. The connection is torn down.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Outbound buffer full: {queued} bytes queued, ceiling is {ceiling} bytes")]
    BufferFull { queued: usize, ceiling: usize },

    #[error("Timed out waiting for {0}")]
    TimedOut(TimeoutKind),

    #[error("Client is closed")]
    Closed,

    #[error("Payload of {size} bytes exceeds server maximum of {max} bytes")]
    MaxPayloadExceeded { size: usize, max: usize },

    #[error("Invalid subject: {0}")]
    InvalidSubject(String),

    #[error("Server does not support message headers")]
    HeadersNotSupported,

    #[error("No responders available for request")]
    NoResponders,

    /// Messages of handler subscriptions are delivered to the handler, not read
    #[error("Subscription delivers to a handler and has no message queue")]
    HandlerSubscription,

    #[error("Notification bridge error: {0}")]
    Notification(#[source] Arc<std::io::Error>),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Error reply from the JetStream API
    #[error("JetStream error {code} ({err_code}): {description}")]
    JetStream {
        code: u16,
        err_code: u64,
        description: String,
    },

    /// JetStream reply that could not be decoded
    #[error("Invalid JetStream response: {0}")]
    JetStreamResponse(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Consumer exists but is not a pull consumer
    #[error("Unsupported consumer: {0}")]
    UnsupportedConsumer(String),
}

impl ClientError {
    /// Create connection error with sanitized text
    pub fn connection<S: AsRef<str>>(message: S) -> Self {
        Self::Connection(sanitize_error_message(message.as_ref()))
    }

    /// Create transient I/O error with sanitized text
    pub fn transient_io<S: AsRef<str>>(message: S) -> Self {
        Self::TransientIo(sanitize_error_message(message.as_ref()))
    }

    /// Create protocol violation error
    pub fn protocol_violation<S: Into<String>>(message: S) -> Self {
        Self::ProtocolViolation(message.into())
    }

    /// Errors that end the client's life rather than a single operation
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Connection(_)
                | ClientError::ProtocolViolation(_)
                | ClientError::TransientIo(_)
        )
    }
}

impl From<CodecError> for ClientError {
    fn from(err: CodecError) -> Self {
        ClientError::ProtocolViolation(err.to_string())
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Notification(Arc::new(err))
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::JetStreamResponse(err.to_string())
    }
}

impl From<crate::config::ConfigError> for ClientError {
    fn from(err: crate::config::ConfigError) -> Self {
        ClientError::Config(err.to_string())
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(password|pass|token|auth_token|secret)("?\s*[=:]\s*"?)[^\s",}]+"#)
        .expect("static pattern is valid")
});

static URL_USERINFO_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([a-z]+://)[^/@\s]+@").expect("static pattern is valid"));

/// Redact credentials from text that may have come from the server or a URL
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = SECRET_PATTERN.replace_all(message, "${1}${2}***");
    let mut sanitized = URL_USERINFO_PATTERN
        .replace_all(&sanitized, "${1}***@")
        .to_string();

    // Truncate very long messages - ensure total length is <= 500
    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;
