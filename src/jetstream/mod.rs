//! JetStream over the core connection
//!
//! Everything here is request/reply on `$JS.API.>` subjects with JSON bodies.
//! A [`JetStream`] context is a cheap handle around a [`crate::Client`]; it owns
//! no extra threads or sockets.
//!
//! ```no_run
//! use blocking_nats::jetstream::{ConsumerConfig, StreamConfig};
//! use blocking_nats::Client;
//! use std::time::Duration;
//!
//! let client = Client::connect("nats://127.0.0.1:4222")?;
//! let jetstream = client.jetstream();
//! let stream = jetstream.get_or_create_stream(
//!     StreamConfig::new("ORDERS").with_subjects(["orders.>"]),
//! )?;
//! let ack = jetstream.publish("orders.created", "42")?.wait()?;
//! assert_eq!(ack.stream, "ORDERS");
//!
//! let consumer = stream.get_or_create_pull_consumer("worker", ConsumerConfig::durable("worker"))?;
//! for message in consumer.fetch(10, Duration::from_secs(1))? {
//!     message.ack()?;
//! }
//! # Ok::<(), blocking_nats::ClientError>(())
//! ```

mod consumer;
mod context;
mod message;
mod stream;

pub use consumer::{
    AckPolicy, ConsumerConfig, ConsumerInfo, DeliverPolicy, PullConsumer, PullMessages,
    PullRequest, ReplayPolicy, SequenceInfo, DEFAULT_PULL_BATCH, DEFAULT_PULL_EXPIRY,
};
pub use context::{JetStream, PublishAck, PublishAckFuture, DEFAULT_API_PREFIX, DEFAULT_TIMEOUT};
pub use message::{AckKind, JetStreamMessage, MessageInfo};
pub use stream::{
    DiscardPolicy, RetentionPolicy, StorageType, Stream, StreamConfig, StreamInfo, StreamState,
};

use crate::error::{ClientError, ClientResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Header carrying a publisher-chosen id for duplicate detection
pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";

/// Error body of a failed API call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: u16,
    #[serde(default)]
    pub err_code: u64,
    #[serde(default)]
    pub description: String,
}

/// `err_code` of a missing stream
pub const STREAM_NOT_FOUND: u64 = 10059;
/// `err_code` of a stream name reused with a different configuration
pub const STREAM_NAME_IN_USE: u64 = 10058;
/// `err_code` of a missing consumer
pub const CONSUMER_NOT_FOUND: u64 = 10014;

impl From<ApiError> for ClientError {
    fn from(error: ApiError) -> Self {
        ClientError::JetStream {
            code: error.code,
            err_code: error.err_code,
            description: error.description,
        }
    }
}

/// Either an error object or the expected body
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum ApiResponse<T> {
    Err { error: ApiError },
    Ok(T),
}

/// Decode an API reply, surfacing an embedded error object
pub(crate) fn decode_response<T: DeserializeOwned>(payload: &[u8]) -> ClientResult<T> {
    match serde_json::from_slice::<ApiResponse<T>>(payload)? {
        ApiResponse::Ok(body) => Ok(body),
        ApiResponse::Err { error } => Err(error.into()),
    }
}

/// True for the API's "no such stream/consumer" replies
pub(crate) fn is_not_found(error: &ClientError, err_code: u64) -> bool {
    matches!(error, ClientError::JetStream { code: 404, err_code: code, .. } if *code == err_code)
}

/// Stream and consumer names become subject tokens
pub(crate) fn validate_name(kind: &str, name: &str) -> ClientResult<()> {
    if name.is_empty() {
        return Err(ClientError::InvalidName(format!("{kind} name is empty")));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| matches!(c, '.' | '*' | '>' | '/' | '\\') || c.is_whitespace())
    {
        return Err(ClientError::InvalidName(format!(
            "{kind} name {name:?} contains {bad:?}"
        )));
    }
    Ok(())
}

/// `Duration` as the API's integer nanoseconds
pub(crate) mod nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let nanos = i64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(u64::try_from(nanos).unwrap_or(0)))
    }

    pub fn is_zero(duration: &Duration) -> bool {
        duration.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Success {
        success: bool,
    }

    #[test]
    fn test_error_object_becomes_client_error() {
        let reply = br#"{"type":"io.nats.jetstream.api.v1.stream_info_response","error":{"code":404,"err_code":10059,"description":"stream not found"}}"#;
        let error = decode_response::<Success>(reply).unwrap_err();
        assert!(is_not_found(&error, STREAM_NOT_FOUND));
        assert!(!is_not_found(&error, CONSUMER_NOT_FOUND));
        assert_eq!(error.to_string(), "JetStream error 404 (10059): stream not found");
    }

    #[test]
    fn test_body_without_error_decodes() {
        let reply = br#"{"type":"io.nats.jetstream.api.v1.stream_delete_response","success":true}"#;
        assert_eq!(decode_response::<Success>(reply).unwrap(), Success { success: true });
    }

    #[test]
    fn test_garbage_reply_is_reported() {
        assert!(matches!(
            decode_response::<Success>(b"not json"),
            Err(ClientError::JetStreamResponse(_))
        ));
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("stream", "ORDERS_v2").is_ok());
        for bad in ["", "a.b", "all*", "x>", "two words"] {
            assert!(
                matches!(validate_name("stream", bad), Err(ClientError::InvalidName(_))),
                "{bad:?} accepted"
            );
        }
    }
}
