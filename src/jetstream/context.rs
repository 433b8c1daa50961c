use super::stream::{Stream, StreamConfig, StreamInfo};
use super::{decode_response, is_not_found, validate_name, STREAM_NOT_FOUND};
use crate::client::Client;
use crate::error::{ClientError, ClientResult, TimeoutKind};
use crate::protocol::HeaderMap;
use crate::subscription::Subscription;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_API_PREFIX: &str = "$JS.API";

/// How long API calls and publish acknowledgements are awaited
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle for JetStream operations on one connection
///
/// Clones share the connection but not the timeout.
#[derive(Clone)]
pub struct JetStream {
    client: Client,
    prefix: String,
    timeout: Duration,
}

impl fmt::Debug for JetStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JetStream")
            .field("prefix", &self.prefix)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Server confirmation that a publish was stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishAck {
    pub stream: String,
    #[serde(rename = "seq")]
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    /// The message id was seen inside the stream's duplicate window
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
    /// Running total of counter streams
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeleteStatus {
    success: bool,
}

impl JetStream {
    pub(crate) fn new(client: Client) -> Self {
        Self {
            client,
            prefix: DEFAULT_API_PREFIX.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Address the API of another JetStream domain (`$JS.<domain>.API`)
    pub fn with_domain(mut self, domain: &str) -> Self {
        self.prefix = format!("$JS.{domain}.API");
        self
    }

    /// Use a custom API prefix, e.g. one imported from another account
    pub fn with_api_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.trim_end_matches('.').to_string();
        self
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn api_prefix(&self) -> &str {
        &self.prefix
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Call `<prefix>.<endpoint>` and decode the reply
    pub(crate) fn api_request<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &[u8],
    ) -> ClientResult<T> {
        let subject = format!("{}.{endpoint}", self.prefix);
        let reply = self.client.request(&subject, body, self.timeout)?;
        decode_response(&reply.payload)
    }

    pub(crate) fn api_request_json<B: Serialize, T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> ClientResult<T> {
        let body = serde_json::to_vec(body)?;
        self.api_request(endpoint, &body)
    }

    /// Publish and return a handle for the server's acknowledgement
    ///
    /// The publish is buffered like any other; the ack is awaited only when
    /// [`PublishAckFuture::wait`] is called, so many publishes can be in flight.
    pub fn publish(&self, subject: &str, payload: impl AsRef<[u8]>) -> ClientResult<PublishAckFuture> {
        self.publish_message(subject, None, payload.as_ref())
    }

    /// Publish with headers, e.g. [`super::MSG_ID_HEADER`] for deduplication
    pub fn publish_with_headers(
        &self,
        subject: &str,
        headers: &HeaderMap,
        payload: impl AsRef<[u8]>,
    ) -> ClientResult<PublishAckFuture> {
        self.publish_message(subject, Some(headers), payload.as_ref())
    }

    fn publish_message(
        &self,
        subject: &str,
        headers: Option<&HeaderMap>,
        payload: &[u8],
    ) -> ClientResult<PublishAckFuture> {
        let inbox = self.client.new_inbox();
        let subscription = self.client.subscribe(&inbox)?;
        self.client.unsubscribe_after(&subscription, 1)?;
        let published = match headers {
            Some(headers) => self
                .client
                .publish_with_reply_and_headers(subject, &inbox, headers, payload),
            None => self.client.publish_with_reply(subject, &inbox, payload),
        };
        if let Err(e) = published {
            self.client.unsubscribe(&subscription)?;
            return Err(e);
        }
        Ok(PublishAckFuture {
            client: self.client.clone(),
            subscription,
            timeout: self.timeout,
        })
    }

    /// Look up a stream, creating it from `config` if it does not exist
    pub fn get_or_create_stream(&self, config: StreamConfig) -> ClientResult<Stream> {
        match self.get_stream(&config.name) {
            Err(e) if is_not_found(&e, STREAM_NOT_FOUND) => {
                debug!(stream = %config.name, "stream not found, creating");
                self.create_stream(config)
            }
            other => other,
        }
    }

    pub fn create_stream(&self, config: StreamConfig) -> ClientResult<Stream> {
        validate_name("stream", &config.name)?;
        let info: StreamInfo =
            self.api_request_json(&format!("STREAM.CREATE.{}", config.name), &config)?;
        Ok(Stream::new(self.clone(), info))
    }

    pub fn get_stream(&self, name: &str) -> ClientResult<Stream> {
        let info = self.stream_info(name)?;
        Ok(Stream::new(self.clone(), info))
    }

    pub(crate) fn stream_info(&self, name: &str) -> ClientResult<StreamInfo> {
        validate_name("stream", name)?;
        self.api_request(&format!("STREAM.INFO.{name}"), b"")
    }

    /// Delete a stream and every message in it; returns the server's verdict
    pub fn delete_stream(&self, name: &str) -> ClientResult<bool> {
        validate_name("stream", name)?;
        let status: DeleteStatus = self.api_request(&format!("STREAM.DELETE.{name}"), b"")?;
        Ok(status.success)
    }
}

/// Acknowledgement of a [`JetStream::publish`] still to arrive
pub struct PublishAckFuture {
    client: Client,
    subscription: Subscription,
    timeout: Duration,
}

impl fmt::Debug for PublishAckFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishAckFuture")
            .field("inbox", &self.subscription.subject())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl PublishAckFuture {
    /// Wait for the acknowledgement
    ///
    /// `NoResponders` means no stream captures the subject.
    pub fn wait(self) -> ClientResult<PublishAck> {
        match self.subscription.next_message(Some(self.timeout)) {
            Ok(message) if message.status == Some(503) => Err(ClientError::NoResponders),
            Ok(message) => decode_response(&message.payload),
            Err(ClientError::TimedOut(_)) => {
                self.client.unsubscribe(&self.subscription)?;
                Err(ClientError::TimedOut(TimeoutKind::Request))
            }
            Err(other) => Err(other),
        }
    }
}
