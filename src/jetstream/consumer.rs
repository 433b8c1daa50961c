use super::context::JetStream;
use super::message::JetStreamMessage;
use super::nanos;
use crate::bridge::deadline_after;
use crate::error::{ClientError, ClientResult, TimeoutKind};
use crate::protocol::Message;
use crate::subscription::Subscription;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Where in the stream a new consumer starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverPolicy {
    #[default]
    All,
    Last,
    New,
    /// Starts at `opt_start_seq`
    ByStartSequence,
    LastPerSubject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    #[default]
    Explicit,
    None,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayPolicy {
    #[default]
    Instant,
    Original,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

/// Consumer configuration as sent to `CONSUMER.CREATE`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Durable consumers survive without active subscribers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durable_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Set on push consumers only; pull consumers are refused when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_subject: Option<String>,
    #[serde(default)]
    pub deliver_policy: DeliverPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opt_start_seq: Option<u64>,
    #[serde(default)]
    pub ack_policy: AckPolicy,
    #[serde(with = "nanos", default, skip_serializing_if = "nanos::is_zero")]
    pub ack_wait: Duration,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_deliver: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filter_subject: String,
    #[serde(default)]
    pub replay_policy: ReplayPolicy,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_waiting: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_ack_pending: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_batch: i64,
    #[serde(with = "nanos", default, skip_serializing_if = "nanos::is_zero")]
    pub inactive_threshold: Duration,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl ConsumerConfig {
    /// A durable pull consumer named `name`
    pub fn durable<S: Into<String>>(name: S) -> Self {
        Self {
            durable_name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_filter_subject<S: Into<String>>(mut self, subject: S) -> Self {
        self.filter_subject = subject.into();
        self
    }

    pub fn with_deliver_policy(mut self, policy: DeliverPolicy) -> Self {
        self.deliver_policy = policy;
        self
    }

    pub fn with_ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = policy;
        self
    }

    pub fn with_ack_wait(mut self, wait: Duration) -> Self {
        self.ack_wait = wait;
        self
    }

    pub fn with_max_deliver(mut self, max: i64) -> Self {
        self.max_deliver = max;
        self
    }
}

/// Consumer and stream sequence of a delivery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceInfo {
    #[serde(default)]
    pub consumer_seq: u64,
    #[serde(default)]
    pub stream_seq: u64,
}

/// Reply of `CONSUMER.INFO` and `CONSUMER.CREATE`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub stream_name: String,
    pub name: String,
    pub created: DateTime<Utc>,
    pub config: ConsumerConfig,
    #[serde(default)]
    pub delivered: SequenceInfo,
    #[serde(default)]
    pub ack_floor: SequenceInfo,
    #[serde(default)]
    pub num_ack_pending: u64,
    #[serde(default)]
    pub num_redelivered: u64,
    #[serde(default)]
    pub num_waiting: u64,
    /// Messages matching the filter not yet delivered
    #[serde(default)]
    pub num_pending: u64,
}

/// Body of a `CONSUMER.MSG.NEXT` pull request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub batch: usize,
    #[serde(with = "nanos", default, skip_serializing_if = "nanos::is_zero")]
    pub expires: Duration,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_wait: bool,
}

/// Status codes that end a pull request early
const NO_MESSAGES: u16 = 404;
const REQUEST_TIMEOUT: u16 = 408;
const IDLE_HEARTBEAT: u16 = 100;

/// What a delivery on a pull inbox means
enum PullEvent {
    Message(JetStreamMessage),
    /// The request is over: expired, or nothing left to deliver
    Finished,
    Heartbeat,
}

/// How long past its own expiry a pull request is given to finish
const EXPIRY_GRACE: Duration = Duration::from_millis(500);

/// Default `expires` of the pull requests behind [`PullConsumer::messages`]
pub const DEFAULT_PULL_EXPIRY: Duration = Duration::from_secs(30);

/// Default batch of the pull requests behind [`PullConsumer::messages`]
pub const DEFAULT_PULL_BATCH: usize = 200;

/// A consumer whose messages are requested in batches
#[derive(Debug, Clone)]
pub struct PullConsumer {
    context: JetStream,
    info: ConsumerInfo,
}

impl PullConsumer {
    pub(crate) fn from_info(context: JetStream, info: ConsumerInfo) -> ClientResult<Self> {
        if let Some(subject) = &info.config.deliver_subject {
            return Err(ClientError::UnsupportedConsumer(format!(
                "{} is a push consumer delivering to {subject}",
                info.name
            )));
        }
        Ok(Self { context, info })
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn stream_name(&self) -> &str {
        &self.info.stream_name
    }

    /// Info as of the last lookup
    pub fn cached_info(&self) -> &ConsumerInfo {
        &self.info
    }

    pub fn info(&mut self) -> ClientResult<&ConsumerInfo> {
        self.info = self.context.api_request(
            &format!("CONSUMER.INFO.{}.{}", self.info.stream_name, self.info.name),
            b"",
        )?;
        Ok(&self.info)
    }

    fn next_subject(&self) -> String {
        format!(
            "{}.CONSUMER.MSG.NEXT.{}.{}",
            self.context.api_prefix(),
            self.info.stream_name,
            self.info.name
        )
    }

    fn send_pull(&self, inbox: &str, request: &PullRequest) -> ClientResult<()> {
        let body = serde_json::to_vec(request)?;
        self.context
            .client()
            .publish_with_reply(&self.next_subject(), inbox, body)
    }

    /// Request up to `batch` messages and collect what arrives within `expires`
    ///
    /// Returns early once the batch is complete or the server reports that
    /// nothing more is available.
    pub fn fetch(&self, batch: usize, expires: Duration) -> ClientResult<Vec<JetStreamMessage>> {
        let client = self.context.client();
        let inbox = client.new_inbox();
        let subscription = client.subscribe(&inbox)?;
        let request = PullRequest {
            batch: batch.max(1),
            expires,
            no_wait: false,
        };
        let collected = self
            .send_pull(&inbox, &request)
            .and_then(|()| self.collect(&subscription, request.batch, expires));
        client.unsubscribe(&subscription)?;
        collected
    }

    fn collect(
        &self,
        subscription: &Subscription,
        batch: usize,
        expires: Duration,
    ) -> ClientResult<Vec<JetStreamMessage>> {
        let deadline = deadline_after(Some(expires.saturating_add(EXPIRY_GRACE)));
        let mut messages = Vec::with_capacity(batch.min(1024));
        while messages.len() < batch {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let delivery = match subscription.next_message(remaining) {
                Ok(delivery) => delivery,
                Err(ClientError::TimedOut(_)) => break,
                Err(e) => return Err(e),
            };
            match self.classify(delivery)? {
                PullEvent::Message(message) => messages.push(message),
                PullEvent::Finished => break,
                PullEvent::Heartbeat => {}
            }
        }
        debug!(consumer = self.name(), fetched = messages.len(), batch, "pull request done");
        Ok(messages)
    }

    fn classify(&self, delivery: Message) -> ClientResult<PullEvent> {
        match delivery.status {
            None => Ok(PullEvent::Message(JetStreamMessage::new(
                self.context.client().clone(),
                delivery,
            ))),
            Some(NO_MESSAGES) | Some(REQUEST_TIMEOUT) => Ok(PullEvent::Finished),
            Some(IDLE_HEARTBEAT) => Ok(PullEvent::Heartbeat),
            Some(code) => Err(ClientError::JetStream {
                code,
                err_code: 0,
                description: delivery.description.unwrap_or_default(),
            }),
        }
    }

    /// Continuous delivery through repeated pull requests
    pub fn messages(&self) -> ClientResult<PullMessages> {
        self.messages_with(DEFAULT_PULL_BATCH, DEFAULT_PULL_EXPIRY)
    }

    pub fn messages_with(&self, batch: usize, expires: Duration) -> ClientResult<PullMessages> {
        let subscription = self.context.client().subscribe(&self.context.client().new_inbox())?;
        Ok(PullMessages {
            consumer: self.clone(),
            subscription,
            batch: batch.max(1),
            expires: expires.max(Duration::from_millis(1)),
            outstanding: 0,
            request_deadline: None,
        })
    }
}

/// Receiver fed by one pull request at a time
///
/// A new request goes out when the previous one is exhausted, ended by the
/// server, or past its expiry.
#[derive(Debug)]
pub struct PullMessages {
    consumer: PullConsumer,
    subscription: Subscription,
    batch: usize,
    expires: Duration,
    /// Messages the current request may still deliver
    outstanding: usize,
    request_deadline: Option<Instant>,
}

impl PullMessages {
    fn request_live(&self) -> bool {
        self.outstanding > 0 && self.request_deadline.is_some_and(|d| Instant::now() < d)
    }

    fn pull(&mut self) -> ClientResult<()> {
        let request = PullRequest {
            batch: self.batch,
            expires: self.expires,
            no_wait: false,
        };
        self.consumer.send_pull(self.subscription.subject(), &request)?;
        self.outstanding = self.batch;
        self.request_deadline = deadline_after(Some(self.expires.saturating_add(EXPIRY_GRACE)));
        Ok(())
    }

    /// Wait for the next message; `None` waits forever
    pub fn next_message(&mut self, timeout: Option<Duration>) -> ClientResult<JetStreamMessage> {
        let deadline = deadline_after(timeout);
        loop {
            if !self.request_live() {
                self.pull()?;
            }
            let now = Instant::now();
            let caller_left = deadline.map(|d| d.saturating_duration_since(now));
            if caller_left == Some(Duration::ZERO) {
                return Err(ClientError::TimedOut(TimeoutKind::NextMessage));
            }
            let request_left = self.request_deadline.map(|d| d.saturating_duration_since(now));
            let wait = match (caller_left, request_left) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let delivery = match self.subscription.next_message(wait) {
                Ok(delivery) => delivery,
                Err(ClientError::TimedOut(_)) => continue,
                Err(e) => return Err(e),
            };
            match self.consumer.classify(delivery)? {
                PullEvent::Message(message) => {
                    self.outstanding = self.outstanding.saturating_sub(1);
                    return Ok(message);
                }
                PullEvent::Finished => self.outstanding = 0,
                PullEvent::Heartbeat => {}
            }
        }
    }
}

impl Iterator for PullMessages {
    type Item = ClientResult<JetStreamMessage>;

    /// Blocks until a message arrives; ends when the connection closes
    fn next(&mut self) -> Option<Self::Item> {
        match self.next_message(None) {
            Err(ClientError::Closed) => None,
            other => Some(other),
        }
    }
}

impl Drop for PullMessages {
    fn drop(&mut self) {
        // the client may already be closed
        let _ = self.consumer.context.client().unsubscribe(&self.subscription);
    }
}
