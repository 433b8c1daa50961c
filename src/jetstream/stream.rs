use super::consumer::{ConsumerConfig, ConsumerInfo, PullConsumer};
use super::context::JetStream;
use super::{is_not_found, nanos, validate_name, CONSUMER_NOT_FOUND};
use crate::error::{ClientError, ClientResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    #[default]
    Limits,
    Interest,
    WorkQueue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

/// What happens when a stream reaches one of its limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscardPolicy {
    /// Drop the oldest messages
    #[default]
    Old,
    /// Reject new publishes
    New,
}

fn unlimited() -> i64 {
    -1
}

fn unlimited_i32() -> i32 {
    -1
}

fn one_replica() -> usize {
    1
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Stream configuration as sent to `STREAM.CREATE`
///
/// Limits default to `-1` (unlimited) like the server's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default = "unlimited_i32")]
    pub max_consumers: i32,
    #[serde(rename = "max_msgs", default = "unlimited")]
    pub max_messages: i64,
    #[serde(default = "unlimited")]
    pub max_bytes: i64,
    #[serde(with = "nanos", default)]
    pub max_age: Duration,
    #[serde(rename = "max_msgs_per_subject", default = "unlimited")]
    pub max_messages_per_subject: i64,
    #[serde(rename = "max_msg_size", default = "unlimited_i32")]
    pub max_message_size: i32,
    #[serde(default)]
    pub storage: StorageType,
    #[serde(default)]
    pub discard: DiscardPolicy,
    #[serde(default = "one_replica")]
    pub num_replicas: usize,
    #[serde(default, skip_serializing_if = "is_false")]
    pub no_ack: bool,
    #[serde(with = "nanos", default, skip_serializing_if = "nanos::is_zero")]
    pub duplicate_window: Duration,
    #[serde(default, skip_serializing_if = "is_false")]
    pub sealed: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deny_delete: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deny_purge: bool,
    #[serde(rename = "allow_rollup_hdrs", default, skip_serializing_if = "is_false")]
    pub allow_rollup: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub allow_direct: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: None,
            subjects: Vec::new(),
            retention: RetentionPolicy::default(),
            max_consumers: -1,
            max_messages: -1,
            max_bytes: -1,
            max_age: Duration::ZERO,
            max_messages_per_subject: -1,
            max_message_size: -1,
            storage: StorageType::default(),
            discard: DiscardPolicy::default(),
            num_replicas: 1,
            no_ack: false,
            duplicate_window: Duration::ZERO,
            sealed: false,
            deny_delete: false,
            deny_purge: false,
            allow_rollup: false,
            allow_direct: false,
            metadata: HashMap::new(),
        }
    }
}

impl StreamConfig {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_subjects<I, S>(mut self, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subjects = subjects.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_storage(mut self, storage: StorageType) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_discard(mut self, discard: DiscardPolicy) -> Self {
        self.discard = discard;
        self
    }

    pub fn with_max_messages(mut self, max: i64) -> Self {
        self.max_messages = max;
        self
    }

    pub fn with_max_bytes(mut self, max: i64) -> Self {
        self.max_bytes = max;
        self
    }

    pub fn with_max_age(mut self, age: Duration) -> Self {
        self.max_age = age;
        self
    }

    pub fn with_duplicate_window(mut self, window: Duration) -> Self {
        self.duplicate_window = window;
        self
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.num_replicas = replicas;
        self
    }
}

/// Message counters of a stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamState {
    #[serde(default)]
    pub messages: u64,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub first_seq: u64,
    #[serde(default)]
    pub last_seq: u64,
    #[serde(default)]
    pub consumer_count: usize,
}

/// Reply of `STREAM.INFO` and `STREAM.CREATE`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub config: StreamConfig,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub state: StreamState,
}

/// Handle to an existing stream
#[derive(Debug, Clone)]
pub struct Stream {
    context: JetStream,
    info: StreamInfo,
}

impl Stream {
    pub(crate) fn new(context: JetStream, info: StreamInfo) -> Self {
        Self { context, info }
    }

    pub fn name(&self) -> &str {
        &self.info.config.name
    }

    /// Info as of the last lookup
    pub fn cached_info(&self) -> &StreamInfo {
        &self.info
    }

    /// Fetch current info from the server and cache it
    pub fn info(&mut self) -> ClientResult<&StreamInfo> {
        self.info = self.context.stream_info(&self.info.config.name)?;
        Ok(&self.info)
    }

    fn consumer_info(&self, name: &str) -> ClientResult<ConsumerInfo> {
        validate_name("consumer", name)?;
        self.context
            .api_request(&format!("CONSUMER.INFO.{}.{name}", self.name()), b"")
    }

    /// Bind to an existing pull consumer
    ///
    /// Push consumers (those with a deliver subject) are refused.
    pub fn get_pull_consumer(&self, name: &str) -> ClientResult<PullConsumer> {
        let info = self.consumer_info(name)?;
        PullConsumer::from_info(self.context.clone(), info)
    }

    /// Bind to a pull consumer, creating it from `config` if it does not exist
    pub fn get_or_create_pull_consumer(
        &self,
        name: &str,
        config: ConsumerConfig,
    ) -> ClientResult<PullConsumer> {
        match self.get_pull_consumer(name) {
            Err(e) if is_not_found(&e, CONSUMER_NOT_FOUND) => {
                debug!(stream = self.name(), consumer = name, "consumer not found, creating");
                let config = ConsumerConfig {
                    name: Some(name.to_string()),
                    ..config
                };
                self.create_pull_consumer(config)
            }
            other => other,
        }
    }

    /// Create a pull consumer; unnamed configs get a server-chosen name
    pub fn create_pull_consumer(&self, config: ConsumerConfig) -> ClientResult<PullConsumer> {
        if config.deliver_subject.is_some() {
            return Err(ClientError::UnsupportedConsumer(
                "pull consumers cannot have a deliver subject".to_string(),
            ));
        }
        let name = config.name.clone().or_else(|| config.durable_name.clone());
        let endpoint = match &name {
            Some(name) => {
                validate_name("consumer", name)?;
                format!("CONSUMER.CREATE.{}.{name}", self.name())
            }
            None => format!("CONSUMER.CREATE.{}", self.name()),
        };
        let request = CreateConsumerRequest {
            stream_name: self.name(),
            config: &config,
        };
        let info: ConsumerInfo = self.context.api_request_json(&endpoint, &request)?;
        PullConsumer::from_info(self.context.clone(), info)
    }

    pub fn delete_consumer(&self, name: &str) -> ClientResult<bool> {
        validate_name("consumer", name)?;
        let status: DeleteConsumerStatus = self
            .context
            .api_request(&format!("CONSUMER.DELETE.{}.{name}", self.name()), b"")?;
        Ok(status.success)
    }
}

#[derive(Debug, Serialize)]
struct CreateConsumerRequest<'a> {
    stream_name: &'a str,
    config: &'a ConsumerConfig,
}

#[derive(Debug, Deserialize)]
struct DeleteConsumerStatus {
    success: bool,
}
