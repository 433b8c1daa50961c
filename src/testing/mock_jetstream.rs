//! In-memory JetStream behind the mock server
//!
//! Streams capture publishes by subject, deduplicate on `Nats-Msg-Id` and
//! enforce `max_msgs`. Pull consumers hold waiting requests, track pending
//! acks and redeliver on `-NAK`. Duplicate windows, ack timeouts, push
//! consumers and replication are not modelled.

use crate::jetstream::{
    AckPolicy, ApiError, ConsumerConfig, ConsumerInfo, DeliverPolicy, DiscardPolicy, MessageInfo,
    PublishAck, PullRequest, RetentionPolicy, SequenceInfo, StreamConfig, StreamInfo, StreamState,
    CONSUMER_NOT_FOUND, MSG_ID_HEADER, STREAM_NAME_IN_USE, STREAM_NOT_FOUND,
};
use crate::protocol::subject::subject_matches;
use crate::protocol::HeaderMap;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

const API_PREFIX: &str = "$JS.API.";
const ACK_PREFIX: &str = "$JS.ACK.";

/// A message the server sends as a consequence of a JetStream operation
#[derive(Debug, Clone)]
pub(crate) struct Outbound {
    /// Subject subscriptions are matched against
    pub inbox: String,
    /// Subject carried in the MSG frame
    pub subject: String,
    pub reply: Option<String>,
    pub headers: Option<HeaderMap>,
    pub status: Option<u16>,
    pub description: Option<String>,
    pub payload: Bytes,
}

impl Outbound {
    fn to_inbox(inbox: &str, payload: Bytes) -> Self {
        Self {
            inbox: inbox.to_string(),
            subject: inbox.to_string(),
            reply: None,
            headers: None,
            status: None,
            description: None,
            payload,
        }
    }

    fn json<T: Serialize>(inbox: &str, body: &T) -> Self {
        let payload = serde_json::to_vec(body).unwrap_or_default();
        Self::to_inbox(inbox, Bytes::from(payload))
    }

    fn error(inbox: &str, code: u16, err_code: u64, description: &str) -> Self {
        #[derive(Serialize)]
        struct ErrorReply<'a> {
            error: &'a ApiError,
        }
        let error = ApiError {
            code,
            err_code,
            description: description.to_string(),
        };
        Self::json(inbox, &ErrorReply { error: &error })
    }

    fn status(inbox: &str, code: u16, description: &str) -> Self {
        Self {
            status: Some(code),
            description: Some(description.to_string()),
            ..Self::to_inbox(inbox, Bytes::new())
        }
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    subject: String,
    headers: Option<HeaderMap>,
    payload: Bytes,
    stored_at: DateTime<Utc>,
}

#[derive(Debug)]
struct WaitingPull {
    inbox: String,
    remaining: usize,
    expires_at: Option<Instant>,
}

#[derive(Debug)]
struct MockConsumer {
    name: String,
    config: ConsumerConfig,
    created: DateTime<Utc>,
    /// Next stream sequence considered for first delivery
    next_seq: u64,
    consumer_seq: u64,
    last_delivered_stream_seq: u64,
    redeliver: VecDeque<u64>,
    /// Stream sequence -> delivery count, for unacknowledged deliveries
    pending: BTreeMap<u64, u64>,
    redelivered: u64,
    waiting: VecDeque<WaitingPull>,
}

impl MockConsumer {
    fn matches(&self, message: &StoredMessage) -> bool {
        self.config.filter_subject.is_empty()
            || subject_matches(&self.config.filter_subject, &message.subject)
    }

    fn next_delivery(&mut self, messages: &BTreeMap<u64, StoredMessage>) -> Option<u64> {
        while let Some(seq) = self.redeliver.pop_front() {
            if messages.contains_key(&seq) {
                return Some(seq);
            }
        }
        let seq = messages
            .range(self.next_seq..)
            .find(|(_, message)| self.matches(message))
            .map(|(seq, _)| *seq)?;
        self.next_seq = seq + 1;
        Some(seq)
    }

    fn num_pending(&self, messages: &BTreeMap<u64, StoredMessage>) -> u64 {
        let fresh = messages
            .range(self.next_seq..)
            .filter(|(_, message)| self.matches(message))
            .count();
        (fresh + self.redeliver.len()) as u64
    }

    fn info(&self, stream: &str, messages: &BTreeMap<u64, StoredMessage>) -> ConsumerInfo {
        ConsumerInfo {
            stream_name: stream.to_string(),
            name: self.name.clone(),
            created: self.created,
            config: self.config.clone(),
            delivered: SequenceInfo {
                consumer_seq: self.consumer_seq,
                stream_seq: self.last_delivered_stream_seq,
            },
            ack_floor: SequenceInfo::default(),
            num_ack_pending: self.pending.len() as u64,
            num_redelivered: self.redelivered,
            num_waiting: self.waiting.len() as u64,
            num_pending: self.num_pending(messages),
        }
    }

    /// Serve waiting pull requests from the stream
    fn dispatch(&mut self, stream: &str, messages: &BTreeMap<u64, StoredMessage>) -> Vec<Outbound> {
        let mut out = Vec::new();
        let now = Instant::now();
        while let Some(front) = self.waiting.front() {
            if front.remaining == 0 || front.expires_at.is_some_and(|at| at <= now) {
                self.waiting.pop_front();
                continue;
            }
            let Some(seq) = self.next_delivery(messages) else {
                break;
            };
            let Some(message) = messages.get(&seq) else {
                continue;
            };
            self.consumer_seq += 1;
            self.last_delivered_stream_seq = seq;
            let delivered = {
                let count = self.pending.entry(seq).or_insert(0);
                *count += 1;
                *count
            };
            if delivered > 1 {
                self.redelivered += 1;
            }
            if self.config.ack_policy == AckPolicy::None {
                self.pending.remove(&seq);
            }
            let ack_subject = format!(
                "{ACK_PREFIX}{stream}.{}.{delivered}.{seq}.{}.{}.{}",
                self.name,
                self.consumer_seq,
                message.stored_at.timestamp_nanos_opt().unwrap_or(0),
                self.num_pending(messages),
            );
            if let Some(front) = self.waiting.front_mut() {
                front.remaining -= 1;
                out.push(Outbound {
                    inbox: front.inbox.clone(),
                    subject: message.subject.clone(),
                    reply: Some(ack_subject),
                    headers: message.headers.clone(),
                    status: None,
                    description: None,
                    payload: message.payload.clone(),
                });
            }
        }
        out
    }
}

#[derive(Debug)]
struct MockStream {
    config: StreamConfig,
    created: DateTime<Utc>,
    messages: BTreeMap<u64, StoredMessage>,
    bytes: u64,
    last_seq: u64,
    msg_ids: HashMap<String, u64>,
    consumers: BTreeMap<String, MockConsumer>,
}

impl MockStream {
    fn info(&self) -> StreamInfo {
        StreamInfo {
            config: self.config.clone(),
            created: self.created,
            state: StreamState {
                messages: self.messages.len() as u64,
                bytes: self.bytes,
                first_seq: self.messages.keys().next().copied().unwrap_or(self.last_seq + 1),
                last_seq: self.last_seq,
                consumer_count: self.consumers.len(),
            },
        }
    }

    fn captures(&self, subject: &str) -> bool {
        self.config
            .subjects
            .iter()
            .any(|pattern| subject_matches(pattern, subject))
    }

    fn remove(&mut self, seq: u64) {
        if let Some(message) = self.messages.remove(&seq) {
            self.bytes = self.bytes.saturating_sub(message.payload.len() as u64);
        }
    }

    fn dispatch_all(&mut self) -> Vec<Outbound> {
        let name = self.config.name.clone();
        let messages = &self.messages;
        self.consumers
            .values_mut()
            .flat_map(|consumer| consumer.dispatch(&name, messages))
            .collect()
    }
}

/// All JetStream state of one mock server
#[derive(Debug, Default)]
pub(crate) struct MockJetStream {
    streams: BTreeMap<String, MockStream>,
}

impl MockJetStream {
    pub fn is_api(subject: &str) -> bool {
        subject.starts_with(API_PREFIX)
    }

    pub fn is_ack(subject: &str) -> bool {
        subject.starts_with(ACK_PREFIX)
    }

    /// Stored message count of `stream`, if it exists
    pub fn stream_len(&self, stream: &str) -> Option<usize> {
        self.streams.get(stream).map(|stream| stream.messages.len())
    }

    /// Handle a `$JS.API.` request; requests without a reply subject are ignored
    pub fn api(&mut self, subject: &str, payload: &[u8], reply: Option<&str>) -> Vec<Outbound> {
        let Some(reply) = reply else {
            return Vec::new();
        };
        let endpoint = subject.trim_start_matches(API_PREFIX);
        let tokens: Vec<&str> = endpoint.split('.').collect();
        debug!(endpoint, "mock JetStream API call");
        match tokens.as_slice() {
            ["STREAM", "CREATE", name] => vec![self.create_stream(reply, name, payload)],
            ["STREAM", "INFO", name] => vec![match self.streams.get(*name) {
                Some(stream) => Outbound::json(reply, &stream.info()),
                None => stream_not_found(reply),
            }],
            ["STREAM", "DELETE", name] => vec![match self.streams.remove(*name) {
                Some(_) => Outbound::json(reply, &serde_json::json!({ "success": true })),
                None => stream_not_found(reply),
            }],
            ["CONSUMER", "CREATE", stream, rest @ ..] if rest.len() <= 2 => {
                vec![self.create_consumer(reply, stream, rest.first().copied(), payload)]
            }
            ["CONSUMER", "DURABLE", "CREATE", stream, name] => {
                vec![self.create_consumer(reply, stream, Some(name), payload)]
            }
            ["CONSUMER", "INFO", stream, name] => {
                vec![self.with_consumer(reply, stream, name, |stream, consumer| {
                    Outbound::json(reply, &consumer.info(&stream.config.name, &stream.messages))
                })]
            }
            ["CONSUMER", "DELETE", stream, name] => {
                let removed = self
                    .streams
                    .get_mut(*stream)
                    .map(|stream| stream.consumers.remove(*name).is_some());
                vec![match removed {
                    Some(true) => Outbound::json(reply, &serde_json::json!({ "success": true })),
                    Some(false) => consumer_not_found(reply),
                    None => stream_not_found(reply),
                }]
            }
            ["CONSUMER", "MSG", "NEXT", stream, name] => self.pull(reply, stream, name, payload),
            _ => vec![Outbound::error(reply, 400, 10003, "unknown JetStream API request")],
        }
    }

    fn create_stream(&mut self, reply: &str, name: &str, payload: &[u8]) -> Outbound {
        let config: StreamConfig = match serde_json::from_slice(payload) {
            Ok(config) => config,
            Err(e) => return Outbound::error(reply, 400, 10025, &format!("invalid JSON: {e}")),
        };
        if config.name != name {
            return Outbound::error(reply, 400, 10056, "stream name in subject does not match request");
        }
        if let Some(existing) = self.streams.get(name) {
            if existing.config == config {
                return Outbound::json(reply, &existing.info());
            }
            return Outbound::error(
                reply,
                400,
                STREAM_NAME_IN_USE,
                "stream name already in use with a different configuration",
            );
        }
        let subjects = if config.subjects.is_empty() {
            vec![name.to_string()]
        } else {
            config.subjects.clone()
        };
        let stream = MockStream {
            config: StreamConfig { subjects, ..config },
            created: Utc::now(),
            messages: BTreeMap::new(),
            bytes: 0,
            last_seq: 0,
            msg_ids: HashMap::new(),
            consumers: BTreeMap::new(),
        };
        let info = stream.info();
        self.streams.insert(name.to_string(), stream);
        Outbound::json(reply, &info)
    }

    fn create_consumer(
        &mut self,
        reply: &str,
        stream_name: &str,
        name: Option<&str>,
        payload: &[u8],
    ) -> Outbound {
        #[derive(serde::Deserialize)]
        struct CreateRequest {
            config: ConsumerConfig,
        }
        let request: CreateRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(e) => return Outbound::error(reply, 400, 10025, &format!("invalid JSON: {e}")),
        };
        let Some(stream) = self.streams.get_mut(stream_name) else {
            return stream_not_found(reply);
        };
        let name = name
            .map(str::to_string)
            .or_else(|| request.config.name.clone())
            .or_else(|| request.config.durable_name.clone())
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        if let Some(existing) = stream.consumers.get(&name) {
            if existing.config == request.config {
                return Outbound::json(reply, &existing.info(stream_name, &stream.messages));
            }
            return Outbound::error(reply, 400, 10148, "consumer already exists");
        }
        let next_seq = match request.config.deliver_policy {
            DeliverPolicy::All | DeliverPolicy::LastPerSubject => 1,
            DeliverPolicy::New => stream.last_seq + 1,
            DeliverPolicy::Last => stream.last_seq.max(1),
            DeliverPolicy::ByStartSequence => request.config.opt_start_seq.unwrap_or(1),
        };
        let consumer = MockConsumer {
            name: name.clone(),
            config: request.config,
            created: Utc::now(),
            next_seq,
            consumer_seq: 0,
            last_delivered_stream_seq: 0,
            redeliver: VecDeque::new(),
            pending: BTreeMap::new(),
            redelivered: 0,
            waiting: VecDeque::new(),
        };
        let info = consumer.info(stream_name, &stream.messages);
        stream.consumers.insert(name, consumer);
        Outbound::json(reply, &info)
    }

    fn with_consumer<F>(&self, reply: &str, stream: &str, name: &str, f: F) -> Outbound
    where
        F: FnOnce(&MockStream, &MockConsumer) -> Outbound,
    {
        let Some(stream) = self.streams.get(stream) else {
            return stream_not_found(reply);
        };
        match stream.consumers.get(name) {
            Some(consumer) => f(stream, consumer),
            None => consumer_not_found(reply),
        }
    }

    fn pull(&mut self, reply: &str, stream_name: &str, name: &str, payload: &[u8]) -> Vec<Outbound> {
        let request = if payload.is_empty() {
            PullRequest {
                batch: 1,
                expires: Duration::ZERO,
                no_wait: false,
            }
        } else {
            match serde_json::from_slice::<PullRequest>(payload) {
                Ok(request) => request,
                Err(e) => return vec![Outbound::status(reply, 400, &format!("Bad Request: {e}"))],
            }
        };
        let Some(stream) = self.streams.get_mut(stream_name) else {
            return vec![Outbound::status(reply, 404, "No Messages")];
        };
        let Some(consumer) = stream.consumers.get_mut(name) else {
            return vec![Outbound::status(reply, 409, "Consumer Deleted")];
        };
        consumer.waiting.push_back(WaitingPull {
            inbox: reply.to_string(),
            remaining: request.batch.max(1),
            expires_at: if request.expires.is_zero() {
                None
            } else {
                Instant::now().checked_add(request.expires)
            },
        });
        let mut out = consumer.dispatch(stream_name, &stream.messages);
        if request.no_wait {
            // a no-wait request never waits for later publishes
            if let Some(position) = consumer.waiting.iter().position(|pull| pull.inbox == reply) {
                consumer.waiting.remove(position);
                out.push(Outbound::status(reply, 404, "No Messages"));
            }
        }
        out
    }

    /// Store a publish in the stream capturing `subject`
    ///
    /// `None` when no stream captures it.
    pub fn capture(
        &mut self,
        subject: &str,
        headers: Option<&HeaderMap>,
        payload: &Bytes,
        reply: Option<&str>,
    ) -> Option<Vec<Outbound>> {
        let stream = self.streams.values_mut().find(|stream| stream.captures(subject))?;
        let name = stream.config.name.clone();
        let msg_id = headers.and_then(|headers| headers.get(MSG_ID_HEADER)).map(str::to_string);

        if let Some(seq) = msg_id.as_ref().and_then(|id| stream.msg_ids.get(id)) {
            let ack = PublishAck {
                stream: name,
                sequence: *seq,
                domain: String::new(),
                duplicate: true,
                value: None,
            };
            return Some(reply.map(|reply| Outbound::json(reply, &ack)).into_iter().collect());
        }

        let limit = stream.config.max_messages;
        if limit >= 0 && stream.messages.len() as i64 >= limit {
            match stream.config.discard {
                DiscardPolicy::New => {
                    return Some(
                        reply
                            .map(|reply| Outbound::error(reply, 503, 10077, "maximum messages exceeded"))
                            .into_iter()
                            .collect(),
                    );
                }
                DiscardPolicy::Old => {
                    if let Some(oldest) = stream.messages.keys().next().copied() {
                        stream.remove(oldest);
                    }
                }
            }
        }

        stream.last_seq += 1;
        let seq = stream.last_seq;
        stream.bytes += payload.len() as u64;
        stream.messages.insert(
            seq,
            StoredMessage {
                subject: subject.to_string(),
                headers: headers.cloned(),
                payload: payload.clone(),
                stored_at: Utc::now(),
            },
        );
        if let Some(id) = msg_id {
            stream.msg_ids.insert(id, seq);
        }

        let mut out = Vec::new();
        if let Some(reply) = reply.filter(|_| !stream.config.no_ack) {
            let ack = PublishAck {
                stream: name,
                sequence: seq,
                domain: String::new(),
                duplicate: false,
                value: None,
            };
            out.push(Outbound::json(reply, &ack));
        }
        out.extend(stream.dispatch_all());
        Some(out)
    }

    /// Apply an acknowledgement sent to a `$JS.ACK.` subject
    pub fn acknowledge(&mut self, subject: &str, payload: &[u8], reply: Option<&str>) -> Vec<Outbound> {
        let mut out = Vec::new();
        if let Some(info) = MessageInfo::parse(subject) {
            if let Some(stream) = self.streams.get_mut(&info.stream) {
                let work_queue = stream.config.retention == RetentionPolicy::WorkQueue;
                let seq = info.stream_sequence;
                let mut release = false;
                if let Some(consumer) = stream.consumers.get_mut(&info.consumer) {
                    if payload.is_empty() || payload.starts_with(b"+ACK") || payload.starts_with(b"+TERM") {
                        release = consumer.pending.remove(&seq).is_some();
                    } else if payload.starts_with(b"-NAK") && consumer.pending.contains_key(&seq) {
                        consumer.redeliver.push_back(seq);
                    }
                }
                if release && work_queue {
                    stream.remove(seq);
                }
                out.extend(stream.dispatch_all());
            }
        }
        if let Some(reply) = reply {
            out.push(Outbound::to_inbox(reply, Bytes::new()));
        }
        out
    }
}

fn stream_not_found(reply: &str) -> Outbound {
    Outbound::error(reply, 404, STREAM_NOT_FOUND, "stream not found")
}

fn consumer_not_found(reply: &str) -> Outbound {
    Outbound::error(reply, 404, CONSUMER_NOT_FOUND, "consumer not found")
}
