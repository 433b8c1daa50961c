use super::nanos;
use crate::client::Client;
use crate::error::{ClientError, ClientResult};
use crate::protocol::Message;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::ops::Deref;
use std::time::Duration;

/// Acknowledgement sent for a consumed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// Processed; never redeliver
    Ack,
    /// Redeliver, optionally after a delay
    Nak(Option<Duration>),
    /// Still working; restart the ack timer
    Progress,
    /// Never redeliver, even though processing failed
    Term,
}

#[derive(Serialize)]
struct NakDelay {
    #[serde(with = "nanos")]
    delay: Duration,
}

impl AckKind {
    pub fn to_payload(self) -> ClientResult<Bytes> {
        let payload = match self {
            AckKind::Ack => Bytes::from_static(b"+ACK"),
            AckKind::Nak(None) => Bytes::from_static(b"-NAK"),
            AckKind::Nak(Some(delay)) => {
                let mut payload = b"-NAK ".to_vec();
                serde_json::to_writer(&mut payload, &NakDelay { delay })?;
                Bytes::from(payload)
            }
            AckKind::Progress => Bytes::from_static(b"+WPI"),
            AckKind::Term => Bytes::from_static(b"+TERM"),
        };
        Ok(payload)
    }
}

/// Delivery metadata encoded in a message's ack subject
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInfo {
    pub domain: Option<String>,
    pub stream: String,
    pub consumer: String,
    /// How many times this message has been delivered
    pub delivered: u64,
    pub stream_sequence: u64,
    pub consumer_sequence: u64,
    pub published: DateTime<Utc>,
    /// Messages left for the consumer after this one
    pub pending: u64,
}

impl MessageInfo {
    /// Parse `$JS.ACK.<stream>.<consumer>.<delivered>.<sseq>.<cseq>.<ts>.<pending>`
    /// or the domain-qualified form with account hash and trailing token
    pub fn parse(reply: &str) -> Option<Self> {
        let tokens: Vec<&str> = reply.split('.').collect();
        let (domain, rest) = match tokens.as_slice() {
            ["$JS", "ACK", rest @ ..] if rest.len() == 7 => (None, rest),
            ["$JS", "ACK", domain, _account, rest @ .., _token] if rest.len() == 7 => {
                let domain = (*domain != "_").then(|| domain.to_string());
                (domain, rest)
            }
            _ => return None,
        };
        let number = |index: usize| rest[index].parse::<u64>().ok();
        let published = rest[5].parse::<i64>().ok()?;
        Some(Self {
            domain,
            stream: rest[0].to_string(),
            consumer: rest[1].to_string(),
            delivered: number(2)?,
            stream_sequence: number(3)?,
            consumer_sequence: number(4)?,
            published: DateTime::from_timestamp_nanos(published),
            pending: number(6)?,
        })
    }
}

/// A message delivered by a consumer
///
/// Dereferences to the core [`Message`]; acknowledge it with one of
/// [`ack`](Self::ack), [`nak`](Self::nak), [`term`](Self::term).
#[derive(Clone)]
pub struct JetStreamMessage {
    client: Client,
    message: Message,
}

impl fmt::Debug for JetStreamMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JetStreamMessage")
            .field("message", &self.message)
            .finish()
    }
}

impl Deref for JetStreamMessage {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.message
    }
}

impl JetStreamMessage {
    pub(crate) fn new(client: Client, message: Message) -> Self {
        Self { client, message }
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    /// Parsed ack subject; `None` for messages not delivered by a consumer
    pub fn info(&self) -> Option<MessageInfo> {
        self.message.reply.as_deref().and_then(MessageInfo::parse)
    }

    fn ack_subject(&self) -> ClientResult<&str> {
        self.message.reply.as_deref().ok_or_else(|| {
            ClientError::JetStreamResponse("message has no ack subject".to_string())
        })
    }

    /// Send an acknowledgement without waiting for the server
    pub fn ack_with(&self, kind: AckKind) -> ClientResult<()> {
        self.client.publish(self.ack_subject()?, kind.to_payload()?)
    }

    pub fn ack(&self) -> ClientResult<()> {
        self.ack_with(AckKind::Ack)
    }

    pub fn nak(&self) -> ClientResult<()> {
        self.ack_with(AckKind::Nak(None))
    }

    pub fn term(&self) -> ClientResult<()> {
        self.ack_with(AckKind::Term)
    }

    pub fn in_progress(&self) -> ClientResult<()> {
        self.ack_with(AckKind::Progress)
    }

    /// Acknowledge and wait until the server confirms it recorded the ack
    pub fn double_ack(&self, timeout: Duration) -> ClientResult<()> {
        self.client
            .request(self.ack_subject()?, AckKind::Ack.to_payload()?, timeout)
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_payloads() {
        assert_eq!(&AckKind::Ack.to_payload().unwrap()[..], b"+ACK");
        assert_eq!(&AckKind::Nak(None).to_payload().unwrap()[..], b"-NAK");
        assert_eq!(
            &AckKind::Nak(Some(Duration::from_secs(1))).to_payload().unwrap()[..],
            br#"-NAK {"delay":1000000000}"#
        );
        assert_eq!(&AckKind::Progress.to_payload().unwrap()[..], b"+WPI");
        assert_eq!(&AckKind::Term.to_payload().unwrap()[..], b"+TERM");
    }

    #[test]
    fn test_parse_plain_ack_subject() {
        let info = MessageInfo::parse("$JS.ACK.ORDERS.worker.2.15.9.1709287200000000000.4").unwrap();
        assert_eq!(info.domain, None);
        assert_eq!(info.stream, "ORDERS");
        assert_eq!(info.consumer, "worker");
        assert_eq!(info.delivered, 2);
        assert_eq!(info.stream_sequence, 15);
        assert_eq!(info.consumer_sequence, 9);
        assert_eq!(info.published.timestamp(), 1_709_287_200);
        assert_eq!(info.pending, 4);
    }

    #[test]
    fn test_parse_domain_ack_subject() {
        let info =
            MessageInfo::parse("$JS.ACK.hub.ACCHASH.ORDERS.worker.1.3.3.1709287200000000000.0.xyz")
                .unwrap();
        assert_eq!(info.domain.as_deref(), Some("hub"));
        assert_eq!(info.stream, "ORDERS");
        assert_eq!(info.stream_sequence, 3);

        let info =
            MessageInfo::parse("$JS.ACK._.ACCHASH.ORDERS.worker.1.3.3.1709287200000000000.0.xyz")
                .unwrap();
        assert_eq!(info.domain, None);
    }

    #[test]
    fn test_parse_rejects_other_subjects() {
        assert!(MessageInfo::parse("_INBOX.abc").is_none());
        assert!(MessageInfo::parse("$JS.ACK.ORDERS.worker.x.3.3.0.0").is_none());
        assert!(MessageInfo::parse("$JS.ACK.ORDERS.worker.1.3").is_none());
    }
}
