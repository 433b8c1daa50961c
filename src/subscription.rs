//! Subscriptions and message delivery
//!
//! The [`SubscriptionTable`] is shared between caller threads (subscribe,
//! unsubscribe) and the engine (delivery, resubscription). Its lock is never
//! held while a handler runs or a queue consumer is woken.
//!
//! Queue-backed subscriptions buffer up to `subscription_capacity` messages.
//! When the queue is full new messages are dropped and counted, so a slow
//! consumer cannot stall the engine.

use crate::bridge::{deadline_after, EventFd, WaitOutcome, WaitStrategy};
use crate::error::{ClientError, ClientResult, TimeoutKind};
use crate::protocol::codec::{encode_sub, encode_unsub};
use crate::protocol::Message;
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::os::fd::{AsRawFd, RawFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::error;

/// Callback invoked on the engine thread for every delivered message
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<Message>,
    closed: bool,
}

/// Bounded per-subscription queue with an eventfd signalled on arrival
#[derive(Debug)]
pub(crate) struct MessageQueue {
    state: Mutex<QueueState>,
    ready: EventFd,
    capacity: usize,
}

impl MessageQueue {
    pub(crate) fn new(capacity: usize) -> std::io::Result<Self> {
        Ok(Self {
            state: Mutex::new(QueueState::default()),
            ready: EventFd::new()?,
            capacity,
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock()
    }

    fn signal(&self) {
        if let Err(e) = self.ready.signal() {
            tracing::warn!(error = %e, "failed to signal subscription eventfd");
        }
    }

    /// False if the queue is full or closed
    pub(crate) fn push(&self, message: Message) -> bool {
        let mut state = self.lock();
        if state.closed || state.messages.len() >= self.capacity {
            return false;
        }
        state.messages.push_back(message);
        drop(state);
        self.signal();
        true
    }

    fn pop(&self) -> Result<Option<Message>, ClientError> {
        let mut state = self.lock();
        match state.messages.pop_front() {
            Some(message) => {
                let more = !state.messages.is_empty();
                drop(state);
                // another consumer may have reset the descriptor
                if more {
                    self.signal();
                }
                Ok(Some(message))
            }
            None if state.closed => Err(ClientError::Closed),
            None => Ok(None),
        }
    }

    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.signal();
    }

    fn len(&self) -> usize {
        self.lock().messages.len()
    }
}

/// Where a subscription's messages go
#[derive(Clone)]
pub(crate) enum DeliveryTarget {
    Queue(Arc<MessageQueue>),
    Handler(MessageHandler),
}

impl fmt::Debug for DeliveryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryTarget::Queue(queue) => f.debug_tuple("Queue").field(&queue.len()).finish(),
            DeliveryTarget::Handler(_) => f.write_str("Handler"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct SubscriptionEntry {
    subject: String,
    queue_group: Option<String>,
    target: DeliveryTarget,
    /// Total deliveries after which the subscription ends
    max: Option<u64>,
    delivered: u64,
}

impl SubscriptionEntry {
    pub(crate) fn new(subject: &str, queue_group: Option<&str>, target: DeliveryTarget) -> Self {
        Self {
            subject: subject.to_string(),
            queue_group: queue_group.map(str::to_string),
            target,
            max: None,
            delivered: 0,
        }
    }

    fn close(&self) {
        if let DeliveryTarget::Queue(queue) = &self.target {
            queue.close();
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DeliveryOutcome {
    Delivered,
    /// Subscriber queue full or closed
    Dropped,
    /// No live subscription for the sid (late message after unsubscribe)
    Unknown,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LimitOutcome {
    /// Server told to stop after `remaining` more messages
    Limited { remaining: u64 },
    /// Limit already reached; the subscription was removed
    Removed,
    Unknown,
}

/// Active subscriptions keyed by sid
#[derive(Debug)]
pub(crate) struct SubscriptionTable {
    next_sid: AtomicU64,
    entries: Mutex<HashMap<u64, SubscriptionEntry>>,
}

impl Default for SubscriptionTable {
    fn default() -> Self {
        Self {
            next_sid: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl SubscriptionTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, SubscriptionEntry>> {
        self.entries.lock()
    }

    /// Sids are never reused for the lifetime of the client
    pub(crate) fn allocate_sid(&self) -> u64 {
        self.next_sid.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn insert(&self, sid: u64, entry: SubscriptionEntry) {
        self.lock().insert(sid, entry);
    }

    /// Remove and close; false if the sid was not live
    pub(crate) fn remove(&self, sid: u64) -> bool {
        let removed = self.lock().remove(&sid);
        match removed {
            Some(entry) => {
                entry.close();
                true
            }
            None => false,
        }
    }

    pub(crate) fn contains(&self, sid: u64) -> bool {
        self.lock().contains_key(&sid)
    }

    /// End the subscription after `max` total deliveries
    pub(crate) fn set_limit(&self, sid: u64, max: u64) -> LimitOutcome {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(&sid) else {
            return LimitOutcome::Unknown;
        };
        if entry.delivered >= max {
            if let Some(entry) = entries.remove(&sid) {
                drop(entries);
                entry.close();
            }
            return LimitOutcome::Removed;
        }
        entry.max = Some(max);
        LimitOutcome::Limited {
            remaining: max - entry.delivered,
        }
    }

    /// Route one inbound message; runs on the engine thread
    pub(crate) fn deliver(&self, message: Message) -> DeliveryOutcome {
        let sid = message.sid();
        let (target, finished) = {
            let mut entries = self.lock();
            let Some(entry) = entries.get_mut(&sid) else {
                return DeliveryOutcome::Unknown;
            };
            entry.delivered += 1;
            let finished = entry.max.is_some_and(|max| entry.delivered >= max);
            let target = entry.target.clone();
            if finished {
                entries.remove(&sid);
            }
            (target, finished)
        };

        let outcome = match &target {
            DeliveryTarget::Queue(queue) => {
                if queue.push(message) {
                    DeliveryOutcome::Delivered
                } else {
                    DeliveryOutcome::Dropped
                }
            }
            DeliveryTarget::Handler(handler) => {
                if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                    error!(sid, "subscription handler panicked");
                }
                DeliveryOutcome::Delivered
            }
        };
        if finished {
            if let DeliveryTarget::Queue(queue) = &target {
                queue.close();
            }
        }
        outcome
    }

    /// SUB frames (plus remaining auto-unsubscribe limits) for a new connection
    pub(crate) fn resubscribe_frames(&self) -> Vec<Bytes> {
        let entries = self.lock();
        let mut sids: Vec<&u64> = entries.keys().collect();
        sids.sort_unstable();
        sids.into_iter()
            .filter_map(|sid| entries.get(sid).map(|entry| (*sid, entry)))
            .map(|(sid, entry)| {
                let mut buf = BytesMut::new();
                encode_sub(&mut buf, &entry.subject, entry.queue_group.as_deref(), sid);
                if let Some(max) = entry.max {
                    encode_unsub(&mut buf, sid, Some(max.saturating_sub(entry.delivered)));
                }
                buf.freeze()
            })
            .collect()
    }

    pub(crate) fn close_all(&self) {
        let drained: Vec<SubscriptionEntry> = self.lock().drain().map(|(_, entry)| entry).collect();
        for entry in drained {
            entry.close();
        }
    }
}

/// Handle returned by [`crate::Client::subscribe`]
///
/// Messages are read with [`Subscription::next_message`]. The handle can be
/// shared between threads; each message is handed to exactly one reader.
pub struct Subscription {
    sid: u64,
    subject: String,
    queue_group: Option<String>,
    queue: Option<Arc<MessageQueue>>,
    wait: Arc<dyn WaitStrategy>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("sid", &self.sid)
            .field("subject", &self.subject)
            .field("queue_group", &self.queue_group)
            .finish()
    }
}

impl Subscription {
    pub(crate) fn new(
        sid: u64,
        subject: &str,
        queue_group: Option<&str>,
        queue: Option<Arc<MessageQueue>>,
        wait: Arc<dyn WaitStrategy>,
    ) -> Self {
        Self {
            sid,
            subject: subject.to_string(),
            queue_group: queue_group.map(str::to_string),
            queue,
            wait,
        }
    }

    pub fn sid(&self) -> u64 {
        self.sid
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn queue_group(&self) -> Option<&str> {
        self.queue_group.as_deref()
    }

    fn queue(&self) -> ClientResult<&Arc<MessageQueue>> {
        self.queue.as_ref().ok_or(ClientError::HandlerSubscription)
    }

    /// Descriptor that is readable while messages are queued
    pub fn raw_fd(&self) -> ClientResult<RawFd> {
        Ok(self.queue()?.ready.as_raw_fd())
    }

    /// Messages queued and not yet read
    pub fn pending(&self) -> usize {
        self.queue.as_ref().map_or(0, |queue| queue.len())
    }

    /// Take a message without waiting
    pub fn try_next(&self) -> ClientResult<Option<Message>> {
        self.queue()?.pop()
    }

    /// Wait for the next message; `None` waits forever
    ///
    /// After the subscription ends, queued messages are still returned and
    /// then `Closed` is reported.
    pub fn next_message(&self, timeout: Option<Duration>) -> ClientResult<Message> {
        let queue = self.queue()?;
        let deadline = deadline_after(timeout);
        loop {
            if let Some(message) = queue.pop()? {
                return Ok(message);
            }
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if remaining == Some(Duration::ZERO) {
                return Err(ClientError::TimedOut(TimeoutKind::NextMessage));
            }
            if self.wait.wait_readable(queue.ready.as_raw_fd(), remaining)? == WaitOutcome::Ready {
                queue.ready.reset()?;
            }
        }
    }
}

impl Iterator for &Subscription {
    type Item = Message;

    /// Blocks until a message arrives; ends when the subscription closes
    fn next(&mut self) -> Option<Message> {
        self.next_message(None).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BlockingWait;
    use std::sync::atomic::AtomicUsize;

    fn message(sid: u64, payload: &'static str) -> Message {
        Message {
            subject: "orders.new".to_string(),
            reply: None,
            payload: Bytes::from_static(payload.as_bytes()),
            headers: None,
            status: None,
            description: None,
            sid,
        }
    }

    fn queued(table: &SubscriptionTable, capacity: usize) -> (u64, Subscription) {
        let sid = table.allocate_sid();
        let queue = Arc::new(MessageQueue::new(capacity).unwrap());
        table.insert(
            sid,
            SubscriptionEntry::new("orders.*", None, DeliveryTarget::Queue(Arc::clone(&queue))),
        );
        let subscription = Subscription::new(sid, "orders.*", None, Some(queue), Arc::new(BlockingWait));
        (sid, subscription)
    }

    #[test]
    fn test_sids_are_unique() {
        let table = SubscriptionTable::default();
        let a = table.allocate_sid();
        let b = table.allocate_sid();
        assert_ne!(a, b);
    }

    #[test]
    fn test_queue_delivery_and_read() {
        let table = SubscriptionTable::default();
        let (sid, subscription) = queued(&table, 8);
        assert_eq!(table.deliver(message(sid, "one")), DeliveryOutcome::Delivered);
        assert_eq!(table.deliver(message(sid, "two")), DeliveryOutcome::Delivered);

        let first = subscription.next_message(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(first.payload, Bytes::from_static(b"one"));
        let second = subscription.try_next().unwrap().unwrap();
        assert_eq!(second.payload, Bytes::from_static(b"two"));
        assert!(subscription.try_next().unwrap().is_none());
    }

    #[test]
    fn test_full_queue_drops() {
        let table = SubscriptionTable::default();
        let (sid, subscription) = queued(&table, 1);
        assert_eq!(table.deliver(message(sid, "kept")), DeliveryOutcome::Delivered);
        assert_eq!(table.deliver(message(sid, "lost")), DeliveryOutcome::Dropped);
        assert_eq!(subscription.pending(), 1);
    }

    #[test]
    fn test_unknown_sid() {
        let table = SubscriptionTable::default();
        assert_eq!(table.deliver(message(42, "x")), DeliveryOutcome::Unknown);
    }

    #[test]
    fn test_next_message_times_out() {
        let table = SubscriptionTable::default();
        let (_sid, subscription) = queued(&table, 4);
        let err = subscription
            .next_message(Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, ClientError::TimedOut(TimeoutKind::NextMessage)));
    }

    #[test]
    fn test_delivery_wakes_waiting_reader() {
        let table = Arc::new(SubscriptionTable::default());
        let (sid, subscription) = queued(&table, 4);
        let producer = {
            let table = Arc::clone(&table);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                table.deliver(message(sid, "late"));
            })
        };
        let received = subscription.next_message(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(received.payload, Bytes::from_static(b"late"));
        producer.join().unwrap();
    }

    #[test]
    fn test_limit_removes_after_last_delivery() {
        let table = SubscriptionTable::default();
        let (sid, subscription) = queued(&table, 8);
        table.deliver(message(sid, "1"));
        assert_eq!(table.set_limit(sid, 2), LimitOutcome::Limited { remaining: 1 });
        table.deliver(message(sid, "2"));
        assert!(!table.contains(sid));
        assert_eq!(table.deliver(message(sid, "3")), DeliveryOutcome::Unknown);

        // queued messages remain readable, then the end is reported
        assert!(subscription.next_message(None).is_ok());
        assert!(subscription.next_message(None).is_ok());
        assert!(matches!(subscription.next_message(None), Err(ClientError::Closed)));
    }

    #[test]
    fn test_limit_already_reached() {
        let table = SubscriptionTable::default();
        let (sid, _subscription) = queued(&table, 8);
        table.deliver(message(sid, "1"));
        assert_eq!(table.set_limit(sid, 1), LimitOutcome::Removed);
        assert_eq!(table.set_limit(sid, 1), LimitOutcome::Unknown);
    }

    #[test]
    fn test_handler_delivery_survives_panic() {
        let table = SubscriptionTable::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let sid = table.allocate_sid();
        let counter = Arc::clone(&calls);
        let handler: MessageHandler = Arc::new(move |message: Message| {
            counter.fetch_add(1, Ordering::SeqCst);
            if message.payload.as_ref() == b"boom" {
                panic!("handler failure");
            }
        });
        table.insert(sid, SubscriptionEntry::new("a", None, DeliveryTarget::Handler(handler)));

        assert_eq!(table.deliver(message(sid, "boom")), DeliveryOutcome::Delivered);
        assert_eq!(table.deliver(message(sid, "fine")), DeliveryOutcome::Delivered);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_resubscribe_frames_carry_remaining_limit() {
        let table = SubscriptionTable::default();
        let (first, _a) = queued(&table, 8);
        let sid = table.allocate_sid();
        let queue = Arc::new(MessageQueue::new(8).unwrap());
        table.insert(
            sid,
            SubscriptionEntry::new("jobs", Some("workers"), DeliveryTarget::Queue(queue)),
        );
        table.deliver(message(sid, "1"));
        table.set_limit(sid, 3);

        let frames = table.resubscribe_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], Bytes::from(format!("SUB orders.* {first}\r\n")));
        assert_eq!(
            frames[1],
            Bytes::from(format!("SUB jobs workers {sid}\r\nUNSUB {sid} 2\r\n"))
        );
    }

    #[test]
    fn test_close_all_ends_readers() {
        let table = SubscriptionTable::default();
        let (sid, subscription) = queued(&table, 8);
        table.close_all();
        assert!(!table.contains(sid));
        assert!(matches!(
            subscription.next_message(Some(Duration::from_secs(1))),
            Err(ClientError::Closed)
        ));
    }

    #[test]
    fn test_handler_subscription_has_no_queue() {
        let subscription = Subscription::new(1, "a", None, None, Arc::new(BlockingWait));
        assert!(matches!(
            subscription.next_message(None),
            Err(ClientError::HandlerSubscription)
        ));
        assert_eq!(subscription.pending(), 0);
    }
}
