//! Public client handle
//!
//! [`Client`] is a cheap, cloneable handle; all clones share one connection and
//! one I/O engine thread. Publishing only encodes and enqueues. Operations that
//! wait (`connect`, `flush`, `request`, `next_message`) wait on an eventfd
//! through the client's [`WaitStrategy`].

use crate::bridge::{completion, BlockingWait, PendingError, WaitStrategy};
use crate::config::ConnectOptions;
use crate::connection::handshake::build_connect_info;
use crate::connection::{ConnectionState, HealthMetrics, HealthMonitor};
use crate::engine::{self, Command, Shared};
use crate::error::{ClientError, ClientResult, TimeoutKind};
use crate::observability::StatisticsSnapshot;
use crate::outbound::FrameKind;
use crate::protocol::codec::{encode_pub, encode_sub, encode_unsub};
use crate::protocol::subject::{
    validate_publish_subject, validate_queue_group, validate_subscribe_subject,
};
use crate::protocol::{HeaderMap, Message, ServerInfo};
use crate::subscription::{
    DeliveryTarget, LimitOutcome, MessageQueue, Subscription, SubscriptionEntry,
};
use crate::transport::ServerAddress;
use crate::jetstream::JetStream;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Status code carried by the server's no-responders reply
const NO_RESPONDERS_STATUS: u16 = 503;

/// Handle to one NATS connection
///
/// ```no_run
/// use blocking_nats::Client;
/// use std::time::Duration;
///
/// let client = Client::connect("nats://127.0.0.1:4222")?;
/// for i in 0..1000 {
///     client.publish("metrics.cpu", format!("{i}"))?;
/// }
/// client.flush_timeout(Duration::from_secs(5))?;
/// client.close();
/// # Ok::<(), blocking_nats::ClientError>(())
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    wait: Arc<dyn WaitStrategy>,
    engine: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("server", &self.inner.shared.address)
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    /// Stop the engine and wait for its thread, unless called from that thread
    fn shutdown(&self) {
        // the engine may already be gone
        let _ = self.commands.send(Command::Close);
        let handle = self.engine.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("I/O engine thread panicked");
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Client {
    /// Connect with default options
    pub fn connect(address: &str) -> ClientResult<Client> {
        Self::connect_with_options(ConnectOptions::new().with_server_url(address))
    }

    /// Connect to `options.server_url`
    pub fn connect_with_options(options: ConnectOptions) -> ClientResult<Client> {
        Self::connect_with_wait(options, Arc::new(BlockingWait))
    }

    /// Connect, waiting on every completion through `wait`
    ///
    /// Cooperative schedulers pass a strategy that parks the current task until
    /// the descriptor is readable instead of blocking the OS thread.
    pub fn connect_with_wait(
        options: ConnectOptions,
        wait: Arc<dyn WaitStrategy>,
    ) -> ClientResult<Client> {
        options.validate()?;
        let address: ServerAddress = options
            .server_url
            .parse()
            .map_err(|e: String| ClientError::Config(e))?;
        let credentials = options.resolve_credentials()?;
        let connect_info = build_connect_info(&options, &credentials, &address);

        let shared = Arc::new(Shared::new(options, address)?);
        let (commands, receiver) = mpsc::unbounded_channel();
        let (ready, pending) = completion()?;
        let handle = engine::spawn(Arc::clone(&shared), receiver, connect_info, ready)?;

        let inner = Arc::new(Inner {
            shared,
            commands,
            wait,
            engine: Mutex::new(Some(handle)),
        });
        let outcome = match pending.wait(&*inner.wait, None) {
            Ok(result) => result,
            Err(PendingError::Abandoned) => Err(inner.shared.terminal_error()),
            Err(PendingError::TimedOut) => Err(ClientError::TimedOut(TimeoutKind::Handshake)),
            Err(PendingError::Wait(e)) => Err(e.into()),
        };
        // on failure dropping `inner` joins the engine thread
        outcome?;
        info!(server = %inner.shared.address, "client connected");
        Ok(Client { inner })
    }

    fn shared(&self) -> &Shared {
        &self.inner.shared
    }

    /// Fail with the stored fatal error, or `Closed`, once the client is unusable
    fn ensure_open(&self) -> ClientResult<()> {
        if let Some(error) = self.shared().fatal_error() {
            return Err(error);
        }
        if self.shared().state.get().is_closed() {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    fn send(&self, command: Command) -> ClientResult<()> {
        self.inner
            .commands
            .send(command)
            .map_err(|_| self.shared().terminal_error())
    }

    fn enqueue_control(&self, bytes: Bytes) -> ClientResult<()> {
        self.shared()
            .buffer
            .enqueue(FrameKind::Control, bytes)
            .map(|_| ())
            .map_err(|e| self.surface(e))
    }

    /// Replace a bare `Closed` with the fatal error that closed the client
    fn surface(&self, error: ClientError) -> ClientError {
        match error {
            ClientError::Closed => self.shared().terminal_error(),
            other => other,
        }
    }

    pub fn publish(&self, subject: &str, payload: impl AsRef<[u8]>) -> ClientResult<()> {
        self.publish_frame(subject, None, None, payload.as_ref())
    }

    pub fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: impl AsRef<[u8]>,
    ) -> ClientResult<()> {
        self.publish_frame(subject, Some(reply), None, payload.as_ref())
    }

    /// Publish with a `NATS/1.0` header block (`HPUB`)
    pub fn publish_with_headers(
        &self,
        subject: &str,
        headers: &HeaderMap,
        payload: impl AsRef<[u8]>,
    ) -> ClientResult<()> {
        self.publish_frame(subject, None, Some(headers), payload.as_ref())
    }

    pub fn publish_with_reply_and_headers(
        &self,
        subject: &str,
        reply: &str,
        headers: &HeaderMap,
        payload: impl AsRef<[u8]>,
    ) -> ClientResult<()> {
        self.publish_frame(subject, Some(reply), Some(headers), payload.as_ref())
    }

    fn publish_frame(
        &self,
        subject: &str,
        reply: Option<&str>,
        headers: Option<&HeaderMap>,
        payload: &[u8],
    ) -> ClientResult<()> {
        self.ensure_open()?;
        validate_publish_subject(subject)
            .map_err(|e| ClientError::InvalidSubject(format!("{subject:?}: {e}")))?;
        if let Some(reply) = reply {
            validate_publish_subject(reply)
                .map_err(|e| ClientError::InvalidSubject(format!("reply {reply:?}: {e}")))?;
        }
        if headers.is_some() && !self.shared().headers_supported() {
            return Err(ClientError::HeadersNotSupported);
        }

        let mut frame = BytesMut::new();
        encode_pub(&mut frame, subject, reply, headers, payload);
        if let Some(max) = self.shared().max_payload() {
            let size = payload.len() + headers.map_or(0, |h| h.to_block().len());
            if size > max {
                return Err(ClientError::MaxPayloadExceeded { size, max });
            }
        }

        self.shared()
            .buffer
            .enqueue(FrameKind::Publish, frame.freeze())
            .map(|_| ())
            .map_err(|e| self.surface(e))
    }

    /// Flush with the configured default timeout
    pub fn flush(&self) -> ClientResult<()> {
        self.flush_timeout(self.shared().options.flush_timeout())
    }

    /// Wait until everything enqueued so far is acknowledged by the server
    ///
    /// On timeout the enqueued frames still go out; only the wait ends.
    pub fn flush_timeout(&self, timeout: Duration) -> ClientResult<()> {
        self.ensure_open()?;
        let target = self.shared().buffer.last_seq();
        if target <= self.shared().acked_seq() {
            return Ok(());
        }
        self.shared().statistics.flush_requested();

        let (completer, pending) = completion()?;
        self.send(Command::Flush { target, completer })?;
        match pending.wait(&*self.inner.wait, Some(timeout)) {
            Ok(result) => result,
            Err(PendingError::TimedOut) => Err(ClientError::TimedOut(TimeoutKind::Flush)),
            Err(PendingError::Abandoned) => Err(self.shared().terminal_error()),
            Err(PendingError::Wait(e)) => Err(e.into()),
        }
    }

    pub fn subscribe(&self, subject: &str) -> ClientResult<Subscription> {
        self.subscribe_queued(subject, None)
    }

    /// Subscribe as a member of `queue_group`; each message goes to one member
    pub fn queue_subscribe(&self, subject: &str, queue_group: &str) -> ClientResult<Subscription> {
        validate_queue_group(queue_group)
            .map_err(|e| ClientError::InvalidSubject(format!("queue group {queue_group:?}: {e}")))?;
        self.subscribe_queued(subject, Some(queue_group))
    }

    fn subscribe_queued(&self, subject: &str, queue_group: Option<&str>) -> ClientResult<Subscription> {
        let queue = Arc::new(MessageQueue::new(self.shared().options.subscription_capacity)?);
        let sid = self.register(subject, queue_group, DeliveryTarget::Queue(Arc::clone(&queue)))?;
        Ok(Subscription::new(
            sid,
            subject,
            queue_group,
            Some(queue),
            Arc::clone(&self.inner.wait),
        ))
    }

    /// Deliver messages to `handler` on the engine thread
    ///
    /// The handler must not block: it delays every other subscription and
    /// the connection's keepalive.
    pub fn subscribe_with_handler<F>(&self, subject: &str, handler: F) -> ClientResult<Subscription>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let sid = self.register(subject, None, DeliveryTarget::Handler(Arc::new(handler)))?;
        Ok(Subscription::new(
            sid,
            subject,
            None,
            None,
            Arc::clone(&self.inner.wait),
        ))
    }

    fn register(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        target: DeliveryTarget,
    ) -> ClientResult<u64> {
        self.ensure_open()?;
        validate_subscribe_subject(subject)
            .map_err(|e| ClientError::InvalidSubject(format!("{subject:?}: {e}")))?;

        let table = &self.shared().subscriptions;
        let sid = table.allocate_sid();
        table.insert(sid, SubscriptionEntry::new(subject, queue_group, target));

        let mut frame = BytesMut::new();
        encode_sub(&mut frame, subject, queue_group, sid);
        if let Err(e) = self.enqueue_control(frame.freeze()) {
            table.remove(sid);
            return Err(e);
        }
        debug!(sid, subject, "subscribed");
        Ok(sid)
    }

    /// Stop delivery immediately; queued messages stay readable
    pub fn unsubscribe(&self, subscription: &Subscription) -> ClientResult<()> {
        let sid = subscription.sid();
        if !self.shared().subscriptions.remove(sid) {
            return Ok(());
        }
        let mut frame = BytesMut::new();
        encode_unsub(&mut frame, sid, None);
        self.enqueue_control(frame.freeze())
    }

    /// End the subscription after `max` messages in total have been delivered
    pub fn unsubscribe_after(&self, subscription: &Subscription, max: u64) -> ClientResult<()> {
        let sid = subscription.sid();
        let mut frame = BytesMut::new();
        match self.shared().subscriptions.set_limit(sid, max) {
            LimitOutcome::Unknown => return Ok(()),
            LimitOutcome::Removed => encode_unsub(&mut frame, sid, None),
            LimitOutcome::Limited { .. } => encode_unsub(&mut frame, sid, Some(max)),
        }
        self.enqueue_control(frame.freeze())
    }

    /// Withdraw interest, wait for the server to confirm, then end the subscription
    ///
    /// Messages the server sent before it processed the UNSUB are still
    /// delivered and stay readable afterwards.
    pub fn drain(&self, subscription: &Subscription) -> ClientResult<()> {
        let sid = subscription.sid();
        if !self.shared().subscriptions.contains(sid) {
            return Ok(());
        }
        let mut frame = BytesMut::new();
        encode_unsub(&mut frame, sid, None);
        self.enqueue_control(frame.freeze())?;
        let flushed = self.flush();
        self.shared().subscriptions.remove(sid);
        flushed
    }

    /// A unique subject for replies: `<inbox_prefix>.<uuid>`
    pub fn new_inbox(&self) -> String {
        format!(
            "{}.{}",
            self.shared().options.inbox_prefix,
            Uuid::new_v4().simple()
        )
    }

    /// Publish to `subject` and wait for the first reply
    pub fn request(
        &self,
        subject: &str,
        payload: impl AsRef<[u8]>,
        timeout: Duration,
    ) -> ClientResult<Message> {
        self.request_frame(subject, None, payload.as_ref(), timeout)
    }

    /// [`Client::request`] with a header block on the request
    pub fn request_with_headers(
        &self,
        subject: &str,
        headers: &HeaderMap,
        payload: impl AsRef<[u8]>,
        timeout: Duration,
    ) -> ClientResult<Message> {
        self.request_frame(subject, Some(headers), payload.as_ref(), timeout)
    }

    fn request_frame(
        &self,
        subject: &str,
        headers: Option<&HeaderMap>,
        payload: &[u8],
        timeout: Duration,
    ) -> ClientResult<Message> {
        let started = Instant::now();
        let inbox = self.new_inbox();
        let subscription = self.subscribe(&inbox)?;
        self.unsubscribe_after(&subscription, 1)?;
        if let Err(e) = self.publish_frame(subject, Some(&inbox), headers, payload) {
            self.unsubscribe(&subscription)?;
            return Err(e);
        }

        match subscription.next_message(Some(timeout)) {
            Ok(message) if message.status == Some(NO_RESPONDERS_STATUS) => {
                Err(ClientError::NoResponders)
            }
            Ok(message) => {
                debug!(elapsed_ms = started.elapsed().as_millis() as u64, "request answered");
                Ok(message)
            }
            Err(ClientError::TimedOut(_)) => {
                self.unsubscribe(&subscription)?;
                Err(ClientError::TimedOut(TimeoutKind::Request))
            }
            Err(ClientError::Closed) => Err(self.shared().terminal_error()),
            Err(other) => Err(other),
        }
    }

    /// JetStream context sharing this connection
    pub fn jetstream(&self) -> JetStream {
        JetStream::new(self.clone())
    }

    /// Close the connection and stop the engine thread
    ///
    /// Buffered frames get a short grace period to be written. Pending flushes
    /// fail with `Closed`, blocked publishers are woken, and every subscription
    /// ends. Idempotent.
    pub fn close(&self) {
        self.inner.shutdown();
    }

    pub fn state(&self) -> ConnectionState {
        self.shared().state.get()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    /// The fatal error that closed the client, if any
    pub fn last_fatal_error(&self) -> Option<ClientError> {
        self.shared().fatal_error()
    }

    /// INFO from the most recent handshake
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.shared().server_info()
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.shared().statistics.snapshot()
    }

    pub fn health(&self) -> HealthMetrics {
        let (connected_at, last_activity) = self.shared().statistics.connection_times();
        let options = &self.shared().options;
        HealthMonitor::calculate_health_metrics(
            connected_at,
            last_activity,
            self.shared().statistics.reconnects(),
            options.ping_interval() + options.ping_timeout(),
            Instant::now(),
        )
    }

    /// Descriptor signalled on every state change and asynchronous server error
    ///
    /// Call [`Client::clear_events`] after it becomes readable.
    pub fn event_fd(&self) -> RawFd {
        self.shared().state.event_fd()
    }

    /// Acknowledge the event descriptor; true if anything was pending
    pub fn clear_events(&self) -> ClientResult<bool> {
        Ok(self.shared().state.clear_notifications()?)
    }

    /// Bytes enqueued but not yet accepted by the socket
    pub fn buffered_bytes(&self) -> usize {
        self.shared().buffer.accounted_bytes()
    }
}
