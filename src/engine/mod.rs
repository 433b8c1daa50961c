//! I/O engine
//!
//! Each client owns one dedicated thread running a current-thread tokio
//! runtime. The engine is the only code that touches the socket and the only
//! writer of the connection state. Caller threads reach it through the
//! [`OutboundBuffer`] (frames) and an unbounded command channel (flush, close);
//! it reports back through eventfd-backed completions.
//!
//! One loop iteration stages buffered frames, writes what the socket accepts,
//! checks keepalive deadlines, then sleeps until the socket, the buffer, a
//! command or a timer needs attention.

mod command;
mod dispatch;
mod flush;

pub(crate) use command::Command;

use crate::bridge::Completer;
use crate::config::ConnectOptions;
use crate::connection::handshake;
use crate::connection::{ConnectionEvent, ConnectionState, HealthMonitor, ReconnectionDecision, SharedState};
use crate::error::{ClientError, ClientResult, TimeoutKind};
use crate::observability::{connection_span, engine_span, ClientStatistics};
use crate::outbound::{OutboundBuffer, OutboundFrame, WriteQueue};
use crate::protocol::codec::StreamDecoder;
use crate::protocol::{ConnectInfo, ServerInfo, ServerOp};
use crate::subscription::SubscriptionTable;
use crate::transport::{ReadOutcome, Readiness, ServerAddress, SocketTransport};
use flush::FlushTracker;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Instrument};

/// Largest batch moved from the outbound buffer into the write queue at once
const MAX_DRAIN_BYTES: usize = 1024 * 1024;

/// Reads per readiness wakeup before other work gets a turn
const MAX_READS_PER_WAKE: usize = 16;

/// Decoder limit until the server announces its own
const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Time `close` allows for buffered frames to reach the socket
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// State shared between the engine thread and the client handles
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) options: ConnectOptions,
    pub(crate) address: ServerAddress,
    pub(crate) buffer: OutboundBuffer,
    pub(crate) state: SharedState,
    pub(crate) subscriptions: SubscriptionTable,
    pub(crate) statistics: ClientStatistics,
    /// Highest frame sequence number covered by a received PONG
    acked_seq: AtomicU64,
    /// From INFO; 0 until the first handshake
    max_payload: AtomicUsize,
    headers: AtomicBool,
    server_info: Mutex<Option<ServerInfo>>,
    fatal: Mutex<Option<ClientError>>,
}

impl Shared {
    pub(crate) fn new(options: ConnectOptions, address: ServerAddress) -> io::Result<Self> {
        Ok(Self {
            buffer: OutboundBuffer::new(options.outbound_ceiling_bytes, options.backpressure),
            state: SharedState::new()?,
            subscriptions: SubscriptionTable::default(),
            statistics: ClientStatistics::new(),
            acked_seq: AtomicU64::new(0),
            max_payload: AtomicUsize::new(0),
            headers: AtomicBool::new(true),
            server_info: Mutex::new(None),
            fatal: Mutex::new(None),
            options,
            address,
        })
    }

    pub(crate) fn acked_seq(&self) -> u64 {
        self.acked_seq.load(Ordering::Acquire)
    }

    fn acknowledge(&self, covers: u64) {
        self.acked_seq.fetch_max(covers, Ordering::AcqRel);
    }

    /// Server payload limit, once known
    pub(crate) fn max_payload(&self) -> Option<usize> {
        match self.max_payload.load(Ordering::Relaxed) {
            0 => None,
            max => Some(max),
        }
    }

    /// Assumed true until the server says otherwise
    pub(crate) fn headers_supported(&self) -> bool {
        self.headers.load(Ordering::Relaxed)
    }

    pub(crate) fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.lock().clone()
    }

    fn set_server_info(&self, info: ServerInfo) {
        self.max_payload.store(info.max_payload, Ordering::Relaxed);
        self.headers.store(info.headers, Ordering::Relaxed);
        *self.server_info.lock() = Some(info);
    }

    pub(crate) fn fatal_error(&self) -> Option<ClientError> {
        self.fatal.lock().clone()
    }

    fn set_fatal(&self, error: ClientError) {
        self.fatal.lock().get_or_insert(error);
    }

    /// Error reported to callers once the engine has stopped
    pub(crate) fn terminal_error(&self) -> ClientError {
        self.fatal_error().unwrap_or(ClientError::Closed)
    }
}

/// Why a connected session ended
#[derive(Debug)]
enum SessionEnd {
    Lost(String),
    Closed,
    Fatal(ClientError),
}

enum Wake {
    Command(Option<Command>),
    Socket(io::Result<Readiness>),
    Work,
    Timer,
}

/// Start the engine thread; `ready` receives the first connection's outcome
pub(crate) fn spawn(
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    connect_info: ConnectInfo,
    ready: Completer<ClientResult<()>>,
) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("nats-io-engine".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    ready.complete(Err(ClientError::connection(format!(
                        "failed to start I/O engine: {e}"
                    ))));
                    return;
                }
            };
            let span = engine_span!(server = %shared.address);
            let engine = Engine::new(shared, commands, connect_info, ready);
            runtime.block_on(engine.run().instrument(span));
        })
}

pub(crate) struct Engine {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    connect_info: ConnectInfo,
    writer: WriteQueue,
    flushes: FlushTracker,
    decoder: StreamDecoder<ServerOp>,
    drained: VecDeque<OutboundFrame>,
    reconnect_attempts: u32,
    connected_once: bool,
    close_requested: bool,
    ready: Option<Completer<ClientResult<()>>>,
}

impl Engine {
    fn new(
        shared: Arc<Shared>,
        commands: mpsc::UnboundedReceiver<Command>,
        connect_info: ConnectInfo,
        ready: Completer<ClientResult<()>>,
    ) -> Self {
        Self {
            shared,
            commands,
            connect_info,
            writer: WriteQueue::new(),
            flushes: FlushTracker::new(),
            decoder: StreamDecoder::new(DEFAULT_MAX_PAYLOAD),
            drained: VecDeque::new(),
            reconnect_attempts: 0,
            connected_once: false,
            close_requested: false,
            ready: Some(ready),
        }
    }

    async fn run(mut self) {
        info!("I/O engine started");
        self.transition(ConnectionEvent::ConnectRequested);
        let end = loop {
            let transport = match self.establish().await {
                Ok(transport) => transport,
                Err(error) => break error,
            };
            match self.drive(transport).await {
                SessionEnd::Lost(reason) => self.connection_lost(reason),
                SessionEnd::Closed => break ClientError::Closed,
                SessionEnd::Fatal(error) => break error,
            }
        };
        self.finish(end);
    }

    fn transition(&self, event: ConnectionEvent) {
        if let Some((from, to)) = self.shared.state.apply(&event) {
            HealthMonitor::log_state_transition(from, to, event.reason());
        }
    }

    fn resolve_ready(&mut self, result: ClientResult<()>) {
        if let Some(ready) = self.ready.take() {
            ready.complete(result);
        }
    }

    /// Returns false when the client asked to close
    fn handle_command(&mut self, command: Option<Command>) -> bool {
        let open = Self::apply_command(&self.shared, &mut self.flushes, command);
        if !open {
            self.close_requested = true;
        }
        open
    }

    /// Borrows only what a command touches, so it can run beside a handshake
    fn apply_command(shared: &Shared, flushes: &mut FlushTracker, command: Option<Command>) -> bool {
        match command {
            Some(Command::Flush { target, completer }) => {
                if target <= shared.acked_seq() {
                    completer.complete(Ok(()));
                } else {
                    flushes.register(target, completer);
                }
                true
            }
            Some(Command::Close) | None => false,
        }
    }

    /// Sleep for a backoff delay while still accepting commands
    async fn pause(&mut self, delay: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                command = self.commands.recv() => {
                    if !self.handle_command(command) {
                        return false;
                    }
                }
            }
        }
    }

    /// Connect (or reconnect) until a session is up or retrying must stop
    async fn establish(&mut self) -> Result<SocketTransport, ClientError> {
        let timeout = self.shared.options.handshake_timeout();
        loop {
            if self.shared.state.get() == ConnectionState::Reconnecting {
                match HealthMonitor::should_attempt_reconnection(
                    self.reconnect_attempts,
                    &self.shared.options.reconnect,
                    self.close_requested,
                ) {
                    ReconnectionDecision::Proceed { attempt, delay_ms } => {
                        self.reconnect_attempts = attempt;
                        debug!(attempt, delay_ms, "waiting before reconnect attempt");
                        if !self.pause(Duration::from_millis(delay_ms)).await {
                            return Err(ClientError::Closed);
                        }
                    }
                    ReconnectionDecision::AbortShutdownRequested => return Err(ClientError::Closed),
                    ReconnectionDecision::AbortMaxAttemptsExceeded => {
                        return Err(ClientError::transient_io(format!(
                            "gave up reconnecting to {} after {} attempts",
                            self.shared.address, self.reconnect_attempts
                        )));
                    }
                }
            }

            let span = connection_span!(
                server = %self.shared.address,
                attempt = self.reconnect_attempts
            );
            let result = {
                let attempt = handshake::connect(
                    &self.shared.address,
                    &self.connect_info,
                    timeout,
                    &mut self.decoder,
                )
                .instrument(span);
                tokio::pin!(attempt);
                loop {
                    tokio::select! {
                        result = &mut attempt => break result,
                        command = self.commands.recv() => {
                            if !Self::apply_command(&self.shared, &mut self.flushes, command) {
                                self.close_requested = true;
                                debug!("close requested during handshake");
                                return Err(ClientError::Closed);
                            }
                        }
                    }
                }
            };

            let error = match result {
                Ok((transport, info)) => {
                    self.on_connected(info);
                    return Ok(transport);
                }
                Err(error) => error,
            };
            self.shared.statistics.record_error(&error.to_string());
            if !error.is_retryable() {
                return Err(ClientError::connection(error.to_string()));
            }

            if self.shared.state.get() == ConnectionState::Connecting {
                if !self.shared.options.retry_on_initial_connect {
                    return Err(match error {
                        handshake::HandshakeError::Timeout(_) => {
                            ClientError::TimedOut(TimeoutKind::Handshake)
                        }
                        other => ClientError::connection(format!(
                            "failed to connect to {}: {other}",
                            self.shared.address
                        )),
                    });
                }
                // the caller gets its client now; the engine keeps trying
                self.transition(ConnectionEvent::ConnectionLost(error.to_string()));
                self.resolve_ready(Ok(()));
            } else {
                warn!(
                    attempt = self.reconnect_attempts,
                    error = %error,
                    "reconnect attempt failed"
                );
            }
        }
    }

    fn on_connected(&mut self, info: ServerInfo) {
        let is_reconnect = self.connected_once;
        info!(
            server_id = %info.server_id,
            version = %info.version,
            is_reconnect,
            "connected to NATS server"
        );
        self.shared.set_server_info(info);

        let replayed = self
            .writer
            .prepare_reconnect(self.shared.subscriptions.resubscribe_frames());
        if replayed > 0 {
            self.shared.statistics.messages_replayed(replayed);
            debug!(replayed, "resending unacknowledged publishes");
        }

        self.connected_once = true;
        self.reconnect_attempts = 0;
        self.transition(ConnectionEvent::HandshakeSucceeded);
        self.shared.statistics.connection_established(is_reconnect);
        self.resolve_ready(Ok(()));
    }

    fn connection_lost(&mut self, reason: String) {
        self.shared.statistics.connection_lost();
        self.shared.statistics.record_error(&reason);
        let released = self.writer.on_disconnect();
        self.shared.buffer.release(released);
        self.flushes.on_disconnect(self.shared.acked_seq());
        self.decoder.clear();
        self.transition(ConnectionEvent::ConnectionLost(reason));
    }

    fn stage_ping(&mut self) {
        let covers = self.writer.stage_ping();
        self.flushes.ping_staged(covers);
    }

    /// Whether the replay log has room for more unacknowledged publishes
    ///
    /// While closed, new frames wait in the outbound buffer (and backpressure
    /// reaches publishers) until a PONG trims the log.
    fn window_open(&self) -> bool {
        self.writer.replay_bytes() < self.shared.options.max_unacked_bytes
    }

    /// Move buffered frames into the write queue and schedule PINGs
    fn stage_outbound(&mut self, drain_all: bool) {
        if drain_all {
            self.shared.buffer.drain_into(&mut self.drained, usize::MAX);
            self.writer.stage_buffered(&mut self.drained);
        } else if !self.writer.has_pending() && self.window_open() {
            let room = self.shared.options.max_unacked_bytes - self.writer.replay_bytes();
            self.shared.buffer.drain_into(&mut self.drained, room.min(MAX_DRAIN_BYTES));
            self.writer.stage_buffered(&mut self.drained);
        }
        let max_unacked = self.shared.options.max_unacked_bytes;
        if self.flushes.needs_ping(self.writer.highest_staged_seq()) {
            self.stage_ping();
        } else if self.flushes.outstanding_pings() == 0 && self.writer.replay_bytes() > max_unacked / 2 {
            // acknowledge the log before the window closes
            self.stage_ping();
        }
    }

    fn write_staged(&mut self, transport: &SocketTransport) -> io::Result<()> {
        let report = self.writer.write_to(transport)?;
        self.shared.buffer.release(report.released);
        if report.pings_written > 0 {
            self.flushes.pings_written(report.pings_written, Instant::now());
            self.shared.statistics.pings_sent(report.pings_written);
        }
        self.shared
            .statistics
            .messages_written(report.messages_written, report.message_bytes_written);
        Ok(())
    }

    fn read_available(&mut self, transport: &SocketTransport) -> Option<SessionEnd> {
        for _ in 0..MAX_READS_PER_WAKE {
            match transport.try_read(self.decoder.buffer_mut()) {
                Ok(ReadOutcome::Data(_)) => {
                    self.shared.statistics.activity();
                    if let Some(end) = self.process_frames() {
                        return Some(end);
                    }
                }
                Ok(ReadOutcome::WouldBlock) => return None,
                Ok(ReadOutcome::Closed) => {
                    return Some(SessionEnd::Lost("server closed the connection".to_string()))
                }
                Err(e) => return Some(SessionEnd::Lost(format!("read failed: {e}"))),
            }
        }
        None
    }

    /// Run one connected session until it ends
    async fn drive(&mut self, transport: SocketTransport) -> SessionEnd {
        if self.close_requested {
            return self.close_gracefully(transport).await;
        }
        let ping_interval = self.shared.options.ping_interval();
        let ping_timeout = self.shared.options.ping_timeout();
        let mut next_keepalive = Instant::now() + ping_interval;

        // bytes that arrived together with the handshake PONG
        if let Some(end) = self.process_frames() {
            return end;
        }

        loop {
            self.stage_outbound(false);
            if let Err(e) = self.write_staged(&transport) {
                return SessionEnd::Lost(format!("write failed: {e}"));
            }

            let now = Instant::now();
            if HealthMonitor::is_stale(self.flushes.oldest_unanswered(), now, ping_timeout) {
                return SessionEnd::Lost("no PONG within ping timeout".to_string());
            }
            if now >= next_keepalive {
                if self.flushes.outstanding_pings() == 0 {
                    self.stage_ping();
                }
                next_keepalive = now + ping_interval;
                continue;
            }

            let deadline = HealthMonitor::next_deadline(
                next_keepalive,
                self.flushes.oldest_unanswered(),
                ping_timeout,
            );
            let want_write = self.writer.has_pending();
            let more_buffered =
                !want_write && self.window_open() && self.shared.buffer.queued_frames() > 0;

            let wake = tokio::select! {
                biased;
                command = self.commands.recv() => Wake::Command(command),
                ready = transport.readiness(want_write) => Wake::Socket(ready),
                _ = self.shared.buffer.notified() => Wake::Work,
                _ = std::future::ready(()), if more_buffered => Wake::Work,
                _ = tokio::time::sleep_until(deadline.into()) => Wake::Timer,
            };

            match wake {
                Wake::Command(command) => {
                    if !self.handle_command(command) {
                        return self.close_gracefully(transport).await;
                    }
                }
                Wake::Socket(Ok(readiness)) => {
                    if readiness.readable || readiness.closed {
                        if let Some(end) = self.read_available(&transport) {
                            return end;
                        }
                    }
                }
                Wake::Socket(Err(e)) => return SessionEnd::Lost(format!("socket error: {e}")),
                Wake::Work | Wake::Timer => {}
            }
        }
    }

    /// Give buffered frames a short grace period to reach the socket
    async fn close_gracefully(&mut self, mut transport: SocketTransport) -> SessionEnd {
        self.shared.buffer.close();
        let deadline = tokio::time::Instant::now() + CLOSE_GRACE;
        loop {
            self.stage_outbound(true);
            if self.write_staged(&transport).is_err() {
                break;
            }
            if !self.writer.has_pending() {
                break;
            }
            match tokio::time::timeout_at(deadline, transport.readiness(true)).await {
                Ok(Ok(_)) => {}
                _ => {
                    warn!(
                        unwritten = self.writer.staged_frames(),
                        "close grace period expired with frames unwritten"
                    );
                    break;
                }
            }
        }
        if let Err(e) = transport.shutdown().await {
            debug!(error = %e, "socket shutdown failed");
        }
        SessionEnd::Closed
    }

    fn finish(&mut self, error: ClientError) {
        let event = match (&error, self.shared.state.get()) {
            (ClientError::Closed, _) => ConnectionEvent::CloseRequested,
            (ClientError::TransientIo(_), ConnectionState::Reconnecting) => {
                ConnectionEvent::RetriesExhausted
            }
            (_, ConnectionState::Connecting) => ConnectionEvent::HandshakeRejected(error.to_string()),
            _ => ConnectionEvent::FatalError(error.to_string()),
        };
        if !matches!(error, ClientError::Closed) {
            self.shared.set_fatal(error.clone());
        }
        // state first, so callers woken below observe Closed
        self.transition(event);

        let released = self.writer.clear();
        self.shared.buffer.release(released);
        self.shared.buffer.close();
        self.flushes.fail_all(&error);
        self.shared.subscriptions.close_all();
        self.resolve_ready(Err(error));
        info!("I/O engine stopped");
    }
}
