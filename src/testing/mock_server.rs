//! In-process NATS server for tests
//!
//! Speaks enough of the protocol to exercise the client end to end: handshake
//! with optional token auth, PUB/HPUB recording, SUB/UNSUB routing with queue
//! groups and auto-unsubscribe, no-responders replies, an optional in-memory
//! JetStream, and a handful of fault switches (stalled reads, refused
//! connections, withheld INFO, a one-shot connection kill).

use super::mock_jetstream::{MockJetStream, Outbound};
use crate::protocol::codec::{ClientOp, StreamDecoder};
use crate::protocol::subject::subject_matches;
use crate::protocol::{ConnectInfo, HeaderMap, ServerInfo, ServerOp};
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

const STALL_POLL: Duration = Duration::from_millis(5);

/// Startup behaviour of a [`MockServer`]
#[derive(Debug, Clone)]
pub struct MockServerConfig {
    /// Token a client must present in CONNECT
    pub auth_token: Option<String>,
    pub max_payload: usize,
    /// Advertise header support in INFO
    pub headers: bool,
    /// Answer PINGs after the handshake
    pub answer_pings: bool,
    /// Once this many publishes are recorded, the next PING is answered as usual;
    /// after that the connection records nothing and is closed at the following
    /// PING without a PONG. Applies to one connection per server.
    pub kill_after: Option<usize>,
    /// When false, accepted connections never receive INFO
    pub send_info: bool,
    /// Serve the JetStream API and capture publishes into streams
    pub jetstream: bool,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            auth_token: None,
            max_payload: 1024 * 1024,
            headers: true,
            answer_pings: true,
            kill_after: None,
            send_info: true,
            jetstream: false,
        }
    }
}

impl MockServerConfig {
    pub fn with_auth_token<S: Into<String>>(mut self, token: S) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_max_payload(mut self, bytes: usize) -> Self {
        self.max_payload = bytes;
        self
    }

    pub fn without_headers(mut self) -> Self {
        self.headers = false;
        self
    }

    pub fn without_pongs(mut self) -> Self {
        self.answer_pings = false;
        self
    }

    pub fn with_kill_after(mut self, messages: usize) -> Self {
        self.kill_after = Some(messages);
        self
    }

    pub fn without_info(mut self) -> Self {
        self.send_info = false;
        self
    }

    pub fn with_jetstream(mut self) -> Self {
        self.jetstream = true;
        self
    }
}

/// A publish as the server received it
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub subject: String,
    pub reply: Option<String>,
    pub headers: Option<HeaderMap>,
    pub payload: Bytes,
    /// Which accepted connection carried it, starting at 1
    pub connection: u64,
}

#[derive(Debug)]
enum Outgoing {
    Frame(Bytes),
    /// Send FIN and stop processing input
    Close,
}

#[derive(Debug)]
struct RemoteSubscription {
    subject: String,
    queue_group: Option<String>,
    max: Option<u64>,
    delivered: u64,
}

#[derive(Debug)]
struct ConnectedClient {
    outbound: mpsc::UnboundedSender<Outgoing>,
    subscriptions: HashMap<u64, RemoteSubscription>,
}

#[derive(Debug, Default)]
struct Registry {
    published: Vec<PublishedMessage>,
    clients: HashMap<u64, ConnectedClient>,
    connects: Vec<ConnectInfo>,
    jetstream: MockJetStream,
}

#[derive(Debug)]
struct ServerState {
    config: MockServerConfig,
    port: u16,
    registry: Mutex<Registry>,
    accepting: AtomicBool,
    stalled: AtomicBool,
    answer_pings: AtomicBool,
    send_info: AtomicBool,
    killed: AtomicBool,
    connections: AtomicU64,
    queue_cursor: AtomicUsize,
}

impl ServerState {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock()
    }

    fn info(&self) -> ServerInfo {
        ServerInfo {
            server_id: "MOCKSERVER".to_string(),
            server_name: "mock".to_string(),
            version: "2.10.0".to_string(),
            host: "127.0.0.1".to_string(),
            port: self.port,
            proto: 1,
            max_payload: self.config.max_payload,
            headers: self.config.headers,
            auth_required: self.config.auth_token.is_some(),
            jetstream: self.config.jetstream,
            ..ServerInfo::default()
        }
    }

    /// Deliver to matching subscriptions; returns the number of deliveries
    fn route(&self, registry: &mut Registry, delivery: &Delivery<'_>) -> usize {
        let mut plain = Vec::new();
        let mut groups: HashMap<String, Vec<(u64, u64)>> = HashMap::new();
        for (client_id, client) in &registry.clients {
            for (sid, sub) in &client.subscriptions {
                if !subject_matches(&sub.subject, delivery.target) {
                    continue;
                }
                match &sub.queue_group {
                    Some(group) => groups.entry(group.clone()).or_default().push((*client_id, *sid)),
                    None => plain.push((*client_id, *sid)),
                }
            }
        }
        for mut members in groups.into_values() {
            members.sort_unstable();
            let pick = self.queue_cursor.fetch_add(1, Ordering::Relaxed) % members.len();
            plain.push(members[pick]);
        }

        for (client_id, sid) in &plain {
            let Some(client) = registry.clients.get_mut(client_id) else {
                continue;
            };
            let frame = ServerOp::Msg {
                subject: delivery.subject.to_string(),
                sid: *sid,
                reply: delivery.reply.map(str::to_string),
                headers: delivery.headers.cloned(),
                status: delivery.status,
                description: delivery.description.map(str::to_string),
                payload: delivery.payload.clone(),
            };
            if let Ok(bytes) = frame.to_bytes() {
                let _ = client.outbound.send(Outgoing::Frame(bytes));
            }
            if let Some(sub) = client.subscriptions.get_mut(sid) {
                sub.delivered += 1;
                if sub.max.is_some_and(|max| sub.delivered >= max) {
                    client.subscriptions.remove(sid);
                }
            }
        }
        plain.len()
    }

    fn route_all(&self, registry: &mut Registry, outbound: Vec<Outbound>) {
        for message in outbound {
            self.route(
                registry,
                &Delivery {
                    target: &message.inbox,
                    subject: &message.subject,
                    reply: message.reply.as_deref(),
                    headers: message.headers.as_ref(),
                    status: message.status,
                    description: message.description.as_deref(),
                    payload: message.payload,
                },
            );
        }
    }
}

struct Delivery<'a> {
    /// Subject matched against subscriptions
    target: &'a str,
    /// Subject carried in the MSG frame
    subject: &'a str,
    reply: Option<&'a str>,
    headers: Option<&'a HeaderMap>,
    status: Option<u16>,
    description: Option<&'a str>,
    payload: Bytes,
}

impl<'a> Delivery<'a> {
    fn plain(subject: &'a str, payload: Bytes) -> Self {
        Self {
            target: subject,
            subject,
            reply: None,
            headers: None,
            status: None,
            description: None,
            payload,
        }
    }
}

/// NATS-speaking TCP server on an ephemeral localhost port
///
/// Runs on its own thread and tokio runtime; dropping it stops the server and
/// disconnects every client.
#[derive(Debug)]
pub struct MockServer {
    address: SocketAddr,
    state: Arc<ServerState>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MockServer {
    pub fn start() -> io::Result<Self> {
        Self::start_with(MockServerConfig::default())
    }

    pub fn start_with(config: MockServerConfig) -> io::Result<Self> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let address = listener.local_addr()?;
        let state = Arc::new(ServerState {
            answer_pings: AtomicBool::new(config.answer_pings),
            send_info: AtomicBool::new(config.send_info),
            config,
            port: address.port(),
            registry: Mutex::new(Registry::default()),
            accepting: AtomicBool::new(true),
            stalled: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            connections: AtomicU64::new(0),
            queue_cursor: AtomicUsize::new(0),
        });

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (shutdown, stop) = oneshot::channel();
        let server_state = Arc::clone(&state);
        let thread = std::thread::Builder::new()
            .name("nats-mock-server".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = match TcpListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(e) => {
                            debug!(error = %e, "mock server failed to register listener");
                            return;
                        }
                    };
                    tokio::select! {
                        _ = stop => {}
                        _ = accept_loop(listener, server_state) => {}
                    }
                });
            })?;

        Ok(Self {
            address,
            state,
            shutdown: Some(shutdown),
            thread: Some(thread),
        })
    }

    pub fn url(&self) -> String {
        format!("nats://{}", self.address)
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.registry().published.clone()
    }

    pub fn published_count(&self) -> usize {
        self.state.registry().published.len()
    }

    /// Payloads of every publish to `subject`, in arrival order
    pub fn payloads_for(&self, subject: &str) -> Vec<Bytes> {
        self.state
            .registry()
            .published
            .iter()
            .filter(|message| message.subject == subject)
            .map(|message| message.payload.clone())
            .collect()
    }

    /// CONNECT bodies received so far
    pub fn connects(&self) -> Vec<ConnectInfo> {
        self.state.registry().connects.clone()
    }

    /// Connections accepted and served (refused ones are not counted)
    pub fn connection_count(&self) -> u64 {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Subscriptions currently registered across all clients
    pub fn subscription_count(&self) -> usize {
        self.state
            .registry()
            .clients
            .values()
            .map(|client| client.subscriptions.len())
            .sum()
    }

    /// Accept and immediately drop new connections until resumed
    pub fn pause_accepting(&self) {
        self.state.accepting.store(false, Ordering::SeqCst);
    }

    pub fn resume_accepting(&self) {
        self.state.accepting.store(true, Ordering::SeqCst);
    }

    /// Stop reading from every connection; the clients' socket buffers fill up
    pub fn stall_reads(&self, stalled: bool) {
        self.state.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn set_answer_pings(&self, answer: bool) {
        self.state.answer_pings.store(answer, Ordering::SeqCst);
    }

    /// Whether connections accepted from now on receive INFO
    pub fn set_send_info(&self, send: bool) {
        self.state.send_info.store(send, Ordering::SeqCst);
    }

    /// Messages held by a JetStream stream, `None` if it does not exist
    pub fn stream_len(&self, stream: &str) -> Option<usize> {
        self.state.registry().jetstream.stream_len(stream)
    }

    /// Close every live connection
    pub fn disconnect_all(&self) {
        for client in self.state.registry().clients.values() {
            let _ = client.outbound.send(Outgoing::Close);
        }
    }

    /// Send `-ERR '<reason>'` to every live connection
    pub fn send_error(&self, reason: &str) {
        let Ok(frame) = ServerOp::Err(reason.to_string()).to_bytes() else {
            return;
        };
        for client in self.state.registry().clients.values() {
            let _ = client.outbound.send(Outgoing::Frame(frame.clone()));
        }
    }

    /// Publish from the server side to every matching subscription
    pub fn inject(&self, subject: &str, payload: impl Into<Bytes>) -> usize {
        let mut registry = self.state.registry();
        self.state
            .route(&mut registry, &Delivery::plain(subject, payload.into()))
    }

    /// Poll until `condition` holds or `timeout` passes
    pub fn wait_until<F: Fn(&MockServer) -> bool>(&self, timeout: Duration, condition: F) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if condition(self) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<ServerState>) {
    loop {
        let Ok((stream, peer)) = listener.accept().await else {
            continue;
        };
        if !state.accepting.load(Ordering::SeqCst) {
            debug!(%peer, "mock server refusing connection");
            drop(stream);
            continue;
        }
        let id = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(serve(stream, id, Arc::clone(&state)));
    }
}

/// Per-connection protocol state
struct Session {
    id: u64,
    state: Arc<ServerState>,
    outbound: mpsc::UnboundedSender<Outgoing>,
    handshake_done: bool,
    /// Input is dropped until the next PING closes the connection
    doomed: bool,
}

impl Session {
    fn send(&self, op: ServerOp) {
        if let Ok(bytes) = op.to_bytes() {
            let _ = self.outbound.send(Outgoing::Frame(bytes));
        }
    }

    fn close(&self) {
        let _ = self.outbound.send(Outgoing::Close);
    }

    /// Handle one client op; returns false once the connection is being closed
    fn handle(&mut self, op: ClientOp) -> bool {
        if self.doomed {
            if op == ClientOp::Ping {
                debug!(connection = self.id, "mock server killing connection");
                self.close();
                return false;
            }
            return true;
        }
        match op {
            ClientOp::Connect(info) => {
                let authorized = match &self.state.config.auth_token {
                    Some(token) => info.auth_token.as_deref() == Some(token.as_str()),
                    None => true,
                };
                self.state.registry().connects.push(*info);
                if !authorized {
                    self.send(ServerOp::Err("Authorization Violation".to_string()));
                    self.close();
                    return false;
                }
            }
            ClientOp::Ping => {
                if !self.handshake_done {
                    self.handshake_done = true;
                    self.send(ServerOp::Pong);
                    return true;
                }
                let doomed = self.state.config.kill_after.is_some_and(|after| {
                    self.state.registry().published.len() >= after
                        && !self.state.killed.swap(true, Ordering::SeqCst)
                });
                if doomed {
                    self.doomed = true;
                    self.send(ServerOp::Pong);
                    return true;
                }
                if self.state.answer_pings.load(Ordering::SeqCst) {
                    self.send(ServerOp::Pong);
                }
            }
            ClientOp::Pong => {}
            ClientOp::Pub {
                subject,
                reply,
                headers,
                payload,
            } => {
                let mut registry = self.state.registry();
                if self.state.config.jetstream {
                    if MockJetStream::is_api(&subject) {
                        let replies = registry.jetstream.api(&subject, &payload, reply.as_deref());
                        self.state.route_all(&mut registry, replies);
                        return true;
                    }
                    if MockJetStream::is_ack(&subject) {
                        let replies =
                            registry
                                .jetstream
                                .acknowledge(&subject, &payload, reply.as_deref());
                        self.state.route_all(&mut registry, replies);
                        return true;
                    }
                }
                registry.published.push(PublishedMessage {
                    subject: subject.clone(),
                    reply: reply.clone(),
                    headers: headers.clone(),
                    payload: payload.clone(),
                    connection: self.id,
                });
                let captured = if self.state.config.jetstream {
                    registry.jetstream.capture(
                        &subject,
                        headers.as_ref(),
                        &payload,
                        reply.as_deref(),
                    )
                } else {
                    None
                };
                let delivered = self.state.route(
                    &mut registry,
                    &Delivery {
                        reply: reply.as_deref(),
                        headers: headers.as_ref(),
                        ..Delivery::plain(&subject, payload)
                    },
                );
                if let Some(replies) = captured {
                    self.state.route_all(&mut registry, replies);
                } else if delivered == 0 && self.state.config.headers {
                    if let Some(reply) = reply.as_deref() {
                        self.state.route(
                            &mut registry,
                            &Delivery {
                                status: Some(503),
                                ..Delivery::plain(reply, Bytes::new())
                            },
                        );
                    }
                }
            }
            ClientOp::Sub {
                subject,
                queue_group,
                sid,
            } => {
                if let Some(client) = self.state.registry().clients.get_mut(&self.id) {
                    // a resubscription after reconnect may repeat a SUB
                    client.subscriptions.insert(
                        sid,
                        RemoteSubscription {
                            subject,
                            queue_group,
                            max: None,
                            delivered: 0,
                        },
                    );
                }
            }
            ClientOp::Unsub { sid, max } => {
                if let Some(client) = self.state.registry().clients.get_mut(&self.id) {
                    let keep = match (client.subscriptions.get_mut(&sid), max) {
                        (Some(sub), Some(max)) if sub.delivered < max => {
                            sub.max = Some(max);
                            true
                        }
                        _ => false,
                    };
                    if !keep {
                        client.subscriptions.remove(&sid);
                    }
                }
            }
        }
        true
    }
}

async fn serve(stream: TcpStream, id: u64, state: Arc<ServerState>) {
    let (mut reader, mut writer) = stream.into_split();
    let (outbound, mut queued) = mpsc::unbounded_channel();
    state.registry().clients.insert(
        id,
        ConnectedClient {
            outbound: outbound.clone(),
            subscriptions: HashMap::new(),
        },
    );

    let mut session = Session {
        id,
        state: Arc::clone(&state),
        outbound,
        handshake_done: false,
        doomed: false,
    };
    if state.send_info.load(Ordering::SeqCst) {
        session.send(ServerOp::Info(Box::new(state.info())));
    }

    let mut decoder = StreamDecoder::<ClientOp>::new(state.config.max_payload);
    // input after a closing frame is dropped unread; queued output still goes out
    let mut discard_input = false;
    let mut output_closed = false;
    loop {
        let stalled = !discard_input && state.stalled.load(Ordering::SeqCst);
        tokio::select! {
            outgoing = queued.recv() => match outgoing {
                Some(Outgoing::Frame(bytes)) if !output_closed => {
                    if writer.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                Some(Outgoing::Frame(_)) => {}
                Some(Outgoing::Close) => {
                    discard_input = true;
                    output_closed = true;
                    decoder.clear();
                    let _ = writer.shutdown().await;
                }
                None => break,
            },
            read = reader.read_buf(decoder.buffer_mut()), if !stalled => match read {
                Ok(0) | Err(_) => break,
                Ok(_) if discard_input => decoder.clear(),
                Ok(_) => loop {
                    match decoder.next_frame() {
                        Ok(Some(op)) => {
                            if !session.handle(op) {
                                discard_input = true;
                                decoder.clear();
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            session.send(ServerOp::Err(e.to_string()));
                            session.close();
                            discard_input = true;
                            decoder.clear();
                            break;
                        }
                    }
                },
            },
            _ = tokio::time::sleep(STALL_POLL), if stalled => {}
        }
    }

    state.registry().clients.remove(&id);
    debug!(connection = id, "mock server connection ended");
}
