//! Connection lifecycle
//!
//! The engine thread is the only writer of [`SharedState`]; any thread may read it.
//! Transitions are computed by the pure [`next_state`] function, and every applied
//! transition signals the client-wide eventfd so cooperative callers can observe
//! reconnects without polling.

use crate::bridge::EventFd;
use std::fmt;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
    /// Terminal
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Reconnecting,
            _ => ConnectionState::Closed,
        }
    }

    pub fn is_closed(self) -> bool {
        self == ConnectionState::Closed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Events that drive the lifecycle
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    ConnectRequested,
    /// INFO received, CONNECT sent, PONG returned without an error
    HandshakeSucceeded,
    /// Non-retryable handshake failure (auth rejection, timeout on first connect)
    HandshakeRejected(String),
    /// Socket error, stale keepalive, or server-initiated close
    ConnectionLost(String),
    RetriesExhausted,
    /// Protocol violation or authorization failure; never retried
    FatalError(String),
    CloseRequested,
}

impl ConnectionEvent {
    pub fn reason(&self) -> Option<&str> {
        match self {
            ConnectionEvent::HandshakeRejected(reason)
            | ConnectionEvent::ConnectionLost(reason)
            | ConnectionEvent::FatalError(reason) => Some(reason),
            ConnectionEvent::RetriesExhausted => Some("reconnect attempts exhausted"),
            _ => None,
        }
    }
}

/// Pure transition function; `None` means the event does not apply in `current`
pub fn next_state(current: ConnectionState, event: &ConnectionEvent) -> Option<ConnectionState> {
    use ConnectionEvent as E;
    use ConnectionState as S;

    match (current, event) {
        (S::Closed, _) => None,
        (_, E::CloseRequested) | (_, E::FatalError(_)) => Some(S::Closed),
        (S::Disconnected, E::ConnectRequested) => Some(S::Connecting),
        (S::Connecting | S::Reconnecting, E::HandshakeSucceeded) => Some(S::Connected),
        (S::Connecting | S::Reconnecting, E::HandshakeRejected(_)) => Some(S::Closed),
        (S::Connecting | S::Connected, E::ConnectionLost(_)) => Some(S::Reconnecting),
        (S::Reconnecting, E::RetriesExhausted) => Some(S::Closed),
        _ => None,
    }
}

/// Lifecycle state shared between the engine (writer) and callers (readers)
#[derive(Debug)]
pub struct SharedState {
    state: AtomicU8,
    events: EventFd,
}

impl SharedState {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            events: EventFd::new()?,
        })
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Apply `event`; returns `(from, to)` when a transition happened
    pub fn apply(&self, event: &ConnectionEvent) -> Option<(ConnectionState, ConnectionState)> {
        let from = self.get();
        let to = next_state(from, event)?;
        self.state.store(to as u8, Ordering::Release);
        self.notify();
        Some((from, to))
    }

    /// Signal the client-wide descriptor without a state change
    pub fn notify(&self) {
        if let Err(e) = self.events.signal() {
            tracing::warn!(error = %e, "failed to signal client eventfd");
        }
    }

    pub fn event_fd(&self) -> RawFd {
        self.events.as_raw_fd()
    }

    /// Acknowledge pending notifications on the client-wide descriptor
    pub fn clear_notifications(&self) -> std::io::Result<bool> {
        self.events.reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionEvent as E;
    use ConnectionState as S;

    #[test]
    fn test_happy_path() {
        assert_eq!(next_state(S::Disconnected, &E::ConnectRequested), Some(S::Connecting));
        assert_eq!(next_state(S::Connecting, &E::HandshakeSucceeded), Some(S::Connected));
        assert_eq!(
            next_state(S::Connected, &E::ConnectionLost("reset".into())),
            Some(S::Reconnecting)
        );
        assert_eq!(next_state(S::Reconnecting, &E::HandshakeSucceeded), Some(S::Connected));
        assert_eq!(next_state(S::Connected, &E::CloseRequested), Some(S::Closed));
    }

    #[test]
    fn test_failure_paths() {
        assert_eq!(
            next_state(S::Connecting, &E::HandshakeRejected("auth".into())),
            Some(S::Closed)
        );
        assert_eq!(next_state(S::Reconnecting, &E::RetriesExhausted), Some(S::Closed));
        assert_eq!(next_state(S::Reconnecting, &E::CloseRequested), Some(S::Closed));
        assert_eq!(
            next_state(S::Connected, &E::FatalError("bad".into())),
            Some(S::Closed)
        );
    }

    #[test]
    fn test_closed_is_terminal() {
        let events = [
            E::ConnectRequested,
            E::HandshakeSucceeded,
            E::ConnectionLost("x".into()),
            E::RetriesExhausted,
            E::CloseRequested,
        ];
        for event in &events {
            assert_eq!(next_state(S::Closed, event), None, "{event:?}");
        }
    }

    #[test]
    fn test_invalid_transitions_ignored() {
        assert_eq!(next_state(S::Connected, &E::ConnectRequested), None);
        assert_eq!(next_state(S::Disconnected, &E::HandshakeSucceeded), None);
        assert_eq!(next_state(S::Connected, &E::RetriesExhausted), None);
    }

    #[test]
    fn test_shared_state_signals_on_transition() {
        let shared = SharedState::new().unwrap();
        assert_eq!(shared.get(), S::Disconnected);
        assert!(!shared.clear_notifications().unwrap());

        assert_eq!(
            shared.apply(&E::ConnectRequested),
            Some((S::Disconnected, S::Connecting))
        );
        assert_eq!(shared.get(), S::Connecting);
        assert!(shared.clear_notifications().unwrap());

        // ignored event: no state change, no signal
        assert_eq!(shared.apply(&E::RetriesExhausted), None);
        assert!(!shared.clear_notifications().unwrap());
    }
}
