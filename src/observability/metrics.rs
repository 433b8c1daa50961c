//! Per-client statistics
//!
//! Counters are atomics bumped by the engine and by publishing threads; a
//! [`StatisticsSnapshot`] is a consistent-enough copy for reporting.

use chrono::{DateTime, Utc};
use serde::Serialize;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Live counters for one client
#[derive(Debug)]
pub struct ClientStatistics {
    in_msgs: AtomicU64,
    in_bytes: AtomicU64,
    out_msgs: AtomicU64,
    out_bytes: AtomicU64,
    connects: AtomicU64,
    reconnects: AtomicU64,
    flushes: AtomicU64,
    pings_sent: AtomicU64,
    pongs_received: AtomicU64,
    dropped_messages: AtomicU64,
    replayed_messages: AtomicU64,
    server_errors: AtomicU64,

    created_at: DateTime<Utc>,
    timing: Mutex<Timing>,
}

#[derive(Debug, Default)]
struct Timing {
    connected_at: Option<Instant>,
    connected_since: Option<DateTime<Utc>>,
    last_activity: Option<Instant>,
    last_error: Option<String>,
}

impl Default for ClientStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientStatistics {
    pub fn new() -> Self {
        Self {
            in_msgs: AtomicU64::new(0),
            in_bytes: AtomicU64::new(0),
            out_msgs: AtomicU64::new(0),
            out_bytes: AtomicU64::new(0),
            connects: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            pings_sent: AtomicU64::new(0),
            pongs_received: AtomicU64::new(0),
            dropped_messages: AtomicU64::new(0),
            replayed_messages: AtomicU64::new(0),
            server_errors: AtomicU64::new(0),
            created_at: Utc::now(),
            timing: Mutex::new(Timing::default()),
        }
    }

    fn with_timing<R>(&self, f: impl FnOnce(&mut Timing) -> R) -> R {
        f(&mut self.timing.lock())
    }

    pub fn message_received(&self, payload_len: usize) {
        self.in_msgs.fetch_add(1, Ordering::Relaxed);
        self.in_bytes
            .fetch_add(payload_len as u64, Ordering::Relaxed);
    }

    pub fn messages_written(&self, count: u64, bytes: u64) {
        if count == 0 {
            return;
        }
        self.out_msgs.fetch_add(count, Ordering::Relaxed);
        self.out_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn connection_established(&self, is_reconnect: bool) {
        self.connects.fetch_add(1, Ordering::Relaxed);
        if is_reconnect {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
        }
        self.with_timing(|t| {
            t.connected_at = Some(Instant::now());
            t.connected_since = Some(Utc::now());
            t.last_activity = None;
        });
    }

    pub fn connection_lost(&self) {
        self.with_timing(|t| {
            t.connected_at = None;
            t.connected_since = None;
        });
    }

    /// Any inbound frame counts as activity
    pub fn activity(&self) {
        self.with_timing(|t| t.last_activity = Some(Instant::now()));
    }

    pub fn flush_requested(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pings_sent(&self, count: usize) {
        self.pings_sent.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn pong_received(&self) {
        self.pongs_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.dropped_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_replayed(&self, count: usize) {
        self.replayed_messages
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn server_error(&self, reason: &str) {
        self.server_errors.fetch_add(1, Ordering::Relaxed);
        self.record_error(reason);
    }

    pub fn record_error(&self, reason: &str) {
        let reason = crate::error::sanitize_error_message(reason);
        self.with_timing(|t| t.last_error = Some(reason));
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// `(connected_at, last_activity)` for health assessment
    pub fn connection_times(&self) -> (Option<Instant>, Option<Instant>) {
        self.with_timing(|t| (t.connected_at, t.last_activity.or(t.connected_at)))
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let (connected_since, uptime_seconds, last_error) = self.with_timing(|t| {
            (
                t.connected_since,
                t.connected_at.map(|at| at.elapsed().as_secs()),
                t.last_error.clone(),
            )
        });
        StatisticsSnapshot {
            in_msgs: self.in_msgs.load(Ordering::Relaxed),
            in_bytes: self.in_bytes.load(Ordering::Relaxed),
            out_msgs: self.out_msgs.load(Ordering::Relaxed),
            out_bytes: self.out_bytes.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            pings_sent: self.pings_sent.load(Ordering::Relaxed),
            pongs_received: self.pongs_received.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
            replayed_messages: self.replayed_messages.load(Ordering::Relaxed),
            server_errors: self.server_errors.load(Ordering::Relaxed),
            created_at: self.created_at,
            connected_since,
            uptime_seconds,
            last_error,
            timestamp: Utc::now(),
        }
    }
}

/// Point-in-time copy of [`ClientStatistics`]
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatisticsSnapshot {
    pub in_msgs: u64,
    pub in_bytes: u64,
    pub out_msgs: u64,
    pub out_bytes: u64,
    pub connects: u64,
    pub reconnects: u64,
    pub flushes: u64,
    pub pings_sent: u64,
    pub pongs_received: u64,
    /// Messages discarded because a subscription queue was full
    pub dropped_messages: u64,
    pub replayed_messages: u64,
    pub server_errors: u64,
    pub created_at: DateTime<Utc>,
    pub connected_since: Option<DateTime<Utc>>,
    pub uptime_seconds: Option<u64>,
    pub last_error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters() {
        let stats = ClientStatistics::new();
        stats.message_received(10);
        stats.message_received(5);
        stats.messages_written(3, 300);
        stats.messages_written(0, 0);
        stats.flush_requested();
        stats.pings_sent(2);
        stats.pong_received();
        stats.message_dropped();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.in_msgs, 2);
        assert_eq!(snapshot.in_bytes, 15);
        assert_eq!(snapshot.out_msgs, 3);
        assert_eq!(snapshot.out_bytes, 300);
        assert_eq!(snapshot.flushes, 1);
        assert_eq!(snapshot.pings_sent, 2);
        assert_eq!(snapshot.pongs_received, 1);
        assert_eq!(snapshot.dropped_messages, 1);
    }

    #[test]
    fn test_connection_tracking() {
        let stats = ClientStatistics::new();
        assert_eq!(stats.connection_times(), (None, None));

        stats.connection_established(false);
        stats.connection_established(true);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connects, 2);
        assert_eq!(snapshot.reconnects, 1);
        assert!(snapshot.connected_since.is_some());
        assert!(stats.connection_times().0.is_some());

        stats.connection_lost();
        assert!(stats.snapshot().uptime_seconds.is_none());
    }

    #[test]
    fn test_server_error_is_sanitized() {
        let stats = ClientStatistics::new();
        stats.server_error("Authorization Violation token=abc123");
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.server_errors, 1);
        let last_error = snapshot.last_error.unwrap();
        assert!(!last_error.contains("abc123"));
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = ClientStatistics::new();
        stats.connection_established(false);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["connects"], 1);
        assert!(json["created_at"].is_string());
    }

    #[test]
    fn test_thread_safety() {
        let stats = Arc::new(ClientStatistics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.message_received(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.snapshot().in_msgs, 8000);
    }
}
