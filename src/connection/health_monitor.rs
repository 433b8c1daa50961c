//! Pure health monitoring and reconnection logic
//!
//! Everything here is a pure function of its inputs so the engine's timing
//! decisions can be tested without sockets or clocks.

use super::state::ConnectionState;
use crate::config::ReconnectConfig;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt
    Proceed { attempt: u32, delay_ms: u64 },
    /// Abort reconnection - close requested
    AbortShutdownRequested,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

/// Health metrics for connection monitoring
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthMetrics {
    /// Time since connection established
    pub uptime: Option<Duration>,
    /// Time since the last inbound frame
    pub time_since_last_activity: Option<Duration>,
    pub reconnect_count: u64,
    pub is_healthy: bool,
    pub quality: ConnectionQuality,
}

/// Connection quality assessment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    /// Stable connection, no reconnects, long uptime
    Excellent,
    Good,
    /// Some reconnections, but working
    Fair,
    /// Frequent reconnections
    Poor,
    /// Not connected or silent for too long
    Critical,
}

impl HealthMonitor {
    /// Determine if reconnection should be attempted (pure function)
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = current_attempts + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.calculate_backoff_delay(attempt),
        }
    }

    /// Whether an outstanding PING has gone unanswered for longer than `timeout`
    pub fn is_stale(oldest_unanswered_ping: Option<Instant>, now: Instant, timeout: Duration) -> bool {
        oldest_unanswered_ping.is_some_and(|sent| now.saturating_duration_since(sent) >= timeout)
    }

    /// Earliest instant the engine must wake for timer work
    pub fn next_deadline(
        next_keepalive: Instant,
        oldest_unanswered_ping: Option<Instant>,
        ping_timeout: Duration,
    ) -> Instant {
        match oldest_unanswered_ping {
            Some(sent) => sent
                .checked_add(ping_timeout)
                .map_or(next_keepalive, |expiry| next_keepalive.min(expiry)),
            None => next_keepalive,
        }
    }

    /// Calculate health metrics for a connection (pure function)
    ///
    /// A connection is healthy while it has seen inbound traffic within
    /// `silence_limit`; the server answers keepalive PINGs, so a live link is
    /// never silent for long.
    pub fn calculate_health_metrics(
        connect_time: Option<Instant>,
        last_activity: Option<Instant>,
        reconnect_count: u64,
        silence_limit: Duration,
        now: Instant,
    ) -> HealthMetrics {
        let uptime = connect_time.map(|t| now.saturating_duration_since(t));
        let time_since_last_activity = last_activity.map(|t| now.saturating_duration_since(t));
        let is_healthy = match (uptime, time_since_last_activity) {
            (Some(_), None) => true,
            (Some(_), Some(silence)) => silence < silence_limit,
            _ => false,
        };

        let mut metrics = HealthMetrics {
            uptime,
            time_since_last_activity,
            reconnect_count,
            is_healthy,
            quality: ConnectionQuality::Critical,
        };
        metrics.quality = Self::assess_connection_quality(&metrics);
        metrics
    }

    /// Assess connection quality based on metrics (pure function)
    pub fn assess_connection_quality(metrics: &HealthMetrics) -> ConnectionQuality {
        if !metrics.is_healthy {
            return ConnectionQuality::Critical;
        }

        match (metrics.reconnect_count, metrics.uptime) {
            (0, Some(uptime)) if uptime > Duration::from_secs(3600) => ConnectionQuality::Excellent,
            (0, Some(_)) => ConnectionQuality::Good,
            (1..=2, Some(uptime)) if uptime > Duration::from_secs(1800) => ConnectionQuality::Good,
            (1..=2, Some(_)) => ConnectionQuality::Fair,
            (3..=5, _) => ConnectionQuality::Fair,
            (6..=10, _) => ConnectionQuality::Poor,
            _ => ConnectionQuality::Critical,
        }
    }

    /// Log connection state transition
    pub fn log_state_transition(from: ConnectionState, to: ConnectionState, reason: Option<&str>) {
        let reason = reason.unwrap_or("");
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("NATS connection established");
            }
            (ConnectionState::Connected, ConnectionState::Reconnecting) => {
                warn!(reason, "NATS connection lost, reconnecting");
            }
            (ConnectionState::Reconnecting, ConnectionState::Connected) => {
                info!("Reconnection successful");
            }
            (ConnectionState::Connected, ConnectionState::Closed) if reason.is_empty() => {
                info!("NATS connection closed");
            }
            (_, ConnectionState::Closed) if !reason.is_empty() => {
                error!(reason, "NATS connection closed permanently");
            }
            _ => {
                info!(%from, %to, "NATS connection state changed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_attempt_reconnection() {
        let config = ReconnectConfig::default();

        let decision = HealthMonitor::should_attempt_reconnection(0, &config, false);
        assert_eq!(
            decision,
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay_ms: 25
            }
        );

        let decision = HealthMonitor::should_attempt_reconnection(0, &config, true);
        assert_eq!(decision, ReconnectionDecision::AbortShutdownRequested);

        let decision = HealthMonitor::should_attempt_reconnection(2, &config, false);
        assert_eq!(
            decision,
            ReconnectionDecision::Proceed {
                attempt: 3,
                delay_ms: 100
            }
        );

        // unbounded by default: still proceeding far past any pattern
        let decision = HealthMonitor::should_attempt_reconnection(1000, &config, false);
        assert_eq!(
            decision,
            ReconnectionDecision::Proceed {
                attempt: 1001,
                delay_ms: 4000
            }
        );

        let limited = ReconnectConfig {
            max_attempts: Some(5),
            ..Default::default()
        };
        let decision = HealthMonitor::should_attempt_reconnection(5, &limited, false);
        assert_eq!(decision, ReconnectionDecision::AbortMaxAttemptsExceeded);
    }

    #[test]
    fn test_is_stale() {
        let now = Instant::now();
        let timeout = Duration::from_secs(2);
        assert!(!HealthMonitor::is_stale(None, now, timeout));
        assert!(!HealthMonitor::is_stale(Some(now), now, timeout));
        assert!(HealthMonitor::is_stale(
            Some(now - Duration::from_secs(3)),
            now,
            timeout
        ));
    }

    #[test]
    fn test_next_deadline_picks_earliest() {
        let now = Instant::now();
        let keepalive = now + Duration::from_secs(60);
        assert_eq!(
            HealthMonitor::next_deadline(keepalive, None, Duration::from_secs(5)),
            keepalive
        );
        assert_eq!(
            HealthMonitor::next_deadline(keepalive, Some(now), Duration::from_secs(5)),
            now + Duration::from_secs(5)
        );
        assert_eq!(
            HealthMonitor::next_deadline(keepalive, Some(now), Duration::MAX),
            keepalive
        );
    }

    #[test]
    fn test_calculate_health_metrics() {
        let now = Instant::now();
        let metrics = HealthMonitor::calculate_health_metrics(
            Some(now - Duration::from_secs(3600)),
            Some(now - Duration::from_secs(60)),
            2,
            Duration::from_secs(300),
            now,
        );
        assert!(metrics.uptime.is_some());
        assert_eq!(metrics.reconnect_count, 2);
        assert!(metrics.is_healthy);
        assert_eq!(metrics.quality, ConnectionQuality::Good);

        let silent = HealthMonitor::calculate_health_metrics(
            Some(now - Duration::from_secs(3600)),
            Some(now - Duration::from_secs(400)),
            0,
            Duration::from_secs(300),
            now,
        );
        assert!(!silent.is_healthy);
        assert_eq!(silent.quality, ConnectionQuality::Critical);

        let disconnected =
            HealthMonitor::calculate_health_metrics(None, None, 0, Duration::from_secs(300), now);
        assert!(!disconnected.is_healthy);
    }

    #[test]
    fn test_assess_connection_quality() {
        let base = HealthMetrics {
            uptime: Some(Duration::from_secs(7200)),
            time_since_last_activity: Some(Duration::from_secs(30)),
            reconnect_count: 0,
            is_healthy: true,
            quality: ConnectionQuality::Critical,
        };
        assert_eq!(
            HealthMonitor::assess_connection_quality(&base),
            ConnectionQuality::Excellent
        );

        let moderate = HealthMetrics {
            uptime: Some(Duration::from_secs(1800)),
            ..base.clone()
        };
        assert_eq!(
            HealthMonitor::assess_connection_quality(&moderate),
            ConnectionQuality::Good
        );

        let few = HealthMetrics {
            reconnect_count: 2,
            ..moderate.clone()
        };
        assert_eq!(
            HealthMonitor::assess_connection_quality(&few),
            ConnectionQuality::Fair
        );

        let many = HealthMetrics {
            reconnect_count: 8,
            ..moderate.clone()
        };
        assert_eq!(
            HealthMonitor::assess_connection_quality(&many),
            ConnectionQuality::Poor
        );

        let unhealthy = HealthMetrics {
            is_healthy: false,
            ..base
        };
        assert_eq!(
            HealthMonitor::assess_connection_quality(&unhealthy),
            ConnectionQuality::Critical
        );
    }
}
