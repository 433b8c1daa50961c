//! Connection lifecycle, handshake and health decisions

pub mod handshake;
pub mod health_monitor;
pub mod state;

pub use handshake::HandshakeError;
pub use health_monitor::{
    ConnectionQuality, HealthMetrics, HealthMonitor, ReconnectionDecision,
};
pub use state::{ConnectionEvent, ConnectionState, SharedState};
