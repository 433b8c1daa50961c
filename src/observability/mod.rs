//! Observability: structured logging setup and per-client statistics

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{ClientStatistics, StatisticsSnapshot};

// Span macros for structured logging
pub use crate::{connection_span, engine_span};
