//! Testing utilities
//!
//! An in-process mock NATS server, with an optional in-memory JetStream, so the
//! client can be tested without an external broker.

mod mock_jetstream;
pub mod mock_server;

pub use mock_server::{MockServer, MockServerConfig, PublishedMessage};
