//! Blocking NATS client
//!
//! A synchronous client for the NATS text protocol whose socket work runs on a
//! dedicated background I/O engine thread.
//!
//! # Overview
//!
//! - `publish` only encodes into a shared outbound buffer and returns
//! - `flush` waits until the server has acknowledged everything enqueued before it
//! - Reconnection with exponential backoff, resubscription and replay of every
//!   publish the server has not acknowledged
//! - JetStream streams, pull consumers and acknowledged publishes over
//!   request/reply
//! - Bounded buffering with blocking or fail-fast backpressure
//! - Completion is signalled through eventfds, so cooperative schedulers can wait
//!   on a descriptor instead of blocking the thread
//!
//! # Quick Start
//!
//! ```no_run
//! use blocking_nats::{Client, ConnectOptions};
//! use std::time::Duration;
//!
//! let options = ConnectOptions::new()
//!     .with_server_url("nats://127.0.0.1:4222")
//!     .with_ping_interval(Duration::from_secs(20));
//! let client = Client::connect_with_options(options)?;
//!
//! let subscription = client.subscribe("orders.>")?;
//! client.publish("orders.created", b"order 42")?;
//! client.flush_timeout(Duration::from_secs(5))?;
//!
//! let message = subscription.next_message(Some(Duration::from_secs(1)))?;
//! assert_eq!(&message.payload[..], b"order 42");
//! client.close();
//! # Ok::<(), blocking_nats::ClientError>(())
//! ```

pub mod bridge;
pub mod client;
pub mod config;
pub mod connection;
mod engine;
pub mod error;
pub mod jetstream;
pub mod observability;
pub mod outbound;
pub mod protocol;
pub mod subscription;
pub mod testing;
pub mod transport;

pub use bridge::{BlockingWait, FnWait, WaitOutcome, WaitStrategy};
pub use client::Client;
pub use config::{BackpressurePolicy, ConnectOptions, ReconnectConfig};
pub use connection::{ConnectionQuality, ConnectionState, HealthMetrics};
pub use error::{ClientError, ClientResult, TimeoutKind};
pub use jetstream::JetStream;
pub use observability::StatisticsSnapshot;
pub use protocol::{HeaderMap, Message, ServerInfo};
pub use subscription::Subscription;
