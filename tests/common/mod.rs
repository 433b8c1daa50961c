//! Shared helpers for the integration tests

#![allow(dead_code)]

use blocking_nats::testing::MockServer;
use blocking_nats::ConnectOptions;
use std::time::Duration;

/// Options pointed at `server` with short reconnect delays
pub fn test_options(server: &MockServer) -> ConnectOptions {
    ConnectOptions::new()
        .with_server_url(server.url())
        .with_name("integration-test")
        .with_handshake_timeout(Duration::from_secs(2))
        .with_reconnect_delay(Duration::from_millis(10), Duration::from_millis(100))
}

/// A payload of `len` bytes whose first eight carry `index`
pub fn indexed_payload(index: usize, len: usize) -> Vec<u8> {
    let mut payload = vec![b'.'; len.max(8)];
    payload[..8].copy_from_slice(&(index as u64).to_be_bytes());
    payload
}

pub fn payload_index(payload: &[u8]) -> usize {
    let mut index = [0u8; 8];
    index.copy_from_slice(&payload[..8]);
    u64::from_be_bytes(index) as usize
}
