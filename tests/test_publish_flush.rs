//! Publish and flush behavior against the in-process mock server
//!
//! Covers wire ordering, flush acknowledgement and timeouts, backpressure under
//! both policies, payload limits, headers and close semantics.

mod common;

use blocking_nats::testing::{MockServer, MockServerConfig};
use blocking_nats::{
    BackpressurePolicy, Client, ClientError, ConnectionState, HeaderMap, TimeoutKind,
};
use common::{indexed_payload, payload_index, test_options};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

#[test]
fn test_thousand_large_messages_arrive_in_order() {
    let server = MockServer::start().unwrap();
    let options = test_options(&server).with_ping_interval(Duration::from_secs(20));
    let client = Client::connect_with_options(options).unwrap();

    for i in 0..1000 {
        client
            .publish("bulk.data", indexed_payload(i, 10 * 1024))
            .unwrap();
    }
    client.flush_timeout(Duration::from_secs(5)).unwrap();

    let received = server.payloads_for("bulk.data");
    assert_eq!(received.len(), 1000);
    for (expected, payload) in received.iter().enumerate() {
        assert_eq!(payload.len(), 10 * 1024);
        assert_eq!(payload_index(payload), expected);
    }

    let stats = client.statistics();
    assert_eq!(stats.out_msgs, 1000);
    assert!(stats.pongs_received >= 1);
    client.close();
}

#[test]
fn test_flush_without_pending_publishes_returns_immediately() {
    let server = MockServer::start().unwrap();
    let client = Client::connect_with_options(test_options(&server)).unwrap();

    let started = Instant::now();
    client.flush_timeout(Duration::from_secs(5)).unwrap();
    client.flush().unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(client.statistics().flushes, 0);

    client.publish("once", "x").unwrap();
    client.flush().unwrap();
    // already acknowledged, nothing to wait for
    let started = Instant::now();
    client.flush().unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(client.statistics().flushes, 1);
}

#[test]
fn test_flush_timeout_does_not_lose_data() {
    let server = MockServer::start().unwrap();
    let client = Client::connect_with_options(test_options(&server)).unwrap();

    server.stall_reads(true);
    for i in 0..20 {
        client.publish("stalled", indexed_payload(i, 64)).unwrap();
    }
    let result = client.flush_timeout(Duration::from_millis(100));
    assert!(matches!(result, Err(ClientError::TimedOut(TimeoutKind::Flush))));
    assert_eq!(client.state(), ConnectionState::Connected);

    server.stall_reads(false);
    client.flush_timeout(Duration::from_secs(5)).unwrap();
    let received = server.payloads_for("stalled");
    assert_eq!(received.len(), 20);
    assert!(received
        .iter()
        .enumerate()
        .all(|(i, payload)| payload_index(payload) == i));
}

#[test]
fn test_concurrent_publishers_keep_per_thread_order() {
    const THREADS: u32 = 6;
    const PER_THREAD: u32 = 250;
    let server = MockServer::start().unwrap();
    let client = Client::connect_with_options(test_options(&server)).unwrap();

    let start = Arc::new(Barrier::new(THREADS as usize));
    let publishers: Vec<_> = (0..THREADS)
        .map(|thread| {
            let client = client.clone();
            let start = Arc::clone(&start);
            std::thread::spawn(move || {
                start.wait();
                for index in 0..PER_THREAD {
                    let mut payload = thread.to_be_bytes().to_vec();
                    payload.extend_from_slice(&index.to_be_bytes());
                    client.publish("fan.in", payload).unwrap();
                }
            })
        })
        .collect();
    for publisher in publishers {
        publisher.join().unwrap();
    }
    client.flush_timeout(Duration::from_secs(10)).unwrap();

    let mut next = vec![0u32; THREADS as usize];
    for payload in server.payloads_for("fan.in") {
        let thread = u32::from_be_bytes(payload[..4].try_into().unwrap()) as usize;
        let index = u32::from_be_bytes(payload[4..8].try_into().unwrap());
        assert_eq!(index, next[thread], "publisher {thread} out of order");
        next[thread] += 1;
    }
    assert_eq!(next, vec![PER_THREAD; THREADS as usize]);
}

#[test]
fn test_maximum_timeouts_wait_without_overflow() {
    let server = MockServer::start().unwrap();
    let client = Client::connect_with_options(test_options(&server)).unwrap();
    let subscription = client.subscribe("unbounded").unwrap();

    client.publish("unbounded", "x").unwrap();
    client.flush_timeout(Duration::MAX).unwrap();
    let message = subscription.next_message(Some(Duration::MAX)).unwrap();
    assert_eq!(&message.payload[..], b"x");

    let error = Client::connect_with_options(
        test_options(&server).with_ping_interval(Duration::MAX),
    )
    .unwrap_err();
    assert!(matches!(&error, ClientError::Config(msg) if msg.contains("ping_interval_ms")));
}

#[test]
fn test_fail_fast_backpressure_rejects_beyond_ceiling() {
    let server = MockServer::start().unwrap();
    server.pause_accepting();
    let options = test_options(&server)
        .with_retry_on_initial_connect()
        .with_outbound_ceiling(1024 * 1024)
        .with_backpressure(BackpressurePolicy::FailFast);
    let client = Client::connect_with_options(options).unwrap();
    assert_eq!(client.state(), ConnectionState::Reconnecting);

    let mut accepted = 0;
    let mut rejected = 0;
    for i in 0..2048 {
        match client.publish("pressure", indexed_payload(i, 1024)) {
            Ok(()) => {
                assert_eq!(rejected, 0, "accepted a publish after rejecting one");
                accepted += 1;
            }
            Err(ClientError::BufferFull { queued, ceiling }) => {
                assert_eq!(ceiling, 1024 * 1024);
                assert!(queued <= ceiling);
                rejected += 1;
                break;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
        assert!(client.buffered_bytes() <= 1024 * 1024);
    }
    assert!(rejected > 0, "2MB never hit a 1MB ceiling");
    assert!(accepted > 900);

    server.resume_accepting();
    client.flush_timeout(Duration::from_secs(10)).unwrap();
    let received = server.payloads_for("pressure");
    assert_eq!(received.len(), accepted);
    assert_eq!(client.buffered_bytes(), 0);
}

#[test]
fn test_blocking_backpressure_waits_for_drain() {
    let server = MockServer::start().unwrap();
    server.pause_accepting();
    let options = test_options(&server)
        .with_retry_on_initial_connect()
        .with_outbound_ceiling(1024 * 1024)
        .with_backpressure(BackpressurePolicy::Block);
    let client = Client::connect_with_options(options).unwrap();

    let published = Arc::new(AtomicUsize::new(0));
    let producer = {
        let client = client.clone();
        let published = Arc::clone(&published);
        std::thread::spawn(move || {
            for i in 0..2048 {
                client.publish("blocked", indexed_payload(i, 1024)).unwrap();
                published.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    std::thread::sleep(Duration::from_millis(300));
    let stuck_at = published.load(Ordering::SeqCst);
    assert!(stuck_at < 2048, "producer was never blocked");
    assert!(client.buffered_bytes() <= 1024 * 1024);

    server.resume_accepting();
    producer.join().unwrap();
    client.flush_timeout(Duration::from_secs(10)).unwrap();

    let received = server.payloads_for("blocked");
    assert_eq!(received.len(), 2048);
    assert!(received
        .iter()
        .enumerate()
        .all(|(i, payload)| payload_index(payload) == i));
}

#[test]
fn test_payload_above_server_maximum_is_rejected() {
    let server = MockServer::start_with(MockServerConfig::default().with_max_payload(1024)).unwrap();
    let client = Client::connect_with_options(test_options(&server)).unwrap();
    assert_eq!(client.server_info().unwrap().max_payload, 1024);

    let result = client.publish("big", vec![0u8; 2000]);
    assert!(matches!(
        result,
        Err(ClientError::MaxPayloadExceeded { size: 2000, max: 1024 })
    ));

    client.publish("big", vec![0u8; 1024]).unwrap();
    client.flush().unwrap();
    assert_eq!(server.payloads_for("big").len(), 1);
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[test]
fn test_invalid_subjects_are_rejected() {
    let server = MockServer::start().unwrap();
    let client = Client::connect_with_options(test_options(&server)).unwrap();

    for subject in ["", "has space", "orders.*", "orders.>", "trailing."] {
        assert!(
            matches!(client.publish(subject, "x"), Err(ClientError::InvalidSubject(_))),
            "subject {subject:?} was accepted"
        );
    }
    assert!(matches!(
        client.publish_with_reply("ok", "bad reply", "x"),
        Err(ClientError::InvalidSubject(_))
    ));
}

#[test]
fn test_headers_and_reply_reach_the_server() {
    let server = MockServer::start().unwrap();
    let client = Client::connect_with_options(test_options(&server)).unwrap();

    let mut headers = HeaderMap::new();
    headers.insert("Trace-Id", "abc-123");
    headers.append("Tag", "one");
    headers.append("Tag", "two");
    client
        .publish_with_reply_and_headers("traced", "replies.here", &headers, "body")
        .unwrap();
    client.publish_with_reply("plain", "replies.there", "body").unwrap();
    client.flush().unwrap();

    let published = server.published();
    assert_eq!(published.len(), 2);
    let traced = &published[0];
    assert_eq!(traced.reply.as_deref(), Some("replies.here"));
    let received = traced.headers.as_ref().unwrap();
    assert_eq!(received.get("Trace-Id"), Some("abc-123"));
    assert_eq!(received.get_all("Tag").collect::<Vec<_>>(), vec!["one", "two"]);
    assert_eq!(&traced.payload[..], b"body");

    assert_eq!(published[1].reply.as_deref(), Some("replies.there"));
    assert!(published[1].headers.is_none());
}

#[test]
fn test_headers_require_server_support() {
    let server = MockServer::start_with(MockServerConfig::default().without_headers()).unwrap();
    let client = Client::connect_with_options(test_options(&server)).unwrap();

    let mut headers = HeaderMap::new();
    headers.insert("Key", "value");
    assert!(matches!(
        client.publish_with_headers("h", &headers, "x"),
        Err(ClientError::HeadersNotSupported)
    ));
    client.publish("h", "x").unwrap();
}

#[test]
fn test_close_writes_buffered_data_and_rejects_further_use() {
    let server = MockServer::start().unwrap();
    let client = Client::connect_with_options(test_options(&server)).unwrap();
    let subscription = client.subscribe("closing.>").unwrap();

    for i in 0..50 {
        client.publish("closing.data", indexed_payload(i, 128)).unwrap();
    }
    client.close();

    assert!(client.is_closed());
    assert!(server.wait_until(Duration::from_secs(2), |s| s.payloads_for("closing.data").len() == 50));
    assert!(matches!(client.publish("closing.data", "late"), Err(ClientError::Closed)));
    assert!(matches!(client.flush(), Err(ClientError::Closed)));
    assert!(matches!(client.subscribe("more"), Err(ClientError::Closed)));
    assert!(client.last_fatal_error().is_none());

    // already-delivered messages may remain; afterwards the subscription reports Closed
    loop {
        match subscription.next_message(Some(Duration::from_secs(1))) {
            Ok(_) => continue,
            Err(error) => {
                assert!(matches!(error, ClientError::Closed));
                break;
            }
        }
    }

    // idempotent
    client.close();
}

#[test]
fn test_dropping_last_handle_stops_the_engine() {
    let server = MockServer::start().unwrap();
    let client = Client::connect_with_options(test_options(&server)).unwrap();
    let clone = client.clone();
    client.publish("dropped", "1").unwrap();
    drop(client);
    clone.publish("dropped", "2").unwrap();
    drop(clone);

    assert!(server.wait_until(Duration::from_secs(2), |s| s.payloads_for("dropped").len() == 2));
}

#[test]
fn test_statistics_and_health_after_traffic() {
    let server = MockServer::start().unwrap();
    let client = Client::connect_with_options(test_options(&server)).unwrap();

    for i in 0..10 {
        client.publish("stats", indexed_payload(i, 100)).unwrap();
    }
    client.flush().unwrap();

    let stats = client.statistics();
    assert_eq!(stats.out_msgs, 10);
    // frame bytes, protocol line included
    assert!(stats.out_bytes > 1000);
    assert_eq!(stats.connects, 1);
    assert_eq!(stats.reconnects, 0);
    assert!(stats.connected_since.is_some());
    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["out_msgs"], 10);

    let health = client.health();
    assert!(health.is_healthy);
    assert_eq!(health.reconnect_count, 0);
    assert!(health.uptime.is_some());
}
