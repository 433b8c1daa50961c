//! Subscription, request/reply and wait-strategy tests

mod common;

use blocking_nats::testing::{MockServer, MockServerConfig};
use blocking_nats::{
    BlockingWait, Client, ClientError, FnWait, Message, TimeoutKind, WaitStrategy,
};
use common::test_options;
use parking_lot::Mutex;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT: Option<Duration> = Some(Duration::from_secs(2));

#[test]
fn test_subscribe_receives_matching_messages() {
    let server = MockServer::start().unwrap();
    let client = Client::connect_with_options(test_options(&server)).unwrap();
    let subscription = client.subscribe("sensors.*.temperature").unwrap();
    assert_eq!(subscription.subject(), "sensors.*.temperature");
    client.flush().unwrap();

    client.publish("sensors.kitchen.temperature", "21.5").unwrap();
    client.publish("sensors.kitchen.humidity", "40").unwrap();
    client.publish_with_reply("sensors.attic.temperature", "answers", "30.1").unwrap();
    client.flush().unwrap();

    let first = subscription.next_message(WAIT).unwrap();
    assert_eq!(first.subject, "sensors.kitchen.temperature");
    assert_eq!(&first.payload[..], b"21.5");
    assert_eq!(first.reply, None);
    assert_eq!(first.sid(), subscription.sid());

    let second = subscription.next_message(WAIT).unwrap();
    assert_eq!(second.subject, "sensors.attic.temperature");
    assert_eq!(second.reply.as_deref(), Some("answers"));

    assert!(subscription.try_next().unwrap().is_none());
    assert!(matches!(
        subscription.next_message(Some(Duration::from_millis(50))),
        Err(ClientError::TimedOut(TimeoutKind::NextMessage))
    ));
    assert_eq!(client.statistics().in_msgs, 2);
}

#[test]
fn test_server_injected_messages_and_headers() {
    let server = MockServer::start().unwrap();
    let client = Client::connect_with_options(test_options(&server)).unwrap();
    let subscription = client.subscribe("events.>").unwrap();
    client.flush().unwrap();

    assert_eq!(server.inject("events.user.created", "id=7"), 1);
    let message = subscription.next_message(WAIT).unwrap();
    assert_eq!(message.subject, "events.user.created");
    assert_eq!(&message.payload[..], b"id=7");
    assert!(message.headers.is_none());

    let mut headers = blocking_nats::HeaderMap::new();
    headers.insert("Nats-Msg-Id", "evt-1");
    client
        .publish_with_headers("events.user.deleted", &headers, "id=8")
        .unwrap();
    let message = subscription.next_message(WAIT).unwrap();
    assert_eq!(message.headers.unwrap().get("Nats-Msg-Id"), Some("evt-1"));
    assert_eq!(message.status, None);
}

#[test]
fn test_queue_group_delivers_each_message_once() {
    let server = MockServer::start().unwrap();
    let client = Client::connect_with_options(test_options(&server)).unwrap();
    let first = client.queue_subscribe("jobs", "workers").unwrap();
    let second = client.queue_subscribe("jobs", "workers").unwrap();
    assert_eq!(first.queue_group(), Some("workers"));
    assert!(matches!(
        client.queue_subscribe("jobs", "bad group"),
        Err(ClientError::InvalidSubject(_))
    ));
    client.flush().unwrap();

    for i in 0..20 {
        client.publish("jobs", format!("job-{i}")).unwrap();
    }
    client.flush().unwrap();

    assert!(server.wait_until(Duration::from_secs(2), |_| first.pending() + second.pending() == 20));
    let mut seen: Vec<String> = std::iter::from_fn(|| first.try_next().unwrap())
        .chain(std::iter::from_fn(|| second.try_next().unwrap()))
        .map(|m| String::from_utf8(m.payload.to_vec()).unwrap())
        .collect();
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 20);
    assert!(first.pending() == 0 && second.pending() == 0);
}

#[test]
fn test_handler_subscription_runs_callback() {
    let server = MockServer::start().unwrap();
    let client = Client::connect_with_options(test_options(&server)).unwrap();

    let received: Arc<Mutex<Vec<Message>>> = Arc::default();
    let sink = Arc::clone(&received);
    let subscription = client
        .subscribe_with_handler("callbacks", move |message| {
            sink.lock().push(message);
        })
        .unwrap();
    client.flush().unwrap();

    for i in 0..5 {
        client.publish("callbacks", format!("{i}")).unwrap();
    }
    client.flush().unwrap();

    assert!(server.wait_until(Duration::from_secs(2), |_| received.lock().len() == 5));
    let payloads: Vec<_> = received.lock().iter().map(|m| m.payload.clone()).collect();
    assert_eq!(payloads, vec!["0", "1", "2", "3", "4"]);

    assert!(matches!(
        subscription.next_message(WAIT),
        Err(ClientError::HandlerSubscription)
    ));
    assert!(subscription.raw_fd().is_err());
}

#[test]
fn test_panicking_handler_does_not_stop_delivery() {
    let server = MockServer::start().unwrap();
    let client = Client::connect_with_options(test_options(&server)).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    client
        .subscribe_with_handler("fragile", move |message| {
            counter.fetch_add(1, Ordering::SeqCst);
            if &message.payload[..] == b"boom" {
                panic!("handler failure");
            }
        })
        .unwrap();
    let healthy = client.subscribe("fragile").unwrap();

    client.publish("fragile", "boom").unwrap();
    client.publish("fragile", "fine").unwrap();
    client.flush().unwrap();

    assert!(server.wait_until(Duration::from_secs(2), |_| calls.load(Ordering::SeqCst) == 2));
    assert_eq!(&healthy.next_message(WAIT).unwrap().payload[..], b"boom");
    assert_eq!(&healthy.next_message(WAIT).unwrap().payload[..], b"fine");
    assert!(!client.is_closed());
}

#[test]
fn test_unsubscribe_stops_delivery() {
    let server = MockServer::start().unwrap();
    let client = Client::connect_with_options(test_options(&server)).unwrap();
    let subscription = client.subscribe("ticker").unwrap();
    client.publish("ticker", "before").unwrap();
    client.flush().unwrap();
    assert!(server.wait_until(Duration::from_secs(2), |_| subscription.pending() == 1));

    client.unsubscribe(&subscription).unwrap();
    client.publish("ticker", "after").unwrap();
    client.flush().unwrap();
    assert!(server.wait_until(Duration::from_secs(2), |s| s.subscription_count() == 0));

    // queued messages stay readable, then the subscription is over
    assert_eq!(&subscription.next_message(WAIT).unwrap().payload[..], b"before");
    assert!(matches!(subscription.next_message(WAIT), Err(ClientError::Closed)));

    // unknown subscriptions are a no-op
    client.unsubscribe(&subscription).unwrap();
}

#[test]
fn test_unsubscribe_after_limits_deliveries() {
    let server = MockServer::start().unwrap();
    let client = Client::connect_with_options(test_options(&server)).unwrap();
    let subscription = client.subscribe("limited").unwrap();
    client.unsubscribe_after(&subscription, 3).unwrap();

    for i in 0..5 {
        client.publish("limited", format!("{i}")).unwrap();
    }
    client.flush().unwrap();

    let payloads: Vec<_> = (&subscription).map(|m| m.payload).collect();
    assert_eq!(payloads, vec!["0", "1", "2"]);
    assert!(server.wait_until(Duration::from_secs(2), |s| s.subscription_count() == 0));

    // a limit already reached removes the subscription at once
    let other = client.subscribe("limited").unwrap();
    client.publish("limited", "x").unwrap();
    client.flush().unwrap();
    assert!(server.wait_until(Duration::from_secs(2), |_| other.pending() == 1));
    client.unsubscribe_after(&other, 1).unwrap();
    assert_eq!(&other.next_message(WAIT).unwrap().payload[..], b"x");
    assert!(matches!(other.next_message(WAIT), Err(ClientError::Closed)));
}

#[test]
fn test_drain_keeps_delivered_messages_readable() {
    let server = MockServer::start().unwrap();
    let client = Client::connect_with_options(test_options(&server)).unwrap();
    let subscription = client.subscribe("drain.me").unwrap();

    for i in 0..3 {
        client.publish("drain.me", format!("{i}")).unwrap();
    }
    client.drain(&subscription).unwrap();

    client.publish("drain.me", "late").unwrap();
    client.flush().unwrap();

    let payloads: Vec<_> = (&subscription).map(|m| m.payload).collect();
    assert_eq!(payloads, vec!["0", "1", "2"]);
    assert_eq!(server.subscription_count(), 0);
}

#[test]
fn test_request_reply_round_trip() {
    let server = MockServer::start().unwrap();
    let client = Client::connect_with_options(test_options(&server)).unwrap();

    let responder = client.clone();
    client
        .subscribe_with_handler("svc.echo", move |request| {
            if let Some(reply) = request.reply {
                let mut answer = b"echo: ".to_vec();
                answer.extend_from_slice(&request.payload);
                let _ = responder.publish(&reply, answer);
            }
        })
        .unwrap();
    client.flush().unwrap();

    let response = client
        .request("svc.echo", "hello", Duration::from_secs(2))
        .unwrap();
    assert_eq!(&response.payload[..], b"echo: hello");
    assert!(response.subject.starts_with("_INBOX."));

    // the handler holds a client clone; close breaks the cycle
    client.close();
}

#[test]
fn test_request_without_responders_fails_fast() {
    let server = MockServer::start().unwrap();
    let client = Client::connect_with_options(test_options(&server)).unwrap();

    let started = Instant::now();
    let error = client
        .request("nobody.home", "anyone?", Duration::from_secs(5))
        .unwrap_err();
    assert!(matches!(error, ClientError::NoResponders));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_request_times_out_without_reply() {
    let server = MockServer::start_with(MockServerConfig::default().without_headers()).unwrap();
    let client = Client::connect_with_options(test_options(&server)).unwrap();

    let error = client
        .request("silent.service", "ping", Duration::from_millis(150))
        .unwrap_err();
    assert!(matches!(error, ClientError::TimedOut(TimeoutKind::Request)));
    client.flush().unwrap();
    assert!(server.wait_until(Duration::from_secs(2), |s| s.subscription_count() == 0));
}

#[test]
fn test_new_inbox_uses_configured_prefix() {
    let server = MockServer::start().unwrap();
    let client =
        Client::connect_with_options(test_options(&server).with_inbox_prefix("_INBOX.app")).unwrap();
    let first = client.new_inbox();
    let second = client.new_inbox();
    assert!(first.starts_with("_INBOX.app."));
    assert_ne!(first, second);
}

#[test]
fn test_subscription_descriptor_signals_arrivals() {
    let server = MockServer::start().unwrap();
    let client = Client::connect_with_options(test_options(&server)).unwrap();
    let subscription = client.subscribe("fd.watch").unwrap();
    client.flush().unwrap();

    let fd = subscription.raw_fd().unwrap();
    client.publish("fd.watch", "ping").unwrap();
    let outcome = BlockingWait.wait_readable(fd, WAIT).unwrap();
    assert_eq!(outcome, blocking_nats::WaitOutcome::Ready);
    assert_eq!(&subscription.try_next().unwrap().unwrap().payload[..], b"ping");
}

#[test]
fn test_custom_wait_strategy_is_used() {
    let server = MockServer::start().unwrap();
    let waits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&waits);
    let strategy = FnWait::new(move |fd: RawFd, timeout: Option<Duration>| {
        counter.fetch_add(1, Ordering::SeqCst);
        BlockingWait.wait_readable(fd, timeout)
    });

    let client = Client::connect_with_wait(test_options(&server), Arc::new(strategy)).unwrap();
    let after_connect = waits.load(Ordering::SeqCst);
    assert!(after_connect >= 1, "connect did not wait through the strategy");

    let subscription = client.subscribe("cooperative").unwrap();
    client.publish("cooperative", "x").unwrap();
    client.flush().unwrap();
    subscription.next_message(WAIT).unwrap();
    assert!(waits.load(Ordering::SeqCst) > after_connect);
}
