// Connection lifecycle and publish-worker behaviour against an in-memory broker.

mod support;

use std::time::Duration;

use http2amqp::rabbitmq::{ConnectionState, ReconnectPolicy, QUERY_STRING_HEADER};
use http2amqp::{Outcome, PublishRequest, Relay, RelaySettings};
use support::{fast_settings, wait_for_epoch, wait_until, FakeBroker, TEST_URI};

fn request(queue: &str, body: &str) -> PublishRequest {
    PublishRequest::new(queue, body, "")
}

#[tokio::test]
async fn publishes_with_fixed_delivery_attributes() {
    let broker = FakeBroker::with_queues(&["orders"]);
    let relay = Relay::spawn(broker.clone(), TEST_URI, fast_settings());

    let outcome = relay
        .front_end()
        .submit(PublishRequest::new("orders", "hello", "a=1"))
        .await;

    assert_eq!(outcome, Outcome::Ok);
    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].queue, "orders");
    assert_eq!(published[0].payload, "hello");
    assert_eq!(published[0].attributes.query_string, "a=1");
    assert_eq!(published[0].attributes.content_type, "text/plain");
    assert_eq!(published[0].attributes.delivery_mode, 2);
    assert_eq!(published[0].attributes.priority, 9);
    assert_eq!(QUERY_STRING_HEADER, "query_string");
    assert_eq!(broker.dials(), 1);
}

#[tokio::test]
async fn short_destinations_are_skipped_without_broker_calls() {
    let broker = FakeBroker::with_queues(&["q"]);
    let relay = Relay::spawn(broker.clone(), TEST_URI, fast_settings());
    let front_end = relay.front_end();

    assert_eq!(front_end.submit(request("", "body")).await, Outcome::Skip);
    assert_eq!(front_end.submit(request("q", "body")).await, Outcome::Skip);

    assert!(broker.inspections().is_empty());
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn validated_destination_is_inspected_once() {
    let broker = FakeBroker::with_queues(&["orders"]);
    let relay = Relay::spawn(broker.clone(), TEST_URI, fast_settings());
    let front_end = relay.front_end();

    for i in 0..3 {
        let outcome = front_end.submit(request("orders", &format!("m{}", i))).await;
        assert_eq!(outcome, Outcome::Ok);
    }

    assert_eq!(broker.inspections_of("orders"), 1);
    assert_eq!(broker.published().len(), 3);
    assert!(relay.cache().is_validated("orders"));
}

#[tokio::test]
async fn unknown_queue_is_rejected_and_the_connection_kept() {
    let broker = FakeBroker::with_queues(&["orders"]);
    let relay = Relay::spawn(broker.clone(), TEST_URI, fast_settings());
    let front_end = relay.front_end();

    assert_eq!(front_end.submit(request("missing", "x")).await, Outcome::BadQueueName);
    assert!(!relay.cache().is_validated("missing"));

    // next caller is served on the same connection, on a fresh channel
    assert_eq!(front_end.submit(request("orders", "y")).await, Outcome::Ok);
    assert_eq!(broker.dials(), 1);
    assert_eq!(broker.channels_opened(), 2);

    // an unknown queue is checked again every time
    assert_eq!(front_end.submit(request("missing", "z")).await, Outcome::BadQueueName);
    assert_eq!(broker.inspections_of("missing"), 2);
}

#[tokio::test]
async fn publish_failure_reports_network_error_and_reconnects() {
    let broker = FakeBroker::with_queues(&["orders"]);
    broker.fail_next_publishes(1);
    let relay = Relay::spawn(broker.clone(), TEST_URI, fast_settings());
    let front_end = relay.front_end();
    let mut state = relay.state();

    assert_eq!(front_end.submit(request("orders", "lost")).await, Outcome::NetworkError);

    wait_for_epoch(&mut state, 2).await;
    assert_eq!(front_end.submit(request("orders", "kept")).await, Outcome::Ok);

    assert_eq!(broker.dials(), 2);
    // the failed message is not retried
    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].payload, "kept");
    assert_eq!(published[0].connection, 2);
    // validation survives the reconnect
    assert_eq!(broker.inspections_of("orders"), 1);
}

#[tokio::test]
async fn cache_can_be_cleared_on_reconnect() {
    let broker = FakeBroker::with_queues(&["orders"]);
    let settings = RelaySettings {
        invalidate_cache_on_reconnect: true,
        ..fast_settings()
    };
    let relay = Relay::spawn(broker.clone(), TEST_URI, settings);
    let front_end = relay.front_end();
    let mut state = relay.state();

    assert_eq!(front_end.submit(request("orders", "a")).await, Outcome::Ok);
    broker.drop_connections("CONNECTION_FORCED");
    wait_for_epoch(&mut state, 2).await;
    assert!(relay.cache().is_empty());

    assert_eq!(front_end.submit(request("orders", "b")).await, Outcome::Ok);
    assert_eq!(broker.inspections_of("orders"), 2);
}

#[tokio::test]
async fn broker_initiated_close_is_detected_without_traffic() {
    let broker = FakeBroker::with_queues(&["orders"]);
    let relay = Relay::spawn(broker.clone(), TEST_URI, fast_settings());
    let mut state = relay.state();

    wait_for_epoch(&mut state, 1).await;
    broker.drop_connections("CONNECTION_FORCED - broker forced connection closure");
    wait_for_epoch(&mut state, 2).await;

    assert_eq!(broker.dials(), 2);
    assert_eq!(
        relay.front_end().submit(request("orders", "after")).await,
        Outcome::Ok
    );
    assert_eq!(broker.published()[0].connection, 2);
}

#[tokio::test]
async fn dial_failures_are_retried_until_the_broker_is_back() {
    let broker = FakeBroker::with_queues(&["orders"]);
    broker.fail_next_dials(3);
    let relay = Relay::spawn(broker.clone(), TEST_URI, fast_settings());
    let mut state = relay.state();

    wait_for_epoch(&mut state, 1).await;

    assert_eq!(broker.dials(), 4);
    assert_eq!(
        relay.front_end().submit(request("orders", "late")).await,
        Outcome::Ok
    );
}

#[tokio::test]
async fn callers_time_out_while_the_broker_is_unreachable() {
    let broker = FakeBroker::with_queues(&["orders"]);
    broker.fail_next_dials(u32::MAX);
    let settings = RelaySettings {
        handoff_timeout: Duration::from_millis(50),
        response_timeout: Duration::from_millis(50),
        reconnect: ReconnectPolicy::fixed(Duration::from_millis(10)),
        invalidate_cache_on_reconnect: false,
    };
    let relay = Relay::spawn(broker.clone(), TEST_URI, settings);
    let front_end = relay.front_end();

    // nobody takes requests while connecting
    assert_eq!(front_end.submit(request("orders", "1")).await, Outcome::NetworkSendTimeout);
    assert_eq!(front_end.submit(request("orders", "2")).await, Outcome::NetworkSendTimeout);

    wait_until(|| broker.dials() > 3).await;
    assert!(broker.published().is_empty());
    assert_ne!(*relay.state().borrow(), ConnectionState::Connected { epoch: 1 });
}

#[tokio::test]
async fn abandoned_request_is_not_published_after_reconnect() {
    let broker = FakeBroker::with_queues(&["orders"]);
    broker.fail_next_dials(20);
    let settings = RelaySettings {
        handoff_timeout: Duration::from_millis(50),
        response_timeout: Duration::from_millis(50),
        ..fast_settings()
    };
    let relay = Relay::spawn(broker.clone(), TEST_URI, settings);
    let front_end = relay.front_end();
    let mut state = relay.state();

    assert_eq!(front_end.submit(request("orders", "stale")).await, Outcome::NetworkSendTimeout);

    wait_for_epoch(&mut state, 1).await;
    assert_eq!(front_end.submit(request("orders", "fresh")).await, Outcome::Ok);

    let payloads: Vec<_> = broker.published().into_iter().map(|p| p.payload).collect();
    assert_eq!(payloads, vec!["fresh"]);
}

#[tokio::test]
async fn nacked_publish_reports_network_error_and_reconnects() {
    let broker = FakeBroker::with_queues(&["orders"]);
    broker.nack_next_publishes(1);
    let relay = Relay::spawn(broker.clone(), TEST_URI, fast_settings());
    let front_end = relay.front_end();
    let mut state = relay.state();

    assert_eq!(front_end.submit(request("orders", "refused")).await, Outcome::NetworkError);

    wait_for_epoch(&mut state, 2).await;
    assert_eq!(broker.dials(), 2);
    assert_eq!(front_end.submit(request("orders", "accepted")).await, Outcome::Ok);
    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].payload, "accepted");
}

#[tokio::test]
async fn shutdown_closes_the_connection() {
    let broker = FakeBroker::with_queues(&["orders"]);
    let relay = Relay::spawn(broker.clone(), TEST_URI, fast_settings());
    let mut state = relay.state();
    wait_for_epoch(&mut state, 1).await;

    relay.shutdown(Duration::from_secs(1)).await;

    assert_eq!(*state.borrow(), ConnectionState::Disconnected);
    assert_eq!(broker.dials(), 1);
}
