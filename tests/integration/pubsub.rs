use std::time::Duration;

use rabbit_bus::broker::ExchangeKind;
use rabbit_bus::{BusError, BusEvent, MemoryBroker, PublishRequest, SubscriptionRequest};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::common::{eventually, memory_bus, started_bus, wait_for_event, WAIT};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderCreated {
    order_id: String,
    items: Vec<String>,
    total: f64,
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("no message within timeout")
        .expect("callback dropped")
}

#[tokio::test]
async fn topic_publish_reaches_matching_subscriber() {
    let broker = MemoryBroker::new();
    let bus = started_bus(&broker).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let subscription = bus
        .subscribe(
            &SubscriptionRequest::topic("orders", "orders.*").unwrap(),
            move |order: OrderCreated| {
                let _ = tx.send(order);
            },
        )
        .await
        .unwrap();

    let order = OrderCreated {
        order_id: "A-100".to_string(),
        items: vec!["book".to_string(), "pen".to_string()],
        total: 12.5,
    };
    bus.publish(&json!({ "ignored": true }), &PublishRequest::topic("orders", "invoices.created").unwrap())
        .await
        .unwrap();
    bus.publish(&order, &PublishRequest::topic("orders", "orders.created").unwrap())
        .await
        .unwrap();

    assert_eq!(recv(&mut rx).await, order);
    assert_eq!(broker.exchange_kind("orders"), Some(ExchangeKind::Topic));
    eventually("ack of the delivery", || broker.ack_count(subscription.queue()) == 1).await;

    bus.unsubscribe(&subscription).await;
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn distinct_nodes_each_get_every_message() {
    let broker = MemoryBroker::new();
    let bus = started_bus(&broker).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut subscriptions = Vec::new();
    for node in ["node-a", "node-b", "node-c"] {
        let tx = tx.clone();
        let request = SubscriptionRequest::message_type("invoice.paid")
            .unwrap()
            .with_consumer_node_id(node);
        let subscription = bus
            .subscribe(&request, move |body: Value| {
                let _ = tx.send((node, body["n"].as_u64().unwrap_or_default()));
            })
            .await
            .unwrap();
        subscriptions.push(subscription);
    }

    let request = PublishRequest::message_type("invoice.paid").unwrap();
    for n in 1..=2 {
        bus.publish(&json!({ "n": n }), &request).await.unwrap();
    }

    let mut received = Vec::new();
    for _ in 0..6 {
        received.push(recv(&mut rx).await);
    }
    received.sort();
    assert_eq!(
        received,
        vec![
            ("node-a", 1),
            ("node-a", 2),
            ("node-b", 1),
            ("node-b", 2),
            ("node-c", 1),
            ("node-c", 2),
        ]
    );
    assert_eq!(
        broker.exchange_kind("node_invoice_paid_consumer"),
        Some(ExchangeKind::Fanout)
    );
    assert!(broker.queue_exists("node_invoice_paid_consumer_queue_node-b"));
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn round_robin_subscribers_share_the_work() {
    let broker = MemoryBroker::new();
    let bus = started_bus(&broker).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    for worker in 0..2 {
        let tx = tx.clone();
        let request = SubscriptionRequest::message_type("resize-image").unwrap().round_robin();
        bus.subscribe(&request, move |job: u32| {
            let _ = tx.send((worker, job));
        })
        .await
        .unwrap();
    }

    let request = PublishRequest::message_type("resize-image").unwrap();
    for job in 0..6u32 {
        bus.publish(&job, &request).await.unwrap();
    }

    let mut jobs = Vec::new();
    let mut per_worker = [0; 2];
    for _ in 0..6 {
        let (worker, job) = recv(&mut rx).await;
        per_worker[worker] += 1;
        jobs.push(job);
    }
    jobs.sort();
    assert_eq!(jobs, vec![0, 1, 2, 3, 4, 5]);
    assert!(per_worker.iter().all(|count| *count > 0), "{:?}", per_worker);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err(), "a job was delivered twice");
    assert_eq!(broker.consumer_count("node_resize-image_consumer_queue"), 2);
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn round_robin_queue_retains_messages_without_consumers() {
    let broker = MemoryBroker::new();
    let bus = started_bus(&broker).await;
    let request = SubscriptionRequest::message_type("audit").unwrap().round_robin();
    let subscription = bus.subscribe(&request, |_: Value| {}).await.unwrap();
    bus.unsubscribe(&subscription).await;

    bus.publish(&json!({ "who": "admin" }), &PublishRequest::message_type("audit").unwrap())
        .await
        .unwrap();

    assert_eq!(broker.message_count("node_audit_consumer_queue"), 1);
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn unsubscribe_twice_still_closes() {
    let broker = MemoryBroker::new();
    let bus = started_bus(&broker).await;
    let subscription = bus
        .subscribe(
            &SubscriptionRequest::topic("metrics", "cpu.#").unwrap(),
            |_: Value| {},
        )
        .await
        .unwrap();
    assert_eq!(broker.open_channel_count(), 2);

    bus.unsubscribe(&subscription).await;
    bus.unsubscribe(&subscription).await;

    assert!(!subscription.channel().is_open());
    assert_eq!(broker.open_channel_count(), 1);
    // Anonymous topic queues go with their consumer.
    assert!(!broker.queue_exists(subscription.queue()));
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn publishing_requires_a_started_bus() {
    let bus = memory_bus(&MemoryBroker::new());
    let err = bus
        .publish(&json!({}), &PublishRequest::message_type("anything").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::NotStarted("publish")));
}

#[tokio::test]
async fn exchange_type_conflict_fails_only_that_publish() {
    let broker = MemoryBroker::new();
    let bus = started_bus(&broker).await;
    bus.publish(&json!({ "n": 1 }), &PublishRequest::message_type("orders").unwrap())
        .await
        .unwrap();

    let err = bus
        .publish(&json!({ "n": 2 }), &PublishRequest::topic("orders", "orders.created").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::TopologyError { ref resource, .. } if resource == "orders"));

    bus.publish(&json!({ "n": 3 }), &PublishRequest::message_type("orders").unwrap())
        .await
        .unwrap();
    assert_eq!(broker.published().len(), 2);
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn failed_subscribe_leaves_no_consumer_behind() {
    let broker = MemoryBroker::new();
    let bus = started_bus(&broker).await;
    bus.publish(&json!({}), &PublishRequest::message_type("shipments").unwrap())
        .await
        .unwrap();

    let result = bus
        .subscribe(
            &SubscriptionRequest::topic("shipments", "shipments.sent").unwrap(),
            |_: Value| {},
        )
        .await;

    assert!(matches!(result, Err(BusError::TopologyError { .. })));
    assert_eq!(broker.open_channel_count(), 1);
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn messages_carry_json_metadata() {
    let broker = MemoryBroker::new();
    let bus = started_bus(&broker).await;
    bus.publish(&json!({ "a": 1 }), &PublishRequest::message_type("meta").unwrap())
        .await
        .unwrap();

    let published = broker.published();
    let properties = &published[0].properties;
    assert_eq!(published[0].exchange, "meta");
    assert_eq!(published[0].routing_key, "");
    assert_eq!(properties.content_type.as_deref(), Some("application/json"));
    assert!(properties.message_id.is_some());
    assert!(properties.timestamp.is_some());
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn panicking_callback_rejects_and_keeps_consuming() {
    let broker = MemoryBroker::new();
    let bus = started_bus(&broker).await;
    let mut events = bus.events();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let subscription = bus
        .subscribe(
            &SubscriptionRequest::topic("jobs", "jobs.run").unwrap(),
            move |n: i64| {
                if n < 0 {
                    panic!("negative job {}", n);
                }
                let _ = tx.send(n);
            },
        )
        .await
        .unwrap();

    let request = PublishRequest::topic("jobs", "jobs.run").unwrap();
    bus.publish(&-1, &request).await.unwrap();
    bus.publish(&"not a number", &request).await.unwrap();
    bus.publish(&7, &request).await.unwrap();

    assert_eq!(recv(&mut rx).await, 7);
    let event = wait_for_event(&mut events, |e| {
        matches!(e, BusEvent::Error(message) if message.contains("negative job -1"))
    })
    .await;
    assert!(matches!(event, BusEvent::Error(_)));
    eventually("only the good job acked", || {
        broker.ack_count(subscription.queue()) == 1 && broker.unacked_count(subscription.queue()) == 0
    })
    .await;
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn publish_waits_out_flow_control() {
    let broker = MemoryBroker::new();
    let bus = started_bus(&broker).await;
    broker.pause_flow();

    let publishing = tokio::spawn({
        let bus = bus.clone();
        async move {
            bus.publish(&json!({ "big": true }), &PublishRequest::message_type("bulk").unwrap())
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!publishing.is_finished());
    assert!(broker.published().is_empty());

    broker.resume_flow();
    publishing.await.unwrap().unwrap();
    assert_eq!(broker.published().len(), 1);
    bus.stop().await.unwrap();
}
