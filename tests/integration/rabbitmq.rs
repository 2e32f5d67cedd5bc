// Round-trips against a real broker. Run with:
//   BUS_HOST=localhost cargo test -- --ignored
use rabbit_bus::{Bus, BusConfig, CallOptions, PublishRequest, SubscriptionRequest};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::common::{init_tracing, WAIT};

async fn live_bus() -> Bus {
    init_tracing();
    let config = BusConfig::from_env().expect("BUS_HOST must be set for RabbitMQ tests");
    let bus = Bus::new(config).expect("valid config");
    bus.start();
    tokio::time::timeout(WAIT, bus.wait_until_connected())
        .await
        .expect("RabbitMQ not reachable")
        .unwrap();
    bus
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn rabbitmq_topic_round_trip() {
    let bus = live_bus().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = bus
        .subscribe(
            &SubscriptionRequest::topic("rabbit_bus.test", "it.topic").unwrap(),
            move |body: Value| {
                let _ = tx.send(body);
            },
        )
        .await
        .unwrap();

    bus.publish(&json!({ "n": 1 }), &PublishRequest::topic("rabbit_bus.test", "it.topic").unwrap())
        .await
        .unwrap();
    let body = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(body, json!({ "n": 1 }));

    bus.unsubscribe(&subscription).await;
    assert!(bus.stop().await.unwrap());
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn rabbitmq_rpc_round_trip() {
    let bus = live_bus().await;
    let binding = bus
        .bind_sync("rabbit_bus.it.ping", |_: Value| Ok(json!({ "result": "pong" })))
        .await
        .unwrap();

    let reply: Value = bus
        .call(&json!({ "query": "ping" }), &CallOptions::new("rabbit_bus.it.ping").unwrap())
        .await
        .unwrap();
    assert_eq!(reply, json!({ "result": "pong" }));

    bus.unbind(&binding).await;
    assert!(bus.stop().await.unwrap());
}
