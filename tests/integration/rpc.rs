use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use futures::StreamExt;
use rabbit_bus::broker::{ConsumeOptions, ExchangeKind};
use rabbit_bus::topology::{DURABLE_EXCHANGE, DURABLE_QUEUE};
use rabbit_bus::{BusError, BusEvent, CallOptions, MemoryBroker, MessageProperties, PublishRequest};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::common::{eventually, memory_bus, started_bus, wait_for_event};

#[derive(Debug, Serialize, Deserialize)]
struct Query {
    query: String,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Answer {
    result: String,
}

#[tokio::test]
async fn ping_pong_round_trip() {
    let broker = MemoryBroker::new();
    let bus = started_bus(&broker).await;
    bus.bind("ping-t", |q: Query| async move {
        Ok::<_, anyhow::Error>(Answer {
            result: q.query.replace("ping", "pong"),
        })
    })
    .await
    .unwrap();

    let answer: Answer = bus
        .call(&Query { query: "ping".to_string() }, &CallOptions::new("ping-t").unwrap())
        .await
        .unwrap();

    assert_eq!(answer, Answer { result: "pong".to_string() });
    // Publish channel and responder channel remain; the reply channel is gone.
    assert_eq!(broker.open_channel_count(), 2);
    assert!(broker.queue_names().iter().all(|q| !q.starts_with("bus-test-node-1-")));
    eventually("request acked", || broker.ack_count("ping-t_handler queue") == 1).await;
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn call_times_out_without_responder() {
    let broker = MemoryBroker::new();
    let bus = started_bus(&broker).await;
    let options = CallOptions::new("unbound-type")
        .unwrap()
        .with_timeout(Duration::from_millis(50));

    let started = Instant::now();
    let err = bus.call::<_, Value>(&json!({ "query": "ping" }), &options).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.is_timeout());
    let text = err.to_string();
    assert!(text.contains("unbound-type"), "{}", text);
    assert!(text.contains("50"), "{}", text);
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_secs(1));
    assert_eq!(broker.open_channel_count(), 1);
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn handler_failure_is_sent_back_and_acked_once() {
    let broker = MemoryBroker::new();
    let bus = started_bus(&broker).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    bus.bind("fail-t", move |_: Value| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Err::<Value, _>(anyhow!("boom")) }
    })
    .await
    .unwrap();

    let reply: Value = bus
        .call(&json!({ "query": "ping" }), &CallOptions::new("fail-t").unwrap())
        .await
        .unwrap();

    assert_eq!(reply, json!({ "error": "boom" }));
    eventually("request acked", || broker.ack_count("fail-t_handler queue") == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(broker.ack_count("fail-t_handler queue"), 1);
    assert_eq!(broker.unacked_count("fail-t_handler queue"), 0);
    assert_eq!(broker.message_count("fail-t_handler queue"), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn typed_call_surfaces_the_handler_failure() {
    let broker = MemoryBroker::new();
    let bus = started_bus(&broker).await;
    bus.bind_sync("lookup-t", |_: Query| Err::<Answer, _>(anyhow!("record 7 not found")))
        .await
        .unwrap();

    let err = bus
        .call::<_, Answer>(&Query { query: "7".to_string() }, &CallOptions::new("lookup-t").unwrap())
        .await
        .unwrap_err();

    assert!(err.is_handler_error());
    assert!(err.to_string().contains("record 7 not found"), "{}", err);
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn late_reply_leaves_no_reply_exchange_behind() {
    let broker = MemoryBroker::new();
    let bus = started_bus(&broker).await;
    bus.bind("slow-t", |q: Query| async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok::<_, anyhow::Error>(Answer { result: q.query })
    })
    .await
    .unwrap();
    let options = CallOptions::new("slow-t")
        .unwrap()
        .with_timeout(Duration::from_millis(30));

    let err = bus
        .call::<_, Answer>(&Query { query: "ping".to_string() }, &options)
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    let reply_to = broker
        .published()
        .into_iter()
        .find(|m| m.exchange == "slow-t")
        .and_then(|m| m.properties.reply_to)
        .unwrap();
    assert_eq!(broker.exchange_kind(&reply_to), None);

    eventually("late request acked", || broker.ack_count("slow-t_handler queue") == 1).await;
    assert!(broker
        .published()
        .iter()
        .any(|m| m.exchange.is_empty() && m.routing_key == reply_to));
    assert_eq!(broker.exchange_kind(&reply_to), None);
    assert!(!broker.queue_exists(&reply_to));
    // The shared publish channel survived the undeliverable reply.
    assert_eq!(broker.open_channel_count(), 2);
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn sync_handlers_and_panics() {
    let broker = MemoryBroker::new();
    let bus = started_bus(&broker).await;
    bus.bind_sync("divide", |(a, b): (i64, i64)| {
        if b == 0 {
            panic!("attempt to divide by zero");
        }
        Ok(a / b)
    })
    .await
    .unwrap();
    let options = CallOptions::new("divide").unwrap();

    let quotient: i64 = bus.call(&(84, 2), &options).await.unwrap();
    assert_eq!(quotient, 42);

    let reply: Value = bus.call(&(1, 0), &options).await.unwrap();
    assert_eq!(reply, json!({ "error": "attempt to divide by zero" }));

    let reply: Value = bus.call(&"not a pair", &options).await.unwrap();
    assert!(reply["error"].is_string());

    eventually("all requests acked", || broker.ack_count("divide_handler queue") == 3).await;
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn only_the_matching_correlation_id_is_accepted() {
    let broker = MemoryBroker::new();
    let bus = started_bus(&broker).await;

    // Hand-rolled responder: answers once with a stray correlation id, then with an empty body.
    let channel = bus.get_consumer_channel().await.unwrap();
    channel
        .assert_exchange("raw-t", ExchangeKind::Fanout, DURABLE_EXCHANGE)
        .await
        .unwrap();
    channel.assert_queue("raw-t-q", DURABLE_QUEUE).await.unwrap();
    channel.bind_queue("raw-t-q", "raw-t", "").await.unwrap();
    let mut consumer = channel
        .consume("raw-t-q", ConsumeOptions { no_ack: true })
        .await
        .unwrap();
    let responder = tokio::spawn({
        let bus = bus.clone();
        async move {
            let request = consumer.deliveries.next().await.unwrap().unwrap();
            let reply_to = request.reply_to().unwrap().to_string();
            let publish = bus.get_publish_channel().await.unwrap();
            publish
                .publish(
                    &reply_to,
                    "",
                    b"{\"stray\":true}".to_vec(),
                    MessageProperties::json().with_correlation_id("someone-else"),
                )
                .await
                .unwrap();
            let correlation_id = request.correlation_id().unwrap().to_string();
            publish
                .publish(
                    &reply_to,
                    "",
                    Vec::new(),
                    MessageProperties::json().with_correlation_id(correlation_id),
                )
                .await
                .unwrap();
        }
    });

    let reply: Option<Answer> = bus
        .call(&json!({ "query": "ping" }), &CallOptions::new("raw-t").unwrap())
        .await
        .unwrap();
    assert!(reply.is_none());
    responder.await.unwrap();

    let request = broker
        .published()
        .into_iter()
        .find(|m| m.exchange == "raw-t")
        .unwrap();
    assert!(request.properties.correlation_id.is_some());
    assert!(request
        .properties
        .reply_to
        .as_deref()
        .unwrap()
        .starts_with("bus-test-node-1-raw-t-"));
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn request_without_reply_to_is_still_acked() {
    let broker = MemoryBroker::new();
    let bus = started_bus(&broker).await;
    let mut events = bus.events();
    bus.bind_sync("notify", |_: Value| Ok(json!({ "ok": true })))
        .await
        .unwrap();

    bus.publish(&json!({ "fire": "and forget" }), &PublishRequest::message_type("notify").unwrap())
        .await
        .unwrap();

    wait_for_event(&mut events, |e| {
        matches!(e, BusEvent::Error(m) if m.contains("without replyTo"))
    })
    .await;
    eventually("request acked", || broker.ack_count("notify_handler queue") == 1).await;
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn rpc_requires_a_started_bus() {
    let bus = memory_bus(&MemoryBroker::new());
    let err = bus
        .call::<_, Value>(&json!({}), &CallOptions::new("ping-t").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::NotStarted("consumer")));

    let err = bus.bind_sync("", |_: Value| Ok(Value::Null)).await.unwrap_err();
    assert!(matches!(err, BusError::MissingField("messageType")));
}

#[tokio::test]
async fn unbinding_leaves_the_handler_queue() {
    let broker = MemoryBroker::new();
    let bus = started_bus(&broker).await;
    let binding = bus.bind_sync("report", |_: Value| Ok(Value::Null)).await.unwrap();
    assert_eq!(broker.consumer_count(binding.queue()), 1);

    bus.unbind(&binding).await;
    bus.unbind(&binding).await;

    assert_eq!(broker.consumer_count("report_handler queue"), 0);
    assert!(broker.queue_options("report_handler queue").unwrap().durable);
    bus.stop().await.unwrap();
}
