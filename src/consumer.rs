// src/consumer.rs
//! Delivery loop shared by subscriptions, topic listeners and RPC responders.

use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;

use crate::broker::{ChannelHandle, ConsumeOptions, Consumer};
use crate::errors::Result;
use crate::events::EventEmitter;
use crate::message::Delivery;

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Drives `consumer` until it is cancelled or its channel goes away.
pub(crate) fn spawn_delivery_loop<F, Fut>(
    consumer: Consumer,
    events: EventEmitter,
    mut handle: F,
) -> JoinHandle<()>
where
    F: FnMut(Delivery) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let Consumer { tag, mut deliveries } = consumer;
    tokio::spawn(async move {
        while let Some(item) = deliveries.next().await {
            match item {
                Ok(delivery) => handle(delivery).await,
                Err(e) => {
                    events.error(format!("consumer {} failed: {}", tag, e));
                    break;
                }
            }
        }
        events.debug(format!("consumer {} stopped", tag));
    })
}

/// Parses a delivery for `callback`, then acks it. Undecodable bodies and
/// panicking callbacks are reported and rejected without requeue.
pub(crate) async fn deliver_json<T, F>(
    channel: &ChannelHandle,
    events: &EventEmitter,
    delivery: Delivery,
    callback: &F,
) where
    T: DeserializeOwned,
    F: Fn(T) + ?Sized,
{
    events.debug(format!("received message by {}", delivery.routing_key));
    let outcome = match delivery.json::<T>() {
        Ok(body) => catch_unwind(AssertUnwindSafe(|| callback(body)))
            .map_err(|panic| format!("callback panicked: {}", panic_message(panic.as_ref()))),
        Err(e) => Err(e.to_string()),
    };

    let settled = match outcome {
        Ok(()) => {
            events.debug("acking");
            channel.ack(delivery.delivery_tag).await
        }
        Err(reason) => {
            events.error(format!(
                "rejecting message from {} {}: {}",
                delivery.exchange, delivery.routing_key, reason
            ));
            channel.reject(delivery.delivery_tag, false).await
        }
    };
    if let Err(e) = settled {
        events.error(format!("Failed to settle message: {}", e));
    }
}

/// Starts consuming `queue` with explicit acks, handing parsed bodies to
/// `callback`. Returns the consumer tag.
pub(crate) async fn consume_json<T, F>(
    channel: &ChannelHandle,
    events: &EventEmitter,
    queue: &str,
    callback: F,
) -> Result<String>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    let consumer = channel.consume(queue, ConsumeOptions { no_ack: false }).await?;
    let tag = consumer.tag.clone();
    events.debug(format!("started consumer {}", tag));

    let callback = Arc::new(callback);
    let loop_channel = channel.clone();
    let loop_events = events.clone();
    spawn_delivery_loop(consumer, events.clone(), move |delivery| {
        let channel = loop_channel.clone();
        let events = loop_events.clone();
        let callback = callback.clone();
        async move { deliver_json::<T, F>(&channel, &events, delivery, callback.as_ref()).await }
    });
    Ok(tag)
}

/// Closes a channel, logging instead of failing if it is already gone.
pub(crate) async fn close_quietly(channel: &ChannelHandle, events: &EventEmitter, what: &str) {
    match channel.close().await {
        Ok(()) => events.debug(format!("closed channel {}", what)),
        Err(e) => events.debug(format!("channel {} already closed: {}", what, e)),
    }
}
