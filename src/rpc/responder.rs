// src/rpc/responder.rs
use std::fmt::{self, Display};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};

use crate::broker::{ChannelHandle, ConsumeOptions, ExchangeKind};
use crate::bus::Bus;
use crate::consumer::{close_quietly, panic_message, spawn_delivery_loop};
use crate::errors::{BusError, Result};
use crate::message::{encode, Delivery, MessageProperties};
use crate::topology::{self, DURABLE_EXCHANGE, DURABLE_QUEUE};

/// A handler bound to a message type. Ended with [`Bus::unbind`].
pub struct RpcBinding {
    message_type: String,
    queue: String,
    consumer_tag: String,
    channel: ChannelHandle,
}

impl RpcBinding {
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }
}

impl fmt::Debug for RpcBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcBinding")
            .field("message_type", &self.message_type)
            .field("queue", &self.queue)
            .field("consumer_tag", &self.consumer_tag)
            .finish_non_exhaustive()
    }
}

fn error_reply(cause: impl Display) -> Value {
    json!({ "error": cause.to_string() })
}

/// Runs the handler for one request and turns every outcome into a reply body.
async fn handle_request<Req, Resp, H, Fut>(handler: &H, delivery: &Delivery) -> (Value, Option<String>)
where
    Req: DeserializeOwned,
    Resp: Serialize,
    H: Fn(Req) -> Fut,
    Fut: Future<Output = anyhow::Result<Resp>>,
{
    let request = match delivery.json::<Req>() {
        Ok(request) => request,
        Err(e) => return (error_reply(&e), Some(e.to_string())),
    };
    match AssertUnwindSafe(async { handler(request).await }).catch_unwind().await {
        Ok(Ok(response)) => match serde_json::to_value(response) {
            Ok(body) => (body, None),
            Err(e) => (error_reply(&e), Some(e.to_string())),
        },
        Ok(Err(e)) => (error_reply(&e), Some(format!("{:#}", e))),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            (error_reply(&message), Some(format!("handler panicked: {}", message)))
        }
    }
}

/// Routes the reply through the default exchange to the caller's reply
/// queue, which shares its name with the reply exchange. Nothing is
/// declared: once the caller has given up the broker drops the reply.
async fn send_reply(bus: &Bus, reply_to: &str, correlation_id: Option<String>, reply: &Value) -> Result<()> {
    let payload = encode(reply)?;
    let channel = bus.get_publish_channel().await?;
    let mut properties = MessageProperties::json();
    properties.correlation_id = correlation_id;
    bus.emitter().debug(format!("replying to {}", reply_to));
    channel.publish("", reply_to, payload, properties).await
}

async fn respond<Req, Resp, H, Fut>(
    bus: Bus,
    channel: ChannelHandle,
    handler: Arc<H>,
    message_type: Arc<str>,
    delivery: Delivery,
) where
    Req: DeserializeOwned,
    Resp: Serialize,
    H: Fn(Req) -> Fut,
    Fut: Future<Output = anyhow::Result<Resp>>,
{
    let events = bus.emitter();
    events.debug("handling message");
    let (reply, failure) = handle_request(handler.as_ref(), &delivery).await;
    if let Some(failure) = failure {
        events.debug(format!("{} handler failed: {}", message_type, failure));
    }

    match delivery.reply_to() {
        Some(reply_to) if !reply_to.is_empty() => {
            let correlation_id = delivery.properties.correlation_id.clone();
            if let Err(e) = send_reply(&bus, reply_to, correlation_id, &reply).await {
                events.error(format!("Failed to reply to {}: {}", reply_to, e));
            }
        }
        _ => events.error(format!("{} request without replyTo, no reply sent", message_type)),
    }

    events.debug("acking");
    if let Err(e) = channel.ack(delivery.delivery_tag).await {
        events.error(format!("Failed to acknowledge {} request: {}", message_type, e));
    }
}

impl Bus {
    /// Answers every request of `message_type` with `handler`'s result.
    ///
    /// Failures (handler error, panic, unreadable request) are answered with
    /// `{"error": "<cause>"}`. Each request is acked once, after its reply
    /// was attempted.
    pub async fn bind<Req, Resp, H, Fut>(&self, message_type: &str, handler: H) -> Result<RpcBinding>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        H: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        if message_type.is_empty() {
            return Err(BusError::MissingField("messageType"));
        }
        let events = self.emitter();
        events.info(format!("binding to {}", message_type));

        let queue = topology::handler_queue_name(message_type);
        let channel = self.get_consumer_channel().await?;
        let setup = async {
            channel
                .assert_exchange(message_type, ExchangeKind::Fanout, DURABLE_EXCHANGE)
                .await?;
            events.debug(format!("asserted consume exchange {}", message_type));

            channel.assert_queue(&queue, DURABLE_QUEUE).await?;
            events.debug(format!("asserted consume queue {}", queue));

            channel.bind_queue(&queue, message_type, "").await?;
            events.debug(format!("bound consume queue {}", queue));

            channel.consume(&queue, ConsumeOptions { no_ack: false }).await
        };
        let consumer = match setup.await {
            Ok(consumer) => consumer,
            Err(e) => {
                close_quietly(&channel, events, message_type).await;
                return Err(e);
            }
        };
        let consumer_tag = consumer.tag.clone();
        events.debug(format!("started consumer {}", consumer_tag));

        let handler = Arc::new(handler);
        let shared_type: Arc<str> = Arc::from(message_type);
        let bus = self.clone();
        let loop_channel = channel.clone();
        spawn_delivery_loop(consumer, events.clone(), move |delivery| {
            // Requests are answered concurrently.
            tokio::spawn(respond::<Req, Resp, H, Fut>(
                bus.clone(),
                loop_channel.clone(),
                handler.clone(),
                shared_type.clone(),
                delivery,
            ));
            async {}
        });

        Ok(RpcBinding {
            message_type: message_type.to_string(),
            queue,
            consumer_tag,
            channel,
        })
    }

    /// [`bind`](Self::bind) for handlers that answer synchronously.
    pub async fn bind_sync<Req, Resp, H>(&self, message_type: &str, handler: H) -> Result<RpcBinding>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        H: Fn(Req) -> anyhow::Result<Resp> + Send + Sync + 'static,
    {
        self.bind(message_type, move |request: Req| {
            let response = handler(request);
            async move { response }
        })
        .await
    }

    /// Stops answering requests. The durable handler queue stays.
    pub async fn unbind(&self, binding: &RpcBinding) {
        let events = self.emitter();
        if let Err(e) = binding.channel.cancel(&binding.consumer_tag).await {
            events.debug(format!("consumer {} already gone: {}", binding.consumer_tag, e));
        }
        close_quietly(&binding.channel, events, &binding.message_type).await;
    }
}
