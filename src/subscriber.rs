// src/subscriber.rs
use std::fmt;

use serde::de::DeserializeOwned;

use crate::broker::{ChannelHandle, ExchangeKind, QueueOptions};
use crate::bus::Bus;
use crate::consumer::{close_quietly, consume_json};
use crate::errors::{BusError, Result};
use crate::topology::{self, DURABLE_EXCHANGE, TOPIC_QUEUE};

/// What a [`Bus::subscribe`] listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionRequest {
    Topic {
        exchange_name: String,
        routing_key: String,
    },
    MessageType {
        message_type: String,
        /// Compete with other subscribers on one shared queue.
        round_robin_consumer: bool,
        /// Names a durable per-node queue; without it the queue is ephemeral.
        consumer_node_id: Option<String>,
    },
}

impl SubscriptionRequest {
    pub fn topic(exchange_name: impl Into<String>, routing_key: impl Into<String>) -> Result<Self> {
        let exchange_name = exchange_name.into();
        let routing_key = routing_key.into();
        if exchange_name.is_empty() {
            return Err(BusError::MissingField("options.exchangeName"));
        }
        if routing_key.is_empty() {
            return Err(BusError::MissingField("options.routingKey"));
        }
        Ok(SubscriptionRequest::Topic {
            exchange_name,
            routing_key,
        })
    }

    pub fn message_type(message_type: impl Into<String>) -> Result<Self> {
        let message_type = message_type.into();
        if message_type.is_empty() {
            return Err(BusError::MissingField("subscription.messageType"));
        }
        Ok(SubscriptionRequest::MessageType {
            message_type,
            round_robin_consumer: false,
            consumer_node_id: None,
        })
    }

    /// Switches a message-type request to the shared round-robin queue.
    pub fn round_robin(mut self) -> Self {
        if let SubscriptionRequest::MessageType {
            round_robin_consumer,
            ..
        } = &mut self
        {
            *round_robin_consumer = true;
        }
        self
    }

    pub fn with_consumer_node_id(mut self, node_id: impl Into<String>) -> Self {
        if let SubscriptionRequest::MessageType {
            consumer_node_id, ..
        } = &mut self
        {
            *consumer_node_id = Some(node_id.into());
        }
        self
    }

    fn describe(&self) -> String {
        match self {
            SubscriptionRequest::Topic { routing_key, .. } => routing_key.clone(),
            SubscriptionRequest::MessageType { message_type, .. } => message_type.clone(),
        }
    }
}

/// A live subscription. Ended with [`Bus::unsubscribe`].
pub struct Subscription {
    request: SubscriptionRequest,
    queue: String,
    consumer_tag: String,
    channel: ChannelHandle,
}

impl Subscription {
    pub fn request(&self) -> &SubscriptionRequest {
        &self.request
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn channel(&self) -> &ChannelHandle {
        &self.channel
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("request", &self.request)
            .field("queue", &self.queue)
            .field("consumer_tag", &self.consumer_tag)
            .field("channel_open", &self.channel.is_open())
            .finish()
    }
}

/// Asserts a durable topic exchange and binds a fresh anonymous queue to it.
pub(crate) async fn bind_topic_queue(
    bus: &Bus,
    channel: &ChannelHandle,
    exchange_name: &str,
    routing_key: &str,
    queue_options: QueueOptions,
) -> Result<String> {
    let events = bus.emitter();
    channel
        .assert_exchange(exchange_name, ExchangeKind::Topic, DURABLE_EXCHANGE)
        .await?;
    events.debug(format!("asserted topic exchange {}", exchange_name));

    let queue = channel.assert_queue("", queue_options).await?;
    events.debug(format!("asserted queue {}", queue));

    channel.bind_queue(&queue, exchange_name, routing_key).await?;
    events.debug(format!("bound queue {}, {}", queue, routing_key));
    Ok(queue)
}

/// Message-type exchange, relay exchange bound to it, and the consume queue.
async fn bind_message_type_queue(
    bus: &Bus,
    channel: &ChannelHandle,
    message_type: &str,
    round_robin: bool,
    consumer_node_id: Option<&str>,
) -> Result<String> {
    let events = bus.emitter();
    let relay = topology::relay_exchange_name(message_type);
    let (queue, queue_options) = topology::consume_queue(message_type, round_robin, consumer_node_id);

    channel
        .assert_exchange(message_type, ExchangeKind::Fanout, DURABLE_EXCHANGE)
        .await?;
    events.debug(format!("asserted messageType exchange {}", message_type));

    channel
        .assert_exchange(&relay, ExchangeKind::Fanout, DURABLE_EXCHANGE)
        .await?;
    events.debug(format!("asserted consume exchange {}", relay));

    channel.bind_exchange(&relay, message_type, "").await?;
    events.debug(format!("bound consume exchange {}", relay));

    let queue = channel.assert_queue(&queue, queue_options).await?;
    events.debug(format!("asserted consume queue {}", queue));

    channel.bind_queue(&queue, &relay, "").await?;
    events.debug(format!("bound consume queue {}", queue));
    Ok(queue)
}

impl Bus {
    /// Starts delivering parsed messages to `callback`, each acked once the
    /// callback returned.
    pub async fn subscribe<T, F>(&self, request: &SubscriptionRequest, callback: F) -> Result<Subscription>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let events = self.emitter();
        match request {
            SubscriptionRequest::Topic {
                exchange_name,
                routing_key,
            } => events.info(format!(
                "registering topic subscription on exchange {} with routing key {}",
                exchange_name, routing_key
            )),
            SubscriptionRequest::MessageType { message_type, .. } => {
                events.info(format!("subscribing to {}", message_type))
            }
        }

        let channel = self.get_consumer_channel().await?;
        let setup = async {
            let queue = match request {
                SubscriptionRequest::Topic {
                    exchange_name,
                    routing_key,
                } => bind_topic_queue(self, &channel, exchange_name, routing_key, TOPIC_QUEUE).await?,
                SubscriptionRequest::MessageType {
                    message_type,
                    round_robin_consumer,
                    consumer_node_id,
                } => {
                    bind_message_type_queue(
                        self,
                        &channel,
                        message_type,
                        *round_robin_consumer,
                        consumer_node_id.as_deref(),
                    )
                    .await?
                }
            };
            let consumer_tag = consume_json(&channel, events, &queue, callback).await?;
            Ok::<_, BusError>((queue, consumer_tag))
        };

        let (queue, consumer_tag) = match setup.await {
            Ok(consuming) => consuming,
            Err(e) => {
                close_quietly(&channel, events, &request.describe()).await;
                return Err(e);
            }
        };

        events.info(format!("subscribed to {}", request.describe()));
        Ok(Subscription {
            request: request.clone(),
            queue,
            consumer_tag,
            channel,
        })
    }

    /// Cancels the consumer and closes its channel. Queues are left in
    /// place. Safe to call more than once.
    pub async fn unsubscribe(&self, subscription: &Subscription) {
        let events = self.emitter();
        let what = subscription.request.describe();
        events.debug(format!(
            "unsubscribing from {}, {}",
            what, subscription.consumer_tag
        ));
        match subscription.channel.cancel(&subscription.consumer_tag).await {
            Ok(()) => events.debug(format!("cancelled consumer {}", subscription.consumer_tag)),
            Err(e) => events.debug(format!(
                "consumer {} already gone: {}",
                subscription.consumer_tag, e
            )),
        }
        close_quietly(&subscription.channel, events, &what).await;
    }
}
