// src/topic_listener.rs
//! Short-lived topic consumers that clean up their queue when removed.

use std::fmt;

use serde::de::DeserializeOwned;

use crate::broker::ChannelHandle;
use crate::bus::Bus;
use crate::consumer::{close_quietly, consume_json};
use crate::errors::{BusError, Result};
use crate::subscriber::bind_topic_queue;
use crate::topology::LISTENER_QUEUE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicListenerOptions {
    exchange_name: String,
    routing_key: String,
}

impl TopicListenerOptions {
    pub fn new(exchange_name: impl Into<String>, routing_key: impl Into<String>) -> Result<Self> {
        let exchange_name = exchange_name.into();
        let routing_key = routing_key.into();
        if exchange_name.is_empty() {
            return Err(BusError::MissingField("options.exchangeName"));
        }
        if routing_key.is_empty() {
            return Err(BusError::MissingField("options.routingKey"));
        }
        Ok(TopicListenerOptions {
            exchange_name,
            routing_key,
        })
    }
}

pub struct TopicListener {
    exchange_name: String,
    routing_key: String,
    queue: String,
    consumer_tag: String,
    channel: ChannelHandle,
}

impl TopicListener {
    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }
}

impl fmt::Debug for TopicListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicListener")
            .field("exchange_name", &self.exchange_name)
            .field("routing_key", &self.routing_key)
            .field("queue", &self.queue)
            .field("consumer_tag", &self.consumer_tag)
            .finish_non_exhaustive()
    }
}

impl Bus {
    pub async fn register_topic_listener<T, F>(
        &self,
        options: &TopicListenerOptions,
        callback: F,
    ) -> Result<TopicListener>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let events = self.emitter();
        events.info(format!("registering topic listener: {}", options.routing_key));

        let channel = self.get_consumer_channel().await?;
        let setup = async {
            let queue = bind_topic_queue(
                self,
                &channel,
                &options.exchange_name,
                &options.routing_key,
                LISTENER_QUEUE,
            )
            .await?;
            let consumer_tag = consume_json(&channel, events, &queue, callback).await?;
            Ok::<_, BusError>((queue, consumer_tag))
        };
        let (queue, consumer_tag) = match setup.await {
            Ok(consuming) => consuming,
            Err(e) => {
                close_quietly(&channel, events, &options.routing_key).await;
                return Err(e);
            }
        };

        events.info(format!("registered listener {}", options.routing_key));
        Ok(TopicListener {
            exchange_name: options.exchange_name.clone(),
            routing_key: options.routing_key.clone(),
            queue,
            consumer_tag,
            channel,
        })
    }

    /// Unbinds and deletes the listener's queue if it still exists, then
    /// closes the channel. The channel is closed even when teardown fails.
    pub async fn remove_topic_listener(&self, listener: &TopicListener) -> Result<()> {
        let events = self.emitter();
        events.debug(format!("removing topic listener: {}", listener.routing_key));

        let teardown = async {
            // A failed check means the channel is already gone: nothing left to unbind.
            if !listener.channel.check_queue(&listener.queue).await.unwrap_or(false) {
                return Ok(());
            }
            listener
                .channel
                .unbind_queue(&listener.queue, &listener.exchange_name, &listener.routing_key)
                .await?;
            events.debug(format!("unbound queue {}", listener.queue));
            listener.channel.delete_queue(&listener.queue).await?;
            events.debug(format!("deleted queue {}", listener.queue));
            Ok::<_, BusError>(())
        }
        .await;

        close_quietly(&listener.channel, events, &listener.routing_key).await;
        teardown?;
        events.info(format!("removed topic listener {}", listener.routing_key));
        Ok(())
    }
}
