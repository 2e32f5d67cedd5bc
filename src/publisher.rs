// src/publisher.rs
use serde::Serialize;

use crate::broker::{ExchangeKind, ExchangeOptions};
use crate::bus::Bus;
use crate::errors::{BusError, Result};
use crate::message::{encode, MessageProperties};
use crate::topology::DURABLE_EXCHANGE;

/// Where a [`Bus::publish`] goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishRequest {
    /// Durable topic exchange, routed by key.
    Topic {
        exchange_name: String,
        routing_key: String,
    },
    /// Durable fanout exchange named after the message type.
    MessageType { message_type: String },
}

impl PublishRequest {
    pub fn topic(exchange_name: impl Into<String>, routing_key: impl Into<String>) -> Result<Self> {
        let exchange_name = exchange_name.into();
        let routing_key = routing_key.into();
        if exchange_name.is_empty() {
            return Err(BusError::MissingField("options.exchangeName"));
        }
        if routing_key.is_empty() {
            return Err(BusError::MissingField("options.routingKey"));
        }
        Ok(PublishRequest::Topic {
            exchange_name,
            routing_key,
        })
    }

    pub fn message_type(message_type: impl Into<String>) -> Result<Self> {
        let message_type = message_type.into();
        if message_type.is_empty() {
            return Err(BusError::MissingField("options.messageType"));
        }
        Ok(PublishRequest::MessageType { message_type })
    }

    fn to_exchange_publish(&self) -> ExchangePublish {
        match self {
            PublishRequest::Topic {
                exchange_name,
                routing_key,
            } => ExchangePublish::new(exchange_name, ExchangeKind::Topic, DURABLE_EXCHANGE)
                .with_routing_key(routing_key),
            PublishRequest::MessageType { message_type } => {
                ExchangePublish::new(message_type, ExchangeKind::Fanout, DURABLE_EXCHANGE)
            }
        }
    }
}

/// Full control over the exchange a message is published to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangePublish {
    pub exchange_name: String,
    pub exchange_kind: ExchangeKind,
    pub exchange_options: ExchangeOptions,
    pub routing_key: String,
    /// Overlaid on the JSON defaults (content type, message id, timestamp).
    pub properties: MessageProperties,
}

impl ExchangePublish {
    pub fn new(exchange_name: impl Into<String>, kind: ExchangeKind, options: ExchangeOptions) -> Self {
        ExchangePublish {
            exchange_name: exchange_name.into(),
            exchange_kind: kind,
            exchange_options: options,
            routing_key: String::new(),
            properties: MessageProperties::default(),
        }
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    pub fn with_properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }
}

impl Bus {
    /// Publishes `message` as JSON by topic or by message type.
    ///
    /// Resolves once the broker took the message; under flow control that
    /// is only after the channel drained.
    pub async fn publish<T: Serialize + ?Sized>(&self, message: &T, request: &PublishRequest) -> Result<()> {
        self.publish_to(message, &request.to_exchange_publish()).await
    }

    /// Asserts the target exchange, then publishes `message` as JSON.
    pub async fn publish_to<T: Serialize + ?Sized>(&self, message: &T, options: &ExchangePublish) -> Result<()> {
        if options.exchange_name.is_empty() {
            return Err(BusError::MissingField("options.exchangeName"));
        }
        let payload = encode(message)?;
        let channel = self.get_publish_channel().await?;
        let events = self.emitter();

        channel
            .assert_exchange(&options.exchange_name, options.exchange_kind, options.exchange_options)
            .await?;
        events.debug(format!(
            "asserted {} exchange {}",
            options.exchange_kind, options.exchange_name
        ));

        events.debug(format!(
            "publishing to {} {}",
            options.exchange_name, options.routing_key
        ));
        let properties = MessageProperties::json().merge(options.properties.clone());
        channel
            .publish(&options.exchange_name, &options.routing_key, payload, properties)
            .await
    }
}
