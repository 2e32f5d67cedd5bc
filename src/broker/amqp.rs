// src/broker/amqp.rs
// RabbitMQ implementation of the broker primitives, on top of lapin.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::*,
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, Error as LapinError,
};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    BrokerChannel, BrokerConnection, BrokerConnector, ChannelHandle, ConnectionEvent,
    ConnectionEventHandler, ConnectionHandle, ConsumeOptions, Consumer, ExchangeKind,
    ExchangeOptions, QueueOptions,
};
use crate::errors::{BusError, Result};
use crate::message::{Delivery, MessageProperties};

/// Opens real AMQP connections.
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector;

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self, uri: &str) -> Result<ConnectionHandle> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;
        info!("Successfully connected to RabbitMQ");
        Ok(Arc::new(AmqpConnection { connection }))
    }
}

pub struct AmqpConnection {
    connection: Connection,
}

impl AmqpConnection {
    async fn open_channel(&self) -> Result<Channel> {
        self.connection
            .create_channel()
            .await
            .map_err(|e| BusError::ChannelError(format!("Failed to create channel: {}", e)))
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<ChannelHandle> {
        let channel = self.open_channel().await?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn create_confirm_channel(&self) -> Result<ChannelHandle> {
        let channel = self.open_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BusError::ChannelError(format!("Failed to enable confirm mode: {}", e)))?;
        debug!(channel_id = channel.id(), "Enabled confirm mode");
        Ok(Arc::new(AmqpChannel { channel }))
    }

    fn on_event(&self, mut handler: ConnectionEventHandler) {
        self.connection
            .on_error(move |err: LapinError| handler(ConnectionEvent::Error(err.to_string())));
    }

    async fn close(&self) -> Result<()> {
        info!("Closing RabbitMQ connection gracefully");
        self.connection.close(0, "Closing connection").await?;
        Ok(())
    }
}

pub struct AmqpChannel {
    channel: Channel,
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
    }
}

fn short(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|s| s.as_str().to_string())
}

fn to_basic_properties(properties: MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(content_type) = properties.content_type {
        basic = basic.with_content_type(content_type.into());
    }
    if let Some(correlation_id) = properties.correlation_id {
        basic = basic.with_correlation_id(correlation_id.into());
    }
    if let Some(reply_to) = properties.reply_to {
        basic = basic.with_reply_to(reply_to.into());
    }
    if let Some(message_id) = properties.message_id {
        basic = basic.with_message_id(message_id.into());
    }
    if let Some(timestamp) = properties.timestamp {
        basic = basic.with_timestamp(timestamp);
    }
    basic
}

fn from_basic_properties(properties: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: short(properties.content_type()),
        correlation_id: short(properties.correlation_id()),
        reply_to: short(properties.reply_to()),
        message_id: short(properties.message_id()),
        timestamp: *properties.timestamp(),
    }
}

fn from_lapin_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        properties: from_basic_properties(&delivery.properties),
        data: delivery.data,
    }
}

fn is_not_found(error: &LapinError) -> bool {
    match error {
        LapinError::ProtocolError(amqp_error) => {
            matches!(amqp_error.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND))
        }
        _ => false,
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn id(&self) -> u64 {
        u64::from(self.channel.id())
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn assert_exchange(&self, name: &str, kind: ExchangeKind, options: ExchangeOptions) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::topology(name, e))
    }

    async fn assert_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    exclusive: options.exclusive,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::topology(name, e))?;
        Ok(queue.name().as_str().to_string())
    }

    async fn check_queue(&self, name: &str) -> Result<bool> {
        let passive = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };
        match self.channel.queue_declare(name, passive, FieldTable::default()).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(queue, exchange, routing_key, QueueBindOptions::default(), FieldTable::default())
            .await
            .map_err(|e| BusError::topology(queue, e))
    }

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await
            .map_err(|e| BusError::topology(queue, e))
    }

    async fn bind_exchange(&self, destination: &str, source: &str, routing_key: &str) -> Result<()> {
        self.channel
            .exchange_bind(
                destination,
                source,
                routing_key,
                ExchangeBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::topology(destination, e))
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map_err(|e| BusError::topology(name, e))?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()> {
        // Resolves once the frame is written; lapin holds it back while the broker has flow off.
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                to_basic_properties(properties),
            )
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;
        Ok(())
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer> {
        let tag = format!("consumer-{}", Uuid::new_v4());
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_ack: options.no_ack,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::ConsumeError(e.to_string()))?;

        let deliveries = consumer
            .map(|item| item.map(from_lapin_delivery).map_err(BusError::from))
            .boxed();
        Ok(Consumer { tag, deliveries })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| BusError::ConsumeError(e.to_string()))
    }

    async fn wait_for_confirms(&self) -> Result<()> {
        let returned = self.channel.wait_for_confirms().await?;
        if !returned.is_empty() {
            debug!(count = returned.len(), "Broker returned unroutable messages");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.channel.close(0, "Closing channel").await?;
        Ok(())
    }
}
