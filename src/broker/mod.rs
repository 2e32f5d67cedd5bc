// src/broker/mod.rs
//! The broker primitives the messaging patterns are built on.
//!
//! [`amqp`] drives a real RabbitMQ server through `lapin`; [`memory`] is a
//! single-process broker with the same routing rules, used for tests.

pub mod amqp;
pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::errors::Result;
use crate::message::{Delivery, MessageProperties};

pub use amqp::AmqpConnector;
pub use memory::MemoryBroker;

pub type ConnectionHandle = Arc<dyn BrokerConnection>;
pub type ChannelHandle = Arc<dyn BrokerChannel>;
pub type ConnectionEventHandler = Box<dyn FnMut(ConnectionEvent) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Deliveries are considered settled as soon as they are sent.
    pub no_ack: bool,
}

/// Connection-level notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection failed; it will not recover on its own.
    Error(String),
    Blocked(String),
    Unblocked,
}

/// A live consumer: its tag plus the stream of deliveries.
/// The stream ends when the consumer is cancelled or its channel closes.
pub struct Consumer {
    pub tag: String,
    pub deliveries: BoxStream<'static, Result<Delivery>>,
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<ConnectionHandle>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<ChannelHandle>;

    /// A channel in publisher-confirm mode.
    async fn create_confirm_channel(&self) -> Result<ChannelHandle>;

    fn on_event(&self, handler: ConnectionEventHandler);

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> u64;

    fn is_open(&self) -> bool;

    async fn assert_exchange(&self, name: &str, kind: ExchangeKind, options: ExchangeOptions) -> Result<()>;

    /// Declares a queue and returns its name. An empty name asks the broker to generate one.
    async fn assert_queue(&self, name: &str, options: QueueOptions) -> Result<String>;

    async fn check_queue(&self, name: &str) -> Result<bool>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn bind_exchange(&self, destination: &str, source: &str, routing_key: &str) -> Result<()>;

    async fn delete_queue(&self, name: &str) -> Result<()>;

    /// Completes once the broker has accepted the message, waiting out flow control.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()>;

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn wait_for_confirms(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
