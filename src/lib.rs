// src/lib.rs
//! Publish/subscribe and request/reply messaging patterns over RabbitMQ.

pub mod broker;           // Broker primitives: lapin and in-memory
pub mod bus;
pub mod config;
pub mod connection;       // Reconnect supervisor
pub mod errors;
pub mod events;
pub mod message;
pub mod publisher;
pub mod rpc;
pub mod subscriber;
pub mod topic_listener;
pub mod topology;         // Exchange/queue names and flags

mod consumer;

// Re-export the main types to simplify imports elsewhere
pub use broker::{AmqpConnector, MemoryBroker};
pub use bus::Bus;
pub use config::BusConfig;
pub use connection::ConnectionState;
pub use errors::{BusError, Result};
pub use events::BusEvent;
pub use message::{Delivery, MessageProperties};
pub use publisher::{ExchangePublish, PublishRequest};
pub use rpc::{CallOptions, RpcBinding};
pub use subscriber::{Subscription, SubscriptionRequest};
pub use topic_listener::{TopicListener, TopicListenerOptions};
