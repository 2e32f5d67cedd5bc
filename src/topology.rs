// src/topology.rs
//! Exchange and queue naming, and the flags each pattern declares them with.
//!
//! Every component that touches a given exchange declares it with the same
//! flags, otherwise the broker refuses the second declaration.

use rand::distr::Alphanumeric;
use rand::Rng;

use crate::broker::{ExchangeOptions, QueueOptions};

/// Topic exchanges and message-type (fanout) exchanges.
pub const DURABLE_EXCHANGE: ExchangeOptions = ExchangeOptions {
    durable: true,
    auto_delete: false,
};

/// RPC reply exchange, declared by the caller only. Gone with its queue.
pub const REPLY_EXCHANGE: ExchangeOptions = ExchangeOptions {
    durable: false,
    auto_delete: true,
};

pub const REPLY_QUEUE: QueueOptions = QueueOptions {
    durable: false,
    auto_delete: true,
    exclusive: true,
};

/// Anonymous queue behind a topic subscription.
pub const TOPIC_QUEUE: QueueOptions = QueueOptions {
    durable: false,
    auto_delete: true,
    exclusive: true,
};

/// Anonymous queue behind a topic listener; removed explicitly.
pub const LISTENER_QUEUE: QueueOptions = QueueOptions {
    durable: false,
    auto_delete: false,
    exclusive: true,
};

/// Shared round-robin queues, per-node queues and RPC handler queues.
pub const DURABLE_QUEUE: QueueOptions = QueueOptions {
    durable: true,
    auto_delete: false,
    exclusive: false,
};

/// Per-subscriber queue when no node id was given.
pub const EPHEMERAL_QUEUE: QueueOptions = QueueOptions {
    durable: false,
    auto_delete: true,
    exclusive: false,
};

const REPLY_SUFFIX_LEN: usize = 10;
const NODE_ID_LEN: usize = 10;

pub fn random_id(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// `node_<type>` with every character outside `[A-Za-z0-9_-]` replaced by `_`.
pub fn node_prefix(message_type: &str) -> String {
    let normalized: String = message_type
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    format!("node_{}", normalized)
}

/// Per-node exchange bound to the message-type exchange.
pub fn relay_exchange_name(message_type: &str) -> String {
    format!("{}_consumer", node_prefix(message_type))
}

/// Queue name and flags for a message-type subscription.
pub fn consume_queue(
    message_type: &str,
    round_robin: bool,
    consumer_node_id: Option<&str>,
) -> (String, QueueOptions) {
    let base = format!("{}_consumer_queue", node_prefix(message_type));
    if round_robin {
        return (base, DURABLE_QUEUE);
    }
    match consumer_node_id {
        Some(node_id) => (format!("{}_{}", base, node_id), DURABLE_QUEUE),
        None => (format!("{}_{}", base, random_id(NODE_ID_LEN)), EPHEMERAL_QUEUE),
    }
}

pub fn handler_queue_name(message_type: &str) -> String {
    format!("{}_handler queue", message_type)
}

/// Reply exchange and queue share this name; unique per call.
pub fn reply_name(client_prefix: &str, message_type: &str) -> String {
    format!("{}{}-{}", client_prefix, message_type, random_id(REPLY_SUFFIX_LEN))
}
