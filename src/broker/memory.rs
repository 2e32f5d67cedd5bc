// src/broker/memory.rs
//! A single-process broker with RabbitMQ's routing rules.
//!
//! Channels, exchanges, queues and consumers behave the way the AMQP
//! broker treats them (equivalence checks close the offending channel,
//! auto-delete queues go with their last consumer, exclusive queues go
//! with their connection, unacked deliveries are requeued when their
//! channel closes). The extra controls let tests drop connections, apply
//! flow control and hold publisher confirms.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use super::{
    BrokerChannel, BrokerConnection, BrokerConnector, ChannelHandle, ConnectionEvent,
    ConnectionEventHandler, ConnectionHandle, ConsumeOptions, Consumer, ExchangeKind,
    ExchangeOptions, QueueOptions,
};
use crate::errors::{BusError, Result};
use crate::message::{Delivery, MessageProperties};

/// A message as it was handed to `publish`, kept for inspection.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    data: Vec<u8>,
    redelivered: bool,
}

struct ExchangeEntry {
    kind: ExchangeKind,
    options: ExchangeOptions,
    had_bindings: bool,
}

struct QueueEntry {
    options: QueueOptions,
    owner: u64,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<String>,
    next_consumer: usize,
    had_consumers: bool,
    acked: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Destination {
    Queue(String),
    Exchange(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    source: String,
    destination: Destination,
    routing_key: String,
}

struct ConsumerEntry {
    queue: String,
    channel: u64,
    no_ack: bool,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
}

struct ChannelEntry {
    connection: u64,
    open: bool,
    confirm: bool,
    next_delivery_tag: u64,
    unacked: HashMap<u64, (String, StoredMessage)>,
}

struct ConnectionEntry {
    open: bool,
    handlers: Vec<ConnectionEventHandler>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeEntry>,
    queues: HashMap<String, QueueEntry>,
    bindings: Vec<Binding>,
    consumers: HashMap<String, ConsumerEntry>,
    channels: HashMap<u64, ChannelEntry>,
    connections: HashMap<u64, ConnectionEntry>,
    next_id: u64,
    refuse_connects: usize,
    connect_attempts: usize,
    connect_delay: Option<Duration>,
    fail_next_close: Option<String>,
    hold_confirms: bool,
    published: Vec<PublishedMessage>,
}

struct Inner {
    state: Mutex<BrokerState>,
    flow: watch::Sender<bool>,
    pending_confirms: watch::Sender<usize>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Matches an AMQP topic binding pattern (`*` = one word, `#` = zero or more words).
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(word), Some(part)) if word == part => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    matches(&pattern, &key)
}

fn closed_channel(id: u64) -> BusError {
    BusError::ChannelError(format!("channel {} is closed", id))
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn open_channel(&mut self, id: u64) -> Result<&mut ChannelEntry> {
        match self.channels.get_mut(&id) {
            Some(channel) if channel.open => Ok(channel),
            _ => Err(closed_channel(id)),
        }
    }

    /// A channel-level protocol error closes the channel, as the broker does.
    fn fail_channel(&mut self, id: u64, error: BusError) -> BusError {
        debug!(channel_id = id, error = %error, "closing channel after protocol error");
        self.close_channel(id);
        error
    }

    fn close_channel(&mut self, id: u64) {
        let mut unacked: Vec<(u64, (String, StoredMessage))> = match self.channels.get_mut(&id) {
            Some(channel) if channel.open => {
                channel.open = false;
                channel.unacked.drain().collect()
            }
            _ => return,
        };

        let tags: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, consumer)| consumer.channel == id)
            .map(|(tag, _)| tag.clone())
            .collect();
        let mut touched = Vec::new();
        for tag in tags {
            if let Some(queue) = self.detach_consumer(&tag) {
                touched.push(queue);
            }
        }

        unacked.sort_by_key(|(tag, _)| *tag);
        for (_, (queue_name, mut message)) in unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                message.redelivered = true;
                queue.messages.push_front(message);
                touched.push(queue_name);
            }
        }

        for queue in touched {
            self.delete_if_unused(&queue);
            self.dispatch(&queue);
        }
    }

    fn close_connection(&mut self, id: u64) -> Result<()> {
        match self.connections.get_mut(&id) {
            Some(connection) if connection.open => {
                connection.open = false;
                connection.handlers.clear();
            }
            _ => return Err(BusError::ConnectionError(format!("connection {} is closed", id))),
        }

        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.connection == id)
            .map(|(channel_id, _)| *channel_id)
            .collect();
        for channel in channels {
            self.close_channel(channel);
            self.channels.remove(&channel);
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.options.exclusive && queue.owner == id)
            .map(|(name, _)| name.clone())
            .collect();
        for queue in exclusive {
            self.delete_queue_entry(&queue);
        }
        Ok(())
    }

    fn notify(&mut self, connection: u64, event: ConnectionEvent) {
        if let Some(entry) = self.connections.get_mut(&connection) {
            for handler in entry.handlers.iter_mut() {
                handler(event.clone());
            }
        }
    }

    fn open_connections(&self) -> Vec<u64> {
        self.connections
            .iter()
            .filter(|(_, connection)| connection.open)
            .map(|(id, _)| *id)
            .collect()
    }

    fn detach_consumer(&mut self, tag: &str) -> Option<String> {
        let consumer = self.consumers.remove(tag)?;
        if let Some(queue) = self.queues.get_mut(&consumer.queue) {
            queue.consumers.retain(|t| t != tag);
        }
        Some(consumer.queue)
    }

    fn delete_if_unused(&mut self, name: &str) {
        let unused = self
            .queues
            .get(name)
            .map(|q| q.options.auto_delete && q.had_consumers && q.consumers.is_empty())
            .unwrap_or(false);
        if unused {
            debug!(queue = name, "auto-deleting queue");
            self.delete_queue_entry(name);
        }
    }

    fn delete_queue_entry(&mut self, name: &str) {
        if let Some(queue) = self.queues.remove(name) {
            for tag in queue.consumers {
                self.consumers.remove(&tag);
            }
        }
        let destination = Destination::Queue(name.to_string());
        self.bindings.retain(|b| b.destination != destination);
        self.prune_exchanges();
    }

    fn prune_exchanges(&mut self) {
        loop {
            let unused: Vec<String> = self
                .exchanges
                .iter()
                .filter(|(name, exchange)| {
                    exchange.options.auto_delete
                        && exchange.had_bindings
                        && !self.bindings.iter().any(|b| &b.source == *name)
                })
                .map(|(name, _)| name.clone())
                .collect();
            if unused.is_empty() {
                return;
            }
            for name in unused {
                debug!(exchange = %name, "auto-deleting exchange");
                self.exchanges.remove(&name);
                let destination = Destination::Exchange(name);
                self.bindings.retain(|b| b.destination != destination);
            }
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        let mut queues = Vec::new();
        if exchange.is_empty() {
            if self.queues.contains_key(routing_key) {
                queues.push(routing_key.to_string());
            }
            return queues;
        }
        let mut visited = HashSet::new();
        self.route_into(exchange, routing_key, &mut visited, &mut queues);
        queues
    }

    fn route_into(
        &self,
        exchange: &str,
        routing_key: &str,
        visited: &mut HashSet<String>,
        queues: &mut Vec<String>,
    ) {
        if !visited.insert(exchange.to_string()) {
            return;
        }
        let Some(entry) = self.exchanges.get(exchange) else {
            return;
        };
        for binding in self.bindings.iter().filter(|b| b.source == exchange) {
            let matched = match entry.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
            };
            if !matched {
                continue;
            }
            match &binding.destination {
                Destination::Queue(queue) => {
                    if !queues.contains(queue) {
                        queues.push(queue.clone());
                    }
                }
                Destination::Exchange(next) => self.route_into(next, routing_key, visited, queues),
            }
        }
    }

    /// Hands queued messages to the queue's consumers in turn.
    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.messages.is_empty() || queue.consumers.is_empty() {
                return;
            }
            let index = queue.next_consumer % queue.consumers.len();
            queue.next_consumer = queue.next_consumer.wrapping_add(1);
            let tag = queue.consumers[index].clone();
            let Some(message) = queue.messages.pop_front() else {
                return;
            };

            let (channel_id, no_ack, sender) = match self.consumers.get(&tag) {
                Some(consumer) => (consumer.channel, consumer.no_ack, consumer.sender.clone()),
                None => {
                    queue.consumers.retain(|t| t != &tag);
                    queue.messages.push_front(message);
                    continue;
                }
            };
            let Some(channel) = self.channels.get_mut(&channel_id) else {
                queue.consumers.retain(|t| t != &tag);
                queue.messages.push_front(message);
                continue;
            };

            channel.next_delivery_tag += 1;
            let delivery = Delivery {
                delivery_tag: channel.next_delivery_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                data: message.data.clone(),
            };
            let delivery_tag = delivery.delivery_tag;

            if sender.unbounded_send(Ok(delivery)).is_err() {
                // Stream dropped by its owner: treat as cancelled.
                queue.consumers.retain(|t| t != &tag);
                queue.messages.push_front(message);
                self.consumers.remove(&tag);
                continue;
            }
            if !no_ack {
                channel.unacked.insert(delivery_tag, (queue_name.to_string(), message));
            }
        }
    }

    fn enqueue(&mut self, queue_name: &str, message: StoredMessage) {
        if let Some(queue) = self.queues.get_mut(queue_name) {
            queue.messages.push_back(message);
        }
        self.dispatch(queue_name);
    }
}

/// In-process broker. Cloning shares the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (flow, _) = watch::channel(true);
        let (pending_confirms, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                flow,
                pending_confirms,
            }),
        }
    }

    /// The next `count` connection attempts fail.
    pub fn refuse_connections(&self, count: usize) {
        self.inner.lock().refuse_connects = count;
    }

    pub fn connect_attempts(&self) -> usize {
        self.inner.lock().connect_attempts
    }

    /// Connections are opened at once but `connect` returns only after `delay`.
    pub fn delay_connects(&self, delay: Duration) {
        self.inner.lock().connect_delay = Some(delay);
    }

    /// The next connection close fails with `reason` and leaves the connection open.
    pub fn fail_next_close(&self, reason: &str) {
        self.inner.lock().fail_next_close = Some(reason.to_string());
    }

    /// Fails every open connection, as a broker restart would.
    pub fn drop_connections(&self, reason: &str) {
        let mut state = self.inner.lock();
        for id in state.open_connections() {
            state.notify(id, ConnectionEvent::Error(reason.to_string()));
            let _ = state.close_connection(id);
        }
    }

    pub fn block_connections(&self, reason: &str) {
        let mut state = self.inner.lock();
        for id in state.open_connections() {
            state.notify(id, ConnectionEvent::Blocked(reason.to_string()));
        }
    }

    pub fn unblock_connections(&self) {
        let mut state = self.inner.lock();
        for id in state.open_connections() {
            state.notify(id, ConnectionEvent::Unblocked);
        }
    }

    /// Publishes suspend until [`resume_flow`](Self::resume_flow).
    pub fn pause_flow(&self) {
        self.inner.flow.send_replace(false);
    }

    pub fn resume_flow(&self) {
        self.inner.flow.send_replace(true);
    }

    /// Publishes on confirm channels stay unconfirmed until [`release_confirms`](Self::release_confirms).
    pub fn hold_confirms(&self) {
        self.inner.lock().hold_confirms = true;
    }

    pub fn release_confirms(&self) {
        self.inner.lock().hold_confirms = false;
        self.inner.pending_confirms.send_replace(0);
    }

    pub fn pending_confirms(&self) -> usize {
        *self.inner.pending_confirms.borrow()
    }

    pub fn open_connection_count(&self) -> usize {
        self.inner.lock().open_connections().len()
    }

    pub fn open_channel_count(&self) -> usize {
        self.inner.lock().channels.values().filter(|c| c.open).count()
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.inner.lock().exchanges.get(name).map(|e| e.kind)
    }

    pub fn exchange_options(&self, name: &str) -> Option<ExchangeOptions> {
        self.inner.lock().exchanges.get(name).map(|e| e.options)
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.inner.lock().queues.contains_key(name)
    }

    pub fn queue_options(&self, name: &str) -> Option<QueueOptions> {
        self.inner.lock().queues.get(name).map(|q| q.options)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn message_count(&self, queue: &str) -> usize {
        self.inner.lock().queues.get(queue).map_or(0, |q| q.messages.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.inner.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    /// Number of deliveries from `queue` that were explicitly acknowledged.
    pub fn ack_count(&self, queue: &str) -> usize {
        self.inner.lock().queues.get(queue).map_or(0, |q| q.acked)
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .channels
            .values()
            .flat_map(|c| c.unacked.values())
            .filter(|(q, _)| q == queue)
            .count()
    }

    pub fn is_bound(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        let wanted = Binding {
            source: exchange.to_string(),
            destination: Destination::Queue(queue.to_string()),
            routing_key: routing_key.to_string(),
        };
        self.inner.lock().bindings.contains(&wanted)
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner.lock().published.clone()
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self, uri: &str) -> Result<ConnectionHandle> {
        let (id, delay) = {
            let mut state = self.inner.lock();
            state.connect_attempts += 1;
            if state.refuse_connects > 0 {
                state.refuse_connects -= 1;
                return Err(BusError::ConnectionError(format!(
                    "connection refused: {}",
                    uri.split('@').last().unwrap_or(uri)
                )));
            }
            let id = state.next_id();
            state.connections.insert(
                id,
                ConnectionEntry {
                    open: true,
                    handlers: Vec::new(),
                },
            );
            (id, state.connect_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(Arc::new(MemoryConnection {
            broker: self.inner.clone(),
            id,
        }))
    }
}

pub struct MemoryConnection {
    broker: Arc<Inner>,
    id: u64,
}

impl MemoryConnection {
    fn open(&self, confirm: bool) -> Result<ChannelHandle> {
        let mut state = self.broker.lock();
        match state.connections.get(&self.id) {
            Some(connection) if connection.open => {}
            _ => return Err(BusError::ConnectionError(format!("connection {} is closed", self.id))),
        }
        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelEntry {
                connection: self.id,
                open: true,
                confirm,
                next_delivery_tag: 0,
                unacked: HashMap::new(),
            },
        );
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            connection: self.id,
            id,
        }))
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<ChannelHandle> {
        self.open(false)
    }

    async fn create_confirm_channel(&self) -> Result<ChannelHandle> {
        self.open(true)
    }

    fn on_event(&self, handler: ConnectionEventHandler) {
        if let Some(connection) = self.broker.lock().connections.get_mut(&self.id) {
            connection.handlers.push(handler);
        }
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.lock();
        if let Some(reason) = state.fail_next_close.take() {
            return Err(BusError::ConnectionError(reason));
        }
        state.close_connection(self.id)
    }
}

pub struct MemoryChannel {
    broker: Arc<Inner>,
    connection: u64,
    id: u64,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.broker
            .lock()
            .channels
            .get(&self.id)
            .map_or(false, |c| c.open)
    }

    async fn assert_exchange(&self, name: &str, kind: ExchangeKind, options: ExchangeOptions) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        if let Some(existing) = state.exchanges.get(name) {
            if existing.kind != kind || existing.options != options {
                let reason = format!(
                    "PRECONDITION_FAILED - inequivalent arg for exchange '{}': received {} {:?} but current is {} {:?}",
                    name, kind, options, existing.kind, existing.options
                );
                return Err(state.fail_channel(self.id, BusError::topology(name, reason)));
            }
            return Ok(());
        }
        state.exchanges.insert(
            name.to_string(),
            ExchangeEntry {
                kind,
                options,
                had_bindings: false,
            },
        );
        Ok(())
    }

    async fn assert_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };
        if let Some(existing) = state.queues.get(&name) {
            if existing.options.exclusive && existing.owner != self.connection {
                let reason = format!("RESOURCE_LOCKED - cannot obtain exclusive access to queue '{}'", name);
                return Err(state.fail_channel(self.id, BusError::topology(name, reason)));
            }
            if existing.options != options {
                let reason = format!(
                    "PRECONDITION_FAILED - inequivalent arg for queue '{}': received {:?} but current is {:?}",
                    name, options, existing.options
                );
                return Err(state.fail_channel(self.id, BusError::topology(name, reason)));
            }
            return Ok(name);
        }
        state.queues.insert(
            name.clone(),
            QueueEntry {
                options,
                owner: self.connection,
                messages: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
                had_consumers: false,
                acked: 0,
            },
        );
        Ok(name)
    }

    async fn check_queue(&self, name: &str) -> Result<bool> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        if state.queues.contains_key(name) {
            return Ok(true);
        }
        // A passive declare of a missing queue closes the channel.
        state.close_channel(self.id);
        Ok(false)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        if !state.queues.contains_key(queue) {
            let reason = format!("NOT_FOUND - no queue '{}'", queue);
            return Err(state.fail_channel(self.id, BusError::topology(queue, reason)));
        }
        if !state.exchanges.contains_key(exchange) {
            let reason = format!("NOT_FOUND - no exchange '{}'", exchange);
            return Err(state.fail_channel(self.id, BusError::topology(exchange, reason)));
        }
        if let Some(source) = state.exchanges.get_mut(exchange) {
            source.had_bindings = true;
        }
        let binding = Binding {
            source: exchange.to_string(),
            destination: Destination::Queue(queue.to_string()),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        if !state.queues.contains_key(queue) {
            let reason = format!("NOT_FOUND - no queue '{}'", queue);
            return Err(state.fail_channel(self.id, BusError::topology(queue, reason)));
        }
        let binding = Binding {
            source: exchange.to_string(),
            destination: Destination::Queue(queue.to_string()),
            routing_key: routing_key.to_string(),
        };
        state.bindings.retain(|b| b != &binding);
        state.prune_exchanges();
        Ok(())
    }

    async fn bind_exchange(&self, destination: &str, source: &str, routing_key: &str) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        for name in [destination, source] {
            if !state.exchanges.contains_key(name) {
                let reason = format!("NOT_FOUND - no exchange '{}'", name);
                return Err(state.fail_channel(self.id, BusError::topology(name, reason)));
            }
        }
        if let Some(entry) = state.exchanges.get_mut(source) {
            entry.had_bindings = true;
        }
        let binding = Binding {
            source: source.to_string(),
            destination: Destination::Exchange(destination.to_string()),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        state.delete_queue_entry(name);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()> {
        let mut flow = self.broker.flow.subscribe();
        flow.wait_for(|active| *active)
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        let mut state = self.broker.lock();
        let confirm = state.open_channel(self.id)?.confirm;
        if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
            let reason = format!("NOT_FOUND - no exchange '{}'", exchange);
            return Err(state.fail_channel(self.id, BusError::topology(exchange, reason)));
        }

        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties: properties.clone(),
            data: payload.clone(),
        });
        for queue in state.route(exchange, routing_key) {
            let message = StoredMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                properties: properties.clone(),
                data: payload.clone(),
                redelivered: false,
            };
            state.enqueue(&queue, message);
        }
        if confirm && state.hold_confirms {
            self.broker.pending_confirms.send_modify(|pending| *pending += 1);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        let refused = match state.queues.get(queue) {
            None => Some(format!("NOT_FOUND - no queue '{}'", queue)),
            Some(entry) if entry.options.exclusive && entry.owner != self.connection => Some(format!(
                "RESOURCE_LOCKED - cannot obtain exclusive access to queue '{}'",
                queue
            )),
            Some(_) => None,
        };
        if let Some(reason) = refused {
            return Err(state.fail_channel(self.id, BusError::topology(queue, reason)));
        }

        let tag = format!("ctag-{}", state.next_id());
        let (sender, receiver) = mpsc::unbounded();
        state.consumers.insert(
            tag.clone(),
            ConsumerEntry {
                queue: queue.to_string(),
                channel: self.id,
                no_ack: options.no_ack,
                sender,
            },
        );
        if let Some(entry) = state.queues.get_mut(queue) {
            entry.consumers.push(tag.clone());
            entry.had_consumers = true;
        }
        state.dispatch(queue);

        Ok(Consumer {
            tag,
            deliveries: receiver.boxed(),
        })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.broker.lock();
        let removed = state.open_channel(self.id)?.unacked.remove(&delivery_tag);
        match removed {
            Some((queue, _)) => {
                if let Some(entry) = state.queues.get_mut(&queue) {
                    entry.acked += 1;
                }
                Ok(())
            }
            None => {
                let reason = format!("PRECONDITION_FAILED - unknown delivery tag {}", delivery_tag);
                Err(state.fail_channel(self.id, BusError::AckError(reason)))
            }
        }
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.broker.lock();
        let removed = state.open_channel(self.id)?.unacked.remove(&delivery_tag);
        match removed {
            Some((queue, mut message)) => {
                if requeue {
                    if let Some(entry) = state.queues.get_mut(&queue) {
                        message.redelivered = true;
                        entry.messages.push_front(message);
                    }
                    state.dispatch(&queue);
                }
                Ok(())
            }
            None => {
                let reason = format!("PRECONDITION_FAILED - unknown delivery tag {}", delivery_tag);
                Err(state.fail_channel(self.id, BusError::AckError(reason)))
            }
        }
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        let owned = state
            .consumers
            .get(consumer_tag)
            .map_or(false, |c| c.channel == self.id);
        if owned {
            if let Some(queue) = state.detach_consumer(consumer_tag) {
                state.delete_if_unused(&queue);
            }
        }
        Ok(())
    }

    async fn wait_for_confirms(&self) -> Result<()> {
        self.broker.lock().open_channel(self.id)?;
        let mut pending = self.broker.pending_confirms.subscribe();
        pending
            .wait_for(|count| *count == 0)
            .await
            .map_err(|e| BusError::ChannelError(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.lock();
        state.open_channel(self.id)?;
        state.close_channel(self.id);
        Ok(())
    }
}
