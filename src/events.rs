// src/events.rs
use tokio::sync::broadcast;
use tracing::{debug, error, info};

const EVENT_CAPACITY: usize = 256;

/// Lifecycle and diagnostic notifications emitted by a [`Bus`](crate::Bus).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Started,
    Stopped { was_connected: bool },
    Debug(String),
    Info(String),
    Error(String),
}

/// Fan-out point for [`BusEvent`]s. Every event is mirrored to `tracing`.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<BusEvent>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: BusEvent) {
        match &event {
            BusEvent::Started => info!("bus started"),
            BusEvent::Stopped { was_connected } => info!(was_connected, "bus stopped"),
            BusEvent::Debug(message) => debug!("{}", message),
            BusEvent::Info(message) => info!("{}", message),
            BusEvent::Error(message) => error!("{}", message),
        }
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.emit(BusEvent::Debug(message.into()));
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(BusEvent::Info(message.into()));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(BusEvent::Error(message.into()));
    }
}
