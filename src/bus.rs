// src/bus.rs
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::broker::{AmqpConnector, BrokerConnector, ChannelHandle};
use crate::config::BusConfig;
use crate::connection::{ConnectionState, Shared, Supervisor};
use crate::errors::{BusError, Result};
use crate::events::{BusEvent, EventEmitter};

struct BusInner {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        let supervisor = self.supervisor.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(supervisor) = supervisor.take() {
            supervisor.abort();
        }
    }
}

/// Handle on one broker connection and the messaging patterns built on it.
///
/// Cloning is cheap; clones share the connection.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// A bus talking to RabbitMQ.
    pub fn new(config: BusConfig) -> Result<Self> {
        Self::with_connector(config, Arc::new(AmqpConnector))
    }

    pub fn with_connector(config: BusConfig, connector: Arc<dyn BrokerConnector>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| BusError::ConfigError(e.to_string()))?;
        Ok(Bus {
            inner: Arc::new(BusInner {
                shared: Arc::new(Shared::new(config, connector)),
                supervisor: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.shared.config
    }

    pub fn client_prefix(&self) -> &str {
        &self.inner.shared.config.client_prefix
    }

    pub fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.inner.shared.events.subscribe()
    }

    pub(crate) fn emitter(&self) -> &EventEmitter {
        &self.inner.shared.events
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.shared.state.borrow()
    }

    /// Starts connecting in the background. Calling it again while the
    /// bus is running does nothing.
    pub fn start(&self) {
        let mut supervisor = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if supervisor.as_ref().map_or(false, Supervisor::is_running) {
            debug!("Bus already started");
            return;
        }
        *supervisor = Some(Supervisor::spawn(self.inner.shared.clone()));
    }

    pub async fn wait_until_connected(&self) -> Result<()> {
        let mut state = self.inner.shared.state.subscribe();
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;
        Ok(())
    }

    /// Stops reconnecting, waits for outstanding publisher confirms and
    /// closes the connection. Returns whether a live connection was closed.
    ///
    /// `Stopped` is emitted in every case, also when closing fails.
    pub async fn stop(&self) -> Result<bool> {
        let supervisor = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(supervisor) = supervisor {
            supervisor.shutdown().await;
        }

        let shared = &self.inner.shared;
        let link = shared.link.lock().await.take();
        shared.state.send_replace(ConnectionState::Disconnected);

        let Some(link) = link else {
            shared.events.emit(BusEvent::Stopped { was_connected: false });
            return Ok(false);
        };

        if link.publish_channel.is_open() {
            shared.events.debug("waiting for publisher confirms");
            if let Err(e) = link.publish_channel.wait_for_confirms().await {
                warn!("Waiting for publisher confirms failed: {}", e);
                shared.events.error(e.to_string());
            }
        }
        let closed = link.connection.close().await;
        shared.events.emit(BusEvent::Stopped { was_connected: true });
        closed.map(|_| true)
    }

    /// A new channel dedicated to one consumer.
    pub async fn get_consumer_channel(&self) -> Result<ChannelHandle> {
        let link = self.inner.shared.link.lock().await;
        let link = link.as_ref().ok_or(BusError::NotStarted("consumer"))?;
        link.connection.create_channel().await
    }

    /// The shared confirm channel all publishes go through. Reopened if the
    /// broker closed it.
    pub async fn get_publish_channel(&self) -> Result<ChannelHandle> {
        let mut link = self.inner.shared.link.lock().await;
        let link = link.as_mut().ok_or(BusError::NotStarted("publish"))?;
        if !link.publish_channel.is_open() {
            link.publish_channel = link.connection.create_confirm_channel().await?;
            self.emitter().debug("reopened publish channel");
        }
        Ok(link.publish_channel.clone())
    }
}
