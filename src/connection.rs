// src/connection.rs
//! Connection supervisor: owns the broker connection and the shared
//! publish channel, and reconnects on a fixed interval after failures.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::broker::{BrokerConnector, ChannelHandle, ConnectionEvent, ConnectionHandle};
use crate::config::BusConfig;
use crate::errors::{BusError, Result};
use crate::events::{BusEvent, EventEmitter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// A live connection together with its confirm-mode publish channel.
pub(crate) struct Link {
    pub connection: ConnectionHandle,
    pub publish_channel: ChannelHandle,
}

/// State shared between a [`Bus`](crate::Bus) handle and its supervisor task.
pub(crate) struct Shared {
    pub config: BusConfig,
    pub connector: Arc<dyn BrokerConnector>,
    pub events: EventEmitter,
    pub state: watch::Sender<ConnectionState>,
    pub link: Mutex<Option<Link>>,
}

impl Shared {
    pub fn new(config: BusConfig, connector: Arc<dyn BrokerConnector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Shared {
            config,
            connector,
            events: EventEmitter::new(),
            state,
            link: Mutex::new(None),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}

/// Handle on the single reconnect loop of a bus.
pub(crate) struct Supervisor {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Supervisor {
    pub fn spawn(shared: Arc<Shared>) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(supervise(shared, stop_rx));
        Supervisor { stop, handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stops the loop without waiting for it, for use from `Drop`.
    pub fn abort(self) {
        self.stop.send_replace(true);
        self.handle.abort();
    }

    pub async fn shutdown(self) {
        self.stop.send_replace(true);
        if let Err(e) = self.handle.await {
            warn!("Connection supervisor ended abnormally: {}", e);
        }
    }
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    // A dropped sender counts as a stop request too.
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn supervise(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    loop {
        shared.set_state(ConnectionState::Connecting);
        // Runs apart so an attempt abandoned by a stop can still be closed.
        let mut attempt = tokio::spawn(open(shared.clone()));
        let opened = tokio::select! {
            _ = stop_requested(&mut stop) => {
                tokio::spawn(close_abandoned(attempt));
                return;
            }
            joined = &mut attempt => joined.unwrap_or_else(|e| {
                Err(BusError::ConnectionError(format!("connection attempt failed: {}", e)))
            }),
        };

        match opened {
            Ok(Opened { link, mut connection_events }) => {
                install(&shared, link).await;
                let reason = tokio::select! {
                    _ = stop_requested(&mut stop) => return,
                    reason = watch_connection(&shared, &mut connection_events) => reason,
                };
                shared.link.lock().await.take();
                shared.set_state(ConnectionState::Disconnected);
                shared.events.error(format!("RabbitMQ connection error: {}", reason));
            }
            Err(e) => {
                shared.set_state(ConnectionState::Disconnected);
                shared.events.error(e.to_string());
            }
        }

        let interval = shared.config.restart_interval();
        shared
            .events
            .info(format!("reconnecting in {} seconds...", interval.as_secs_f64()));
        tokio::select! {
            _ = stop_requested(&mut stop) => return,
            _ = sleep(interval) => {}
        }
    }
}

/// A connection and its publish channel, not yet handed to the bus.
struct Opened {
    link: Link,
    connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

/// One connection attempt: connects and opens the confirm channel.
async fn open(shared: Arc<Shared>) -> Result<Opened> {
    let config = &shared.config;
    shared.events.info(format!(
        "connecting to RabbitMQ {}@{}{}",
        config.username,
        config.host,
        config.vhost_display()
    ));

    let connection = shared.connector.connect(&config.amqp_uri()).await?;
    let (sender, connection_events) = mpsc::unbounded_channel();
    connection.on_event(Box::new(move |event| {
        let _ = sender.send(event);
    }));

    let publish_channel = match connection.create_confirm_channel().await {
        Ok(channel) => channel,
        Err(e) => {
            if let Err(close_err) = connection.close().await {
                debug!("Closing half-open connection failed: {}", close_err);
            }
            return Err(e);
        }
    };

    Ok(Opened {
        link: Link {
            connection,
            publish_channel,
        },
        connection_events,
    })
}

async fn install(shared: &Shared, link: Link) {
    *shared.link.lock().await = Some(link);
    shared.set_state(ConnectionState::Connected);
    shared.events.emit(BusEvent::Started);
}

/// Closes whatever connection an attempt abandoned by a stop still produces.
async fn close_abandoned(attempt: JoinHandle<Result<Opened>>) {
    if let Ok(Ok(opened)) = attempt.await {
        debug!("Closing connection opened after stop");
        if let Err(e) = opened.link.connection.close().await {
            debug!("Closing abandoned connection failed: {}", e);
        }
    }
}

/// Waits until the connection fails, reporting backpressure on the way.
async fn watch_connection(
    shared: &Shared,
    connection_events: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
) -> String {
    while let Some(event) = connection_events.recv().await {
        match event {
            ConnectionEvent::Error(reason) => return reason,
            ConnectionEvent::Blocked(reason) => shared.events.error(format!("blocked {}", reason)),
            ConnectionEvent::Unblocked => shared.events.info("RabbitMQ Connection Unblocked"),
        }
    }
    "connection closed".to_string()
}
