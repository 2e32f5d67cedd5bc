use std::sync::Arc;
use std::time::Duration;

use rabbit_bus::{Bus, BusConfig, BusEvent, MemoryBroker};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::EnvFilter;

pub const WAIT: Duration = Duration::from_secs(2);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> BusConfig {
    BusConfig::new("localhost")
        .with_restart_interval(Duration::from_millis(20))
        .with_rpc_timeout(WAIT)
        .with_client_prefix("bus-test-node-1-")
}

pub fn memory_bus(broker: &MemoryBroker) -> Bus {
    init_tracing();
    Bus::with_connector(test_config(), Arc::new(broker.clone())).expect("valid config")
}

pub async fn started_bus(broker: &MemoryBroker) -> Bus {
    let bus = memory_bus(broker);
    bus.start();
    tokio::time::timeout(WAIT, bus.wait_until_connected())
        .await
        .expect("bus did not connect")
        .expect("state channel closed");
    bus
}

/// Polls `condition` until it holds, failing the test after [`WAIT`].
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let polled = tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {}", what);
}

pub async fn wait_for_event(
    events: &mut broadcast::Receiver<BusEvent>,
    wanted: impl Fn(&BusEvent) -> bool,
) -> BusEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("expected event was not emitted")
}
