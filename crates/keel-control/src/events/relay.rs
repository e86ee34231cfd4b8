use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use keel_common::Event;
use keel_meta::KvStore;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::EventBus;

const EVENTS_PREFIX: &str = "/events/";
const RELAY_TTL_MS: u64 = 60_000;
const RELAY_BACKLOG: usize = 256;

#[derive(Debug, Serialize, Deserialize)]
struct RelayedEvent {
    origin: String,
    event: Event,
}

/// Mirrors events between processes through the shared store, so job
/// transitions made by a worker reach subscribers connected to the server.
pub struct EventRelay {
    origin: String,
    kv: Arc<dyn KvStore>,
}

impl EventRelay {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            origin: uuid::Uuid::new_v4().to_string(),
            kv,
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Attach to `bus` and run until `shutdown` fires.
    pub fn start(self, bus: &EventBus, shutdown: CancellationToken) -> JoinHandle<()> {
        let (tx, rx) = mpsc::channel(RELAY_BACKLOG);
        if !bus.attach_relay(tx) {
            warn!("event bus already has a relay attached");
        }
        let this = Arc::new(self);
        let bus = bus.clone();
        tokio::spawn(async move {
            tokio::join!(
                this.clone().outbound(rx, shutdown.clone()),
                this.inbound(bus, shutdown)
            );
        })
    }

    async fn outbound(self: Arc<Self>, mut rx: mpsc::Receiver<Event>, shutdown: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return,
                ev = rx.recv() => match ev {
                    Some(ev) => ev,
                    None => return,
                },
            };
            let key = format!("{EVENTS_PREFIX}{}", uuid::Uuid::new_v4());
            let record = RelayedEvent {
                origin: self.origin.clone(),
                event,
            };
            let value = match serde_json::to_vec(&record) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "failed to encode relayed event");
                    continue;
                }
            };
            if let Err(e) = self.kv.put(&key, value, Some(RELAY_TTL_MS)).await {
                warn!(error = %e, "failed to mirror event to store");
            }
        }
    }

    async fn inbound(self: Arc<Self>, bus: EventBus, shutdown: CancellationToken) {
        let mut last_revision = None;
        loop {
            let mut stream = match self.kv.watch_prefix(EVENTS_PREFIX, last_revision).await {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "failed to watch relayed events, retrying in 5s");
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    }
                    continue;
                }
            };
            info!(origin = %self.origin, "event relay watching {}", EVENTS_PREFIX);

            loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    next = stream.next() => next,
                };
                let Some(change) = next else { break };
                last_revision = Some(change.revision);
                let Some(value) = change.value else { continue };
                match serde_json::from_slice::<RelayedEvent>(&value) {
                    Ok(record) if record.origin != self.origin => {
                        bus.deliver_local(&record.event);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(key = %change.key, error = %e, "undecodable relayed event"),
                }
            }

            warn!("event relay watch ended, reconnecting...");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}
