use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::CaptureRecord;

const CHANNEL_CAPACITY: usize = 64;

/// Cross-context notification. Serialized as `{type, data}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum Event {
    NewIntruder(CaptureRecord),
    FailedAttempt { username: String, count: u32 },
    StorageChanged { key: String },
}

/// Best-effort broadcast between contexts. Delivery only reaches receivers
/// that are subscribed at send time; nothing is acknowledged.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    dashboards: Arc<AtomicUsize>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            dashboards: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish to whoever is listening. Returns how many receivers got it.
    pub fn publish(&self, event: Event) -> usize {
        match self.tx.send(event) {
            Ok(n) => n,
            Err(_) => {
                debug!("event dropped, no open contexts");
                0
            }
        }
    }

    /// Register a dashboard context. The registration lasts as long as the
    /// returned guard.
    pub fn register_dashboard(&self) -> DashboardPresence {
        self.dashboards.fetch_add(1, Ordering::SeqCst);
        DashboardPresence {
            dashboards: self.dashboards.clone(),
        }
    }

    pub fn dashboard_open(&self) -> bool {
        self.dashboards.load(Ordering::SeqCst) > 0
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct DashboardPresence {
    dashboards: Arc<AtomicUsize>,
}

impl Drop for DashboardPresence {
    fn drop(&mut self) {
        self.dashboards.fetch_sub(1, Ordering::SeqCst);
    }
}
