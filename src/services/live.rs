//! Live fan-out of completed vehicle records.
//!
//! The aggregation engine hands records to a bounded queue without waiting;
//! a fan-out task serialises each record once and broadcasts the JSON to
//! every subscriber. Subscribers are only admitted once the system is ready.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::models::vehicle::VehicleRecord;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// Longest a subscriber connection is held waiting for readiness.
pub const READINESS_CEILING: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct LiveFeed {
    events: broadcast::Sender<Arc<str>>,
    queue: mpsc::Sender<VehicleRecord>,
}

impl LiveFeed {
    /// Create the feed and spawn its fan-out task on the current runtime.
    pub fn spawn(queue_capacity: usize, broadcast_capacity: usize) -> (Self, JoinHandle<()>) {
        let (queue, rx) = mpsc::channel(queue_capacity);
        let (events, _) = broadcast::channel(broadcast_capacity);
        let handle = tokio::spawn(fan_out(rx, events.clone()));
        (Self { events, queue }, handle)
    }

    pub fn publisher(&self) -> LiveFeedPublisher {
        LiveFeedPublisher {
            queue: self.queue.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.events.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }
}

async fn fan_out(mut rx: mpsc::Receiver<VehicleRecord>, events: broadcast::Sender<Arc<str>>) {
    while let Some(record) = rx.recv().await {
        match serde_json::to_string(&record) {
            Ok(json) => {
                // No subscribers is not an error.
                let delivered = events.send(Arc::from(json)).unwrap_or(0);
                tracing::debug!(vehicle_id = %record.vehicle_id, delivered, "Broadcast vehicle update");
            }
            Err(e) => {
                tracing::error!(vehicle_id = %record.vehicle_id, error = %e, "Failed to serialize vehicle update");
            }
        }
    }
    tracing::debug!("Live feed queue closed");
}

/// Engine-side handle. Publishing never waits on subscribers.
#[derive(Clone)]
pub struct LiveFeedPublisher {
    queue: mpsc::Sender<VehicleRecord>,
}

impl LiveFeedPublisher {
    pub fn publish(&self, record: VehicleRecord) -> Result<(), LiveFeedError> {
        self.queue.try_send(record).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => LiveFeedError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => LiveFeedError::Closed,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LiveFeedError {
    #[error("Live update queue is full")]
    QueueFull,

    #[error("Live update fan-out has stopped")]
    Closed,
}

/// Process-wide "system ready" flag set by the orchestrator handshake.
#[derive(Clone)]
pub struct SystemReadiness {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for SystemReadiness {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemReadiness {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Mark ready. Returns `true` only for the call that flipped the flag.
    pub fn mark_ready(&self) -> bool {
        self.tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until ready or until `ceiling` elapses; returns readiness.
    pub async fn wait_ready(&self, ceiling: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        // Bound first so the borrowed value is released before `rx`.
        #[allow(clippy::let_and_return)]
        let ready = matches!(
            tokio::time::timeout(ceiling, rx.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        );
        ready
    }
}
