// ── External collaborators ──
//
// Where synced therapy events and user-facing notifications go. The
// core only depends on these traits; the in-memory implementations
// serve tests and simple embeddings.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use pumplink_api::AlertScreen;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::classify::SyncAction;
use crate::error::CoreError;
use crate::model::DriverState;

const NOTIFICATION_CHANNEL_SIZE: usize = 64;

// ── Therapy records ──────────────────────────────────────────────

/// Receives synced pump events for the therapy database.
///
/// Must be idempotent by [`SyncAction::counter`]: recording the same
/// counter twice must not double-count.
#[async_trait]
pub trait TherapyRecordSink: Send + Sync {
    async fn record(&self, action: &SyncAction) -> Result<(), CoreError>;
}

/// Keeps synced actions in memory, first write per counter wins.
#[derive(Debug, Default)]
pub struct MemoryRecordSink {
    records: DashMap<u64, SyncAction>,
    duplicates: AtomicUsize,
}

impl MemoryRecordSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded actions, ordered by counter.
    pub fn records(&self) -> Vec<SyncAction> {
        let mut records: Vec<SyncAction> =
            self.records.iter().map(|entry| entry.value().clone()).collect();
        records.sort_by_key(SyncAction::counter);
        records
    }

    pub fn get(&self, counter: u64) -> Option<SyncAction> {
        self.records.get(&counter).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of `record` calls that were dropped as repeats.
    pub fn duplicate_count(&self) -> usize {
        self.duplicates.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TherapyRecordSink for MemoryRecordSink {
    async fn record(&self, action: &SyncAction) -> Result<(), CoreError> {
        let counter = action.counter();
        match self.records.entry(counter) {
            Entry::Occupied(_) => {
                self.duplicates.fetch_add(1, Ordering::Relaxed);
                debug!(counter, "therapy event already recorded");
            }
            Entry::Vacant(slot) => {
                slot.insert(action.clone());
            }
        }
        Ok(())
    }
}

// ── Notifications ────────────────────────────────────────────────

/// User-facing events raised by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// The pump showed a warning or error screen.
    DeviceAlert { alert: AlertScreen },
    ConnectionStatusChanged { state: DriverState },
    /// History contained activity this driver did not initiate.
    UnaccountedActivity { counters: Vec<u64> },
    ClockAdjusted { drift_secs: i64 },
    BasalProfileWritten,
    /// The stored pairing was unreadable and has been removed.
    IdentityCorrupted { reason: String },
}

/// Fire-and-forget notification delivery. Must never block.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Fans notifications out over a broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Arc<Notification>>,
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFICATION_CHANNEL_SIZE);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Notification>> {
        self.tx.subscribe()
    }
}

impl NotificationSink for BroadcastNotifier {
    fn notify(&self, notification: Notification) {
        // No receivers is fine.
        let _ = self.tx.send(Arc::new(notification));
    }
}
