// ── Session state store ──
//
// Always-current snapshots of what the UI and other consumers observe:
// driver state, pump status, last confirmed bolus, connection time and
// the last recorded command failure. Publishing never blocks.

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::debug;

use crate::error::CoreError;
use crate::model::{DriverState, LastBolus, PumpStatus};
use crate::stream::StateStream;

pub struct SessionStore {
    state: watch::Sender<DriverState>,
    status: watch::Sender<Option<PumpStatus>>,
    last_bolus: watch::Sender<Option<LastBolus>>,
    connected_at: watch::Sender<Option<DateTime<Utc>>>,
    last_failure: watch::Sender<Option<CoreError>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (state, _) = watch::channel(DriverState::NotInitialized);
        let (status, _) = watch::channel(None);
        let (last_bolus, _) = watch::channel(None);
        let (connected_at, _) = watch::channel(None);
        let (last_failure, _) = watch::channel(None);

        Self {
            state,
            status,
            last_bolus,
            connected_at,
            last_failure,
        }
    }

    // ── Driver state ─────────────────────────────────────────────

    pub fn state(&self) -> DriverState {
        *self.state.borrow()
    }

    /// Move `from` → `to` only if the current state is still `from`.
    ///
    /// Returns whether the transition happened.
    pub fn transition(&self, from: DriverState, to: DriverState) -> bool {
        if from == to {
            return self.state() == from;
        }
        let applied = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if applied {
            debug!(%from, %to, "driver state transition");
        }
        applied
    }

    /// Unconditionally set the state, returning the previous one.
    pub fn force_state(&self, to: DriverState) -> DriverState {
        let previous = self.state.send_replace(to);
        if previous != to {
            debug!(from = %previous, %to, "driver state forced");
        }
        previous
    }

    pub fn subscribe_state(&self) -> StateStream<DriverState> {
        StateStream::new(self.state.subscribe())
    }

    // ── Pump status ──────────────────────────────────────────────

    pub fn status(&self) -> Option<PumpStatus> {
        *self.status.borrow()
    }

    pub fn set_status(&self, status: Option<PumpStatus>) {
        self.status.send_replace(status);
    }

    pub fn subscribe_status(&self) -> StateStream<Option<PumpStatus>> {
        StateStream::new(self.status.subscribe())
    }

    // ── Last bolus ───────────────────────────────────────────────

    pub fn last_bolus(&self) -> Option<LastBolus> {
        *self.last_bolus.borrow()
    }

    /// Replace the last bolus unless the stored one is newer.
    pub fn update_last_bolus(&self, bolus: LastBolus) {
        self.last_bolus.send_if_modified(|current| match current {
            Some(existing) if existing.at > bolus.at => false,
            _ => {
                let changed = *current != Some(bolus);
                *current = Some(bolus);
                changed
            }
        });
    }

    pub fn subscribe_last_bolus(&self) -> StateStream<Option<LastBolus>> {
        StateStream::new(self.last_bolus.subscribe())
    }

    // ── Connection timestamp ─────────────────────────────────────

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        *self.connected_at.borrow()
    }

    pub fn set_connected_at(&self, at: Option<DateTime<Utc>>) {
        self.connected_at.send_replace(at);
    }

    pub fn subscribe_connected_at(&self) -> StateStream<Option<DateTime<Utc>>> {
        StateStream::new(self.connected_at.subscribe())
    }

    // ── Failures ─────────────────────────────────────────────────

    pub fn last_failure(&self) -> Option<CoreError> {
        self.last_failure.borrow().clone()
    }

    pub fn record_failure(&self, error: CoreError) {
        self.last_failure.send_replace(Some(error));
    }

    pub fn subscribe_last_failure(&self) -> StateStream<Option<CoreError>> {
        StateStream::new(self.last_failure.subscribe())
    }

    /// Forget everything tied to the previously paired pump.
    pub fn reset_reconciliation(&self) {
        self.status.send_replace(None);
        self.last_bolus.send_replace(None);
        self.last_failure.send_replace(None);
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn transition_is_compare_and_set() {
        let store = SessionStore::new();
        assert!(store.transition(DriverState::NotInitialized, DriverState::Disconnected));
        assert!(!store.transition(DriverState::Connecting, DriverState::Ready));
        assert_eq!(store.state(), DriverState::Disconnected);
    }

    #[test]
    fn force_state_returns_previous() {
        let store = SessionStore::new();
        store.force_state(DriverState::Ready);
        assert_eq!(
            store.force_state(DriverState::Disconnected),
            DriverState::Ready
        );
    }

    #[test]
    fn older_bolus_does_not_replace_newer() {
        let store = SessionStore::new();
        let now = Utc::now();
        store.update_last_bolus(LastBolus { amount: 20, at: now });
        store.update_last_bolus(LastBolus {
            amount: 50,
            at: now - Duration::minutes(5),
        });
        assert_eq!(store.last_bolus().map(|b| b.amount), Some(20));
    }

    #[tokio::test]
    async fn subscribers_see_state_changes() {
        let store = SessionStore::new();
        let mut stream = store.subscribe_state();
        assert_eq!(*stream.current(), DriverState::NotInitialized);

        store.transition(DriverState::NotInitialized, DriverState::Disconnected);
        assert_eq!(stream.changed().await, Some(DriverState::Disconnected));
        assert_eq!(stream.latest(), DriverState::Disconnected);
    }
}
