use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use pumplink_api::{PumpIdentity, ReplayCounterStore};

use super::IdentityStore;
use crate::error::CoreError;

/// Non-durable identity store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    record: Mutex<Option<(PumpIdentity, u64)>>,
    corrupt: AtomicBool,
    fail_counter_writes: AtomicBool,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `identity` with counter `counter`.
    pub fn with_identity(identity: PumpIdentity, counter: u64) -> Self {
        Self {
            record: Mutex::new(Some((identity, counter))),
            ..Self::default()
        }
    }

    /// Make `load_identity` report corruption until the record is deleted.
    pub fn corrupt(&self) {
        self.corrupt.store(true, Ordering::SeqCst);
    }

    /// Make every `set_replay_counter` fail.
    pub fn fail_counter_writes(&self, fail: bool) {
        self.fail_counter_writes.store(fail, Ordering::SeqCst);
    }

    fn record(&self) -> MutexGuard<'_, Option<(PumpIdentity, u64)>> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ReplayCounterStore for MemoryIdentityStore {
    fn replay_counter(&self) -> Result<u64, pumplink_api::Error> {
        self.record()
            .as_ref()
            .map(|(_, counter)| *counter)
            .ok_or_else(|| pumplink_api::Error::CounterStore {
                message: "no pump identity stored".into(),
            })
    }

    fn set_replay_counter(&self, value: u64) -> Result<(), pumplink_api::Error> {
        if self.fail_counter_writes.load(Ordering::SeqCst) {
            return Err(pumplink_api::Error::CounterStore {
                message: "replay counter write failed".into(),
            });
        }
        let mut record = self.record();
        let Some((_, counter)) = record.as_mut() else {
            return Err(pumplink_api::Error::CounterStore {
                message: "no pump identity stored".into(),
            });
        };
        if value < *counter {
            return Err(pumplink_api::Error::CounterRegression {
                current: *counter,
                attempted: value,
            });
        }
        *counter = value;
        Ok(())
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn create_identity(&self, identity: &PumpIdentity) -> Result<(), CoreError> {
        *self.record() = Some((identity.clone(), 0));
        self.corrupt.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn delete_identity(&self) -> Result<bool, CoreError> {
        self.corrupt.store(false, Ordering::SeqCst);
        Ok(self.record().take().is_some())
    }

    fn load_identity(&self) -> Result<Option<PumpIdentity>, CoreError> {
        if self.corrupt.load(Ordering::SeqCst) {
            return Err(CoreError::IdentityCorruption {
                message: "stored identity fields are inconsistent".into(),
            });
        }
        Ok(self.record().as_ref().map(|(identity, _)| identity.clone()))
    }
}
