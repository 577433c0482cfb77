// ── Pump identity store ──
//
// Durable single-record storage for the pairing identity and the
// replay-protection counter. At most one pump is paired at a time.

mod file;
mod memory;

use pumplink_api::{DeviceAddress, PumpIdentity, ReplayCounterStore};

use crate::error::CoreError;

pub use file::FileIdentityStore;
pub use memory::MemoryIdentityStore;

/// Storage for the one paired pump.
///
/// The [`ReplayCounterStore`] half is handed to the device channel;
/// `set_replay_counter` must be durable before it returns and must
/// refuse to move the counter backwards. Creating or deleting the
/// identity is only safe while the driver is disconnected.
pub trait IdentityStore: ReplayCounterStore {
    /// Atomically replace any stored identity with `identity`, resetting
    /// the replay counter to zero.
    fn create_identity(&self, identity: &PumpIdentity) -> Result<(), CoreError>;

    /// Atomically remove the stored identity. Returns whether one existed.
    fn delete_identity(&self) -> Result<bool, CoreError>;

    /// Load the stored identity.
    ///
    /// Fails with [`CoreError::IdentityCorruption`] when some fields are
    /// missing or malformed.
    fn load_identity(&self) -> Result<Option<PumpIdentity>, CoreError>;

    /// Addresses of stored identities: none or exactly one.
    fn list_identities(&self) -> Result<Vec<DeviceAddress>, CoreError> {
        Ok(self
            .load_identity()?
            .map(|identity| identity.address)
            .into_iter()
            .collect())
    }
}
