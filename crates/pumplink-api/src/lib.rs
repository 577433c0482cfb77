// pumplink-api: Device-command channel contract for a paired insulin pump.
//
// Everything wire-level (radio link, packet encoding, menu navigation)
// lives behind `PumpDevice`/`PumpConnector`. This crate defines those
// seams, the pairing identity and the raw records that cross them.

pub mod device;
pub mod error;
pub mod pairing;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use device::{
    AlertKind, AlertScreen, HistoryRecord, HistoryRecordDetail, PumpConnector, PumpDevice,
    StatusReport,
};
pub use error::Error;
pub use pairing::{
    ADDRESS_LEN, CIPHER_KEY_LEN, CipherKey, DeviceAddress, PumpIdentity, ReplayCounterStore,
};
