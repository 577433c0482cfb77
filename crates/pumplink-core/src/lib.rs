//! Session management for a single paired insulin pump.
//!
//! This crate sits between a `pumplink-api` device channel and whatever
//! consumes pump state (CLI, UI, therapy loop):
//!
//! - **[`Controller`]**: lifecycle facade. [`connect()`](Controller::connect)
//!   opens the device, runs connect-time verification (clock, history,
//!   basal profile) and settles in `Ready` or `Suspended`.
//!   [`disconnect()`](Controller::disconnect) defers while an operation is
//!   running unless forced.
//!
//! - **[`SessionStore`]**: `tokio::sync::watch` snapshots of driver state,
//!   pump status, last bolus and connection time, vended as
//!   [`StateStream<T>`].
//!
//! - **[`Command`]**: every therapy-affecting operation. Commands run one
//!   at a time inside the command wrapper, which captures pump alerts and
//!   re-verifies the pump after an implicit reconnect.
//!
//! - **[`classify()`]**: pure reconciliation of a history delta against
//!   the bolus this driver expected to see.
//!
//! - **[`IdentityStore`]**: durable pairing credentials and the replay
//!   counter the transport layer depends on.

pub mod bolus;
pub mod classify;
pub mod clock;
pub mod command;
pub mod config;
pub mod controller;
pub mod convert;
pub mod error;
mod executor;
pub mod identity;
pub mod model;
mod session;
pub mod sink;
pub mod store;
pub mod stream;
pub mod verify;

// ── Primary re-exports ──────────────────────────────────────────────
pub use bolus::{BolusHandle, BolusOutcome, BolusRequest, BolusResult, Enactment};
pub use classify::{
    BolusKind, BolusTag, ExpectedBolus, ExtendedPhase, HistoryDelta, SyncAction, Verdict, classify,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{Command, CommandResult, ProfileWriteOutcome, ProfileWriteResult};
pub use config::SessionConfig;
pub use controller::{Collaborators, Controller, DisconnectOutcome};
pub use error::CoreError;
pub use identity::{FileIdentityStore, IdentityStore, MemoryIdentityStore};
pub use sink::{
    BroadcastNotifier, MemoryRecordSink, Notification, NotificationSink, TherapyRecordSink,
};
pub use store::SessionStore;
pub use stream::StateStream;
pub use verify::{ClockCheck, ProfileCheck, VerificationReport};

// Re-export model types at the crate root for ergonomics.
pub use model::{
    BasalProfile, BatteryState, DriverState, HistoryEvent, HistoryEventKind, LastBolus,
    PumpStatus, ReservoirState, TherapyProfile,
};
