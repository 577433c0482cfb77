// ── Domain model ──
//
// Canonical types consumed by the lifecycle manager, the CLI and any
// UI publisher. Raw channel records are converted into these in
// `crate::convert`.

pub mod history;
pub mod profile;
pub mod state;
pub mod status;

pub use history::{HistoryEvent, HistoryEventKind};
pub use profile::{BasalProfile, HOURS_PER_DAY, TherapyProfile, quantize_factor, quantize_rate};
pub use state::DriverState;
pub use status::{BatteryState, LastBolus, PumpStatus, ReservoirState};
