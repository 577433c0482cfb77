use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BatteryState {
    Absent,
    Low,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReservoirState {
    Empty,
    Low,
    Full,
}

/// Snapshot of the pump's status block.
///
/// Replaced wholesale on every status read; never partially updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PumpStatus {
    pub running: bool,
    pub battery: BatteryState,
    pub reservoir: ReservoirState,
    /// Available insulin in whole IU.
    pub reservoir_units: u16,
}

/// The most recent bolus confirmed by the pump's own history.
///
/// `amount` is in 0.1 IU steps and is what the pump infused, which can
/// differ from what was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastBolus {
    pub amount: u32,
    pub at: DateTime<Utc>,
}
