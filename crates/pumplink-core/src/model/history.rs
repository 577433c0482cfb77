use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A fact reported by the pump's history log.
///
/// Immutable once read. `counter` increases monotonically per pump and
/// is the idempotency key for the therapy record sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub counter: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: HistoryEventKind,
}

/// Amounts are in 0.1 IU steps, durations in minutes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEventKind {
    QuickBolusInfused {
        amount: u32,
    },
    StandardBolusInfused {
        amount: u32,
        manual: bool,
    },
    ExtendedBolusStarted {
        total_amount: u32,
        duration_minutes: u16,
    },
    ExtendedBolusEnded {
        total_amount: u32,
        duration_minutes: u16,
    },
}

impl HistoryEventKind {
    /// Amount infused as an immediate bolus, if this is one.
    pub fn bolus_amount(&self) -> Option<u32> {
        match self {
            Self::QuickBolusInfused { amount } | Self::StandardBolusInfused { amount, .. } => {
                Some(*amount)
            }
            Self::ExtendedBolusStarted { .. } | Self::ExtendedBolusEnded { .. } => None,
        }
    }
}
