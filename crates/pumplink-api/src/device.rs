// ── Device-command channel ──
//
// The opaque channel through which every exchange with the pump passes.
// Wire-level encoding, the radio transport and the pump's menu
// navigation live behind these traits; callers only see typed
// operations and raw records.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::pairing::{PumpIdentity, ReplayCounterStore};

// ── Alerts ───────────────────────────────────────────────────────

/// Severity of a screen the pump raised on its own display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertKind {
    Warning,
    Error,
}

/// A warning (`W`) or error (`E`) screen captured while executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlertScreen {
    pub kind: AlertKind,
    pub code: u8,
}

impl fmt::Display for AlertScreen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.kind {
            AlertKind::Warning => 'W',
            AlertKind::Error => 'E',
        };
        write!(f, "{prefix}{}", self.code)
    }
}

// ── Raw records ──────────────────────────────────────────────────

/// Status block as read from the pump.
///
/// Battery and reservoir levels are the pump's own codes:
/// `0` = empty / absent, `1` = low, `2` = full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub running: bool,
    pub battery_code: u8,
    pub reservoir_code: u8,
    /// Insulin left in the reservoir, in whole IU.
    pub reservoir_units: u16,
}

/// One entry of the pump's history log.
///
/// The pump keeps a delta checkpoint: each
/// [`fetch_history_delta`](PumpDevice::fetch_history_delta) returns the
/// entries recorded since the previous successful fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Monotonically increasing per-pump counter.
    pub event_counter: u64,
    /// Pump-local wall clock. The pump clock is kept on UTC.
    pub timestamp: NaiveDateTime,
    pub detail: HistoryRecordDetail,
}

/// Payload of a history entry. Amounts are in 0.1 IU steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryRecordDetail {
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
    /// Any entry kind the channel does not decode (requests, TBR markers, ...).
    Other {
        code: u16,
    },
}

// ── Traits ───────────────────────────────────────────────────────

/// A live, exclusively-owned session with one pump.
///
/// Implementations transparently re-establish a dropped link when they
/// can; every such implicit reconnect must bump
/// [`reconnect_count`](Self::reconnect_count) so callers can re-verify
/// the device afterwards.
#[async_trait]
pub trait PumpDevice: Send + Sync {
    /// Establish the link and run the authenticated handshake.
    async fn connect(&self) -> Result<(), Error>;

    /// Close the link. Never fails; a dead link is already closed.
    async fn disconnect(&self);

    /// Number of implicit reconnects performed since the session opened.
    fn reconnect_count(&self) -> u64;

    async fn read_status(&self) -> Result<StatusReport, Error>;

    async fn read_time(&self) -> Result<NaiveDateTime, Error>;

    async fn write_time(&self, time: NaiveDateTime) -> Result<(), Error>;

    /// Entries recorded since the last successful fetch, oldest first.
    async fn fetch_history_delta(&self) -> Result<Vec<HistoryRecord>, Error>;

    /// Basal factor the pump is delivering right now, in milli-IU per hour.
    async fn read_current_basal_factor(&self) -> Result<u32, Error>;

    /// Replace the whole hourly basal profile (milli-IU per hour, one per hour).
    async fn write_basal_profile(&self, factors: &[u32]) -> Result<(), Error>;

    /// Command a standard bolus of `amount` (0.1 IU steps).
    ///
    /// Returns the history event counter the pump will use for it once the
    /// pump has accepted the command.
    async fn start_bolus(&self, amount: u32) -> Result<u64, Error>;

    /// Wait for a started bolus to finish.
    ///
    /// When `cancel` fires the channel must stop the infusion on the pump
    /// and return [`Error::Cancelled`]; a partial amount may already have
    /// been delivered.
    async fn wait_bolus(&self, event_counter: u64, cancel: &CancellationToken) -> Result<(), Error>;
}

/// Opens device sessions from a stored pairing identity.
#[async_trait]
pub trait PumpConnector: Send + Sync {
    /// Acquire the device handle for `identity`.
    ///
    /// The returned device persists its replay counter through `counter`
    /// after every security-sensitive exchange.
    async fn open(
        &self,
        identity: &PumpIdentity,
        counter: Arc<dyn ReplayCounterStore>,
    ) -> Result<Arc<dyn PumpDevice>, Error>;
}
