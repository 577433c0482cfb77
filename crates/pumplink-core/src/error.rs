// ── Core error types ──
//
// User-facing errors from pumplink-core. Consumers never see raw
// channel errors directly: the `From<pumplink_api::Error>` impl
// translates them into domain-appropriate variants.

use thiserror::Error;

use pumplink_api::AlertScreen;

use crate::model::DriverState;

/// Unified error type for the core crate.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to pump: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Pump did not respond within {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    // ── Device errors ────────────────────────────────────────────────
    #[error("Pump reported alert {alert}")]
    DeviceAlert { alert: AlertScreen },

    #[error("Could not synchronize pump clock after {attempts} attempts (still {drift_secs}s off)")]
    ClockSyncFailed { attempts: u32, drift_secs: i64 },

    #[error("Unexpected pump response: {message}")]
    UnexpectedResponse { message: String },

    // ── Control flow ─────────────────────────────────────────────────
    #[error("Operation cancelled")]
    Cancelled,

    // ── Identity errors ──────────────────────────────────────────────
    #[error("No pump is paired")]
    NotPaired,

    #[error("Stored pump identity is corrupt: {message}")]
    IdentityCorruption { message: String },

    #[error("Replay counter could not be persisted: {message}")]
    ReplayCounter { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    // ── State errors ─────────────────────────────────────────────────
    #[error("Pump driver is not initialized")]
    NotInitialized,

    #[error("Operation not allowed while the driver is {state}")]
    InvalidState { state: DriverState },

    #[error("Validation failed: {message}")]
    Validation { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Cancellation is a control signal, not a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether the error came from the link itself (and a later retry may succeed).
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::ConnectionFailed { .. } | Self::Timeout { .. })
    }
}

// ── Conversion from channel errors ───────────────────────────────────

impl From<pumplink_api::Error> for CoreError {
    fn from(err: pumplink_api::Error) -> Self {
        match err {
            pumplink_api::Error::ConnectionFailed { reason } => CoreError::ConnectionFailed { reason },
            pumplink_api::Error::LinkLost => CoreError::ConnectionFailed {
                reason: "link lost".into(),
            },
            pumplink_api::Error::Timeout { timeout_secs } => CoreError::Timeout { timeout_secs },
            pumplink_api::Error::Alert(alert) => CoreError::DeviceAlert { alert },
            pumplink_api::Error::UnexpectedResponse { message } => {
                CoreError::UnexpectedResponse { message }
            }
            pumplink_api::Error::Cancelled => CoreError::Cancelled,
            pumplink_api::Error::InvalidAddress(address) => CoreError::IdentityCorruption {
                message: format!("invalid device address {address}"),
            },
            pumplink_api::Error::CounterStore { message } => CoreError::ReplayCounter { message },
            err @ pumplink_api::Error::CounterRegression { .. } => CoreError::ReplayCounter {
                message: err.to_string(),
            },
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Storage {
            message: err.to_string(),
        }
    }
}
