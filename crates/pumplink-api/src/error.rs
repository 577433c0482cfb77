use thiserror::Error;

use crate::device::AlertScreen;

/// Top-level error type for the `pumplink-api` crate.
///
/// Covers every failure mode of the device-command channel: link and
/// handshake problems, device-reported alerts, cancellation, and the
/// replay-counter persistence contract. `pumplink-core` maps these into
/// domain-level errors.
#[derive(Debug, Clone, Error)]
pub enum Error {
    // ── Link ────────────────────────────────────────────────────────
    /// The link could not be established or the handshake was rejected.
    #[error("Connection to pump failed: {reason}")]
    ConnectionFailed { reason: String },

    /// The link dropped and could not be re-established transparently.
    #[error("Link to pump lost")]
    LinkLost,

    /// An exchange did not complete in time.
    #[error("Pump did not respond within {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    // ── Device ──────────────────────────────────────────────────────
    /// The pump showed a warning or error screen while executing.
    #[error("Pump reported alert {0}")]
    Alert(AlertScreen),

    /// The pump answered with something the channel could not interpret.
    #[error("Unexpected pump response: {message}")]
    UnexpectedResponse { message: String },

    // ── Control ─────────────────────────────────────────────────────
    /// The operation was cancelled by its caller.
    #[error("Operation cancelled")]
    Cancelled,

    // ── Pairing ─────────────────────────────────────────────────────
    /// A device address could not be parsed.
    #[error("Invalid device address: {0}")]
    InvalidAddress(String),

    /// The replay counter could not be durably persisted.
    #[error("Replay counter persistence failed: {message}")]
    CounterStore { message: String },

    /// A replay counter write would have moved the counter backwards.
    #[error("Replay counter regression: stored {current}, attempted {attempted}")]
    CounterRegression { current: u64, attempted: u64 },
}

impl Error {
    /// Whether this error represents a caller-initiated cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
