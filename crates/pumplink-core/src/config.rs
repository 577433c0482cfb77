// ── Runtime session configuration ──
//
// Tuning for one pump session. Never touches disk: pumplink-config (or
// an embedding application) builds a `SessionConfig` and hands it in.

use std::time::Duration;

/// Divergence between pump clock and UTC at which the clock is rewritten.
pub const DEFAULT_CLOCK_DRIFT_THRESHOLD: Duration = Duration::from_secs(60);

/// Clock writes attempted before the connection is given up.
pub const DEFAULT_CLOCK_SYNC_ATTEMPTS: u32 = 3;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Drift at or above this triggers a clock write.
    pub clock_drift_threshold: Duration,
    /// Number of write-and-verify rounds before `ClockSyncFailed`.
    pub clock_sync_attempts: u32,
    /// Upper bound for opening the link and completing the handshake.
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            clock_drift_threshold: DEFAULT_CLOCK_DRIFT_THRESHOLD,
            clock_sync_attempts: DEFAULT_CLOCK_SYNC_ATTEMPTS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}
