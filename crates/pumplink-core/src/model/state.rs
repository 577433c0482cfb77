use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Lifecycle state of the single pump driver.
///
/// ```text
/// NotInitialized ─start→ Disconnected ─connect→ Connecting
///   → CheckingDevice → Ready | Suspended ⇄ ExecutingCommand
///   → Disconnected ─shutdown→ NotInitialized
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DriverState {
    NotInitialized,
    Disconnected,
    Connecting,
    CheckingDevice,
    Ready,
    Suspended,
    ExecutingCommand,
}

impl DriverState {
    /// A session exists or is being established.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::NotInitialized | Self::Disconnected)
    }

    /// Idle and able to accept a command.
    pub fn accepts_commands(self) -> bool {
        matches!(self, Self::Ready | Self::Suspended)
    }

    /// The link is up and verified (idle or mid-command).
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Ready | Self::Suspended | Self::ExecutingCommand)
    }
}
