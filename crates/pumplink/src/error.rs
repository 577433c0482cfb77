//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text and stable exit codes.

use miette::Diagnostic;
use thiserror::Error;

use pumplink_config::ConfigError;
use pumplink_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const NOT_PAIRED: i32 = 3;
    pub const CORRUPT: i32 = 4;
    pub const CONFLICT: i32 = 6;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Pairing ──────────────────────────────────────────────────────
    #[error("No pump is paired")]
    #[diagnostic(
        code(pumplink::not_paired),
        help(
            "Pair a pump with the driver first.\n\
             Pairing record expected at: {path}"
        )
    )]
    NotPaired { path: String },

    #[error("Pairing record is corrupt: {reason}")]
    #[diagnostic(
        code(pumplink::identity_corrupt),
        help(
            "The record at {path} cannot be used. Remove it with:\n\
             pumplink identity unpair --yes\n\
             then pair the pump again."
        )
    )]
    IdentityCorrupt { path: String, reason: String },

    // ── Pump ─────────────────────────────────────────────────────────
    #[error("Could not reach the pump: {reason}")]
    #[diagnostic(
        code(pumplink::connection_failed),
        help("Check that the pump is in range and not connected to another device.")
    )]
    ConnectionFailed { reason: String },

    #[error("Pump did not respond within {seconds}s")]
    #[diagnostic(
        code(pumplink::timeout),
        help("Increase session.connect_timeout_secs or move closer to the pump.")
    )]
    Timeout { seconds: u64 },

    #[error("Pump error: {message}")]
    #[diagnostic(code(pumplink::pump))]
    Pump { message: String },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(pumplink::validation))]
    Validation { field: String, reason: String },

    #[error("{path} already exists")]
    #[diagnostic(
        code(pumplink::conflict),
        help("Use --force to overwrite it.")
    )]
    AlreadyExists { path: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error(transparent)]
    #[diagnostic(
        code(pumplink::config),
        help("Check the config file (pumplink config path) and PUMPLINK_* variables.")
    )]
    Config(#[from] ConfigError),

    // ── Interactive ──────────────────────────────────────────────────
    #[error("Destructive operation '{action}' requires confirmation")]
    #[diagnostic(
        code(pumplink::confirmation_required),
        help("Use --yes (-y) to confirm in non-interactive contexts.")
    )]
    NonInteractiveRequiresYes { action: String },

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    #[diagnostic(code(pumplink::json), help("Check the JSON file contents and try again."))]
    Json(#[from] serde_json::Error),

    #[error("Failed to render TOML: {0}")]
    #[diagnostic(code(pumplink::toml))]
    Toml(#[from] toml::ser::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NotPaired { .. } => exit_code::NOT_PAIRED,
            Self::IdentityCorrupt { .. } => exit_code::CORRUPT,
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::AlreadyExists { .. } => exit_code::CONFLICT,
            Self::Validation { .. } | Self::NonInteractiveRequiresYes { .. } => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }

    /// Attach the record location to pairing errors coming from the core.
    pub fn from_identity_error(err: CoreError, path: &std::path::Path) -> Self {
        let path = path.display().to_string();
        match err {
            CoreError::NotPaired => Self::NotPaired { path },
            CoreError::IdentityCorruption { message } => Self::IdentityCorrupt {
                path,
                reason: message,
            },
            other => other.into(),
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ConnectionFailed { reason } => CliError::ConnectionFailed { reason },

            CoreError::Timeout { timeout_secs } => CliError::Timeout {
                seconds: timeout_secs,
            },

            CoreError::NotPaired => CliError::NotPaired {
                path: "(unknown)".into(),
            },

            CoreError::IdentityCorruption { message } => CliError::IdentityCorrupt {
                path: "(unknown)".into(),
                reason: message,
            },

            CoreError::Validation { message } => CliError::Validation {
                field: "input".into(),
                reason: message,
            },

            CoreError::Storage { message } | CoreError::ReplayCounter { message } => {
                CliError::Io(std::io::Error::other(message))
            }

            other @ (CoreError::DeviceAlert { .. }
            | CoreError::ClockSyncFailed { .. }
            | CoreError::UnexpectedResponse { .. }
            | CoreError::Cancelled
            | CoreError::NotInitialized
            | CoreError::InvalidState { .. }
            | CoreError::Internal(_)) => CliError::Pump {
                message: other.to_string(),
            },
        }
    }
}
