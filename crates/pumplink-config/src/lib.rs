//! Shared configuration for pumplink tools.
//!
//! TOML file plus `PUMPLINK_` environment overrides, platform paths for
//! the config and the stored pairing, and translation into
//! `pumplink_core::SessionConfig`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

use pumplink_core::SessionConfig;
use pumplink_core::config::{
    DEFAULT_CLOCK_DRIFT_THRESHOLD, DEFAULT_CLOCK_SYNC_ATTEMPTS, DEFAULT_CONNECT_TIMEOUT,
};

const CONFIG_FILE: &str = "config.toml";
const IDENTITY_FILE: &str = "identity.toml";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Pump session tuning.
    #[serde(default)]
    pub session: SessionSection,

    #[serde(default)]
    pub storage: StorageSection,

    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SessionSection {
    /// Pump clock divergence (seconds) at which the clock is rewritten.
    #[serde(default = "default_drift_threshold")]
    pub clock_drift_threshold_secs: u64,

    /// Clock writes attempted before connect-time verification fails.
    #[serde(default = "default_sync_attempts")]
    pub clock_sync_attempts: u32,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            clock_drift_threshold_secs: default_drift_threshold(),
            clock_sync_attempts: default_sync_attempts(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_drift_threshold() -> u64 {
    DEFAULT_CLOCK_DRIFT_THRESHOLD.as_secs()
}
fn default_sync_attempts() -> u32 {
    DEFAULT_CLOCK_SYNC_ATTEMPTS
}
fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_secs()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct StorageSection {
    /// Override for the pairing record location.
    pub identity_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoggingSection {
    /// `EnvFilter` directive used when neither `-v` nor `RUST_LOG` is set.
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "warn".into()
}

impl Config {
    /// Validate the `[session]` section and convert it for the core.
    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        let session = &self.session;
        if session.clock_sync_attempts == 0 {
            return Err(ConfigError::Validation {
                field: "session.clock_sync_attempts".into(),
                reason: "must be at least 1".into(),
            });
        }
        if session.clock_drift_threshold_secs == 0 {
            return Err(ConfigError::Validation {
                field: "session.clock_drift_threshold_secs".into(),
                reason: "must be greater than zero".into(),
            });
        }
        if session.connect_timeout_secs == 0 {
            return Err(ConfigError::Validation {
                field: "session.connect_timeout_secs".into(),
                reason: "must be greater than zero".into(),
            });
        }

        Ok(SessionConfig {
            clock_drift_threshold: Duration::from_secs(session.clock_drift_threshold_secs),
            clock_sync_attempts: session.clock_sync_attempts,
            connect_timeout: Duration::from_secs(session.connect_timeout_secs),
        })
    }

    /// Where the pairing record lives: the configured override, or the
    /// platform data directory.
    pub fn identity_path(&self) -> PathBuf {
        self.storage
            .identity_file
            .clone()
            .unwrap_or_else(|| data_dir().join(IDENTITY_FILE))
    }
}

// ── Paths ───────────────────────────────────────────────────────────

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "pumplink", "pumplink")
}

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    project_dirs().map_or_else(
        || home_fallback(".config").join(CONFIG_FILE),
        |dirs| dirs.config_dir().join(CONFIG_FILE),
    )
}

/// Directory for persistent state such as the pairing record.
pub fn data_dir() -> PathBuf {
    project_dirs().map_or_else(
        || home_fallback(".local/share"),
        |dirs| dirs.data_dir().to_path_buf(),
    )
}

fn home_fallback(base: &str) -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(base);
    p.push("pumplink");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load Config from `path` + environment. A missing file is not an error.
///
/// Environment keys nest on `__`, e.g. `PUMPLINK_SESSION__CLOCK_SYNC_ATTEMPTS`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("PUMPLINK_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<PathBuf, ConfigError> {
    let path = config_path();
    save_config_to(cfg, &path)?;
    Ok(path)
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_match_core_defaults() {
        let session = Config::default().session_config().unwrap();
        assert_eq!(session, SessionConfig::default());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.session, SessionSection::default());
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            "[session]\nclock_sync_attempts = 5\n\n[logging]\nformat = \"json\"\n\n[storage]\nidentity_file = \"/var/lib/pump/identity.toml\"\n",
        )
        .unwrap();

        let config = load_config_from(&path).unwrap();

        assert_eq!(config.session.clock_sync_attempts, 5);
        assert_eq!(config.session.clock_drift_threshold_secs, 60);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(
            config.identity_path(),
            PathBuf::from("/var/lib/pump/identity.toml")
        );
    }

    #[test]
    fn zero_attempts_are_rejected() {
        let mut config = Config::default();
        config.session.clock_sync_attempts = 0;
        assert!(matches!(
            config.session_config(),
            Err(ConfigError::Validation { .. })
        ));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut config = Config::default();
        config.session.connect_timeout_secs = 0;
        assert!(config.session_config().is_err());
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);
        let mut config = Config::default();
        config.session.clock_drift_threshold_secs = 90;
        config.logging.level = "debug".into();

        save_config_to(&config, &path).unwrap();
        let loaded = load_config_from(&path).unwrap();

        assert_eq!(loaded.session.clock_drift_threshold_secs, 90);
        assert_eq!(loaded.logging.level, "debug");
    }
}
