//! Command handlers: bridge CLI args -> core types -> output formatting.

pub mod config_cmd;
pub mod history;
pub mod identity;
pub mod profile;
