//! Clap derive structures for the `pumplink` CLI.
//!
//! Defines the complete command tree, global flags, and shared types.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// pumplink -- offline maintenance for a paired insulin pump
#[derive(Debug, Parser)]
#[command(
    name = "pumplink",
    version,
    about = "Inspect and maintain the pumplink pairing, basal profiles and history dumps",
    long_about = "Offline maintenance tool for the pumplink pump driver.\n\n\
        Works on the stored pairing record, quantizes basal profiles onto the\n\
        pump's grid and classifies exported history without a live connection.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "PUMPLINK_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Pairing record file (overrides `storage.identity_file`)
    #[arg(long, env = "PUMPLINK_IDENTITY_FILE", global = true)]
    pub identity_file: Option<PathBuf>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "PUMPLINK_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// Plain text, one value per line (scripting)
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Inspect or remove the stored pump pairing
    #[command(alias = "id")]
    Identity(IdentityArgs),

    /// Basal profile tools
    Profile(ProfileArgs),

    /// Pump history tools
    History(HistoryArgs),

    /// Manage CLI configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Identity ─────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct IdentityArgs {
    #[command(subcommand)]
    pub command: IdentityCommand,
}

#[derive(Debug, Subcommand)]
pub enum IdentityCommand {
    /// Show the paired pump (never prints cipher keys)
    Show,

    /// Delete the stored pairing
    Unpair {
        /// Confirm the removal
        #[arg(long, short = 'y')]
        yes: bool,
    },
}

// ── Profile ──────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ProfileArgs {
    #[command(subcommand)]
    pub command: ProfileCommand,
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommand {
    /// Quantize 24 hourly basal rates (IU/h) onto the pump's grid
    Quantize {
        /// Comma-separated hourly rates, starting at 00:00 UTC
        #[arg(value_delimiter = ',', num_args = 1.., allow_negative_numbers = true)]
        rates: Vec<f64>,
    },
}

// ── History ──────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[command(subcommand)]
    pub command: HistoryCommand,
}

#[derive(Debug, Subcommand)]
pub enum HistoryCommand {
    /// Classify a JSON array of history events
    Classify {
        /// History dump (JSON array of events)
        file: PathBuf,

        /// Event counter of the bolus this driver issued
        #[arg(long)]
        expect_counter: Option<u64>,

        /// Tag of the expected bolus [default: normal]
        #[arg(long, value_enum, requires = "expect_counter")]
        tag: Option<BolusTagArg>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BolusTagArg {
    Normal,
    Smb,
    Priming,
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file path
    Path,

    /// Show the effective configuration
    Show,

    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

// ── Completions ──────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Target shell
    pub shell: clap_complete::Shell,
}
