//! Config subcommand handlers.

use std::path::PathBuf;

use pumplink_config::Config;

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts, OutputFormat};
use crate::error::CliError;
use crate::output;

fn target_path(global: &GlobalOpts) -> PathBuf {
    global
        .config
        .clone()
        .unwrap_or_else(pumplink_config::config_path)
}

// ── Handler ─────────────────────────────────────────────────────────

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            output::print_output(&target_path(global).display().to_string(), global.quiet);
            Ok(())
        }

        ConfigCommand::Show => {
            let cfg = crate::load_config(global)?;
            // Validate the session section so that `show` surfaces bad values.
            cfg.session_config()?;
            let out = match global.output {
                OutputFormat::Json => output::render_json(&cfg, false)?,
                OutputFormat::JsonCompact => output::render_json(&cfg, true)?,
                OutputFormat::Table | OutputFormat::Plain => toml::to_string_pretty(&cfg)?,
            };
            output::print_output(out.trim_end(), global.quiet);
            Ok(())
        }

        ConfigCommand::Init { force } => {
            let path = target_path(global);
            if path.exists() && !force {
                return Err(CliError::AlreadyExists {
                    path: path.display().to_string(),
                });
            }
            pumplink_config::save_config_to(&Config::default(), &path)?;
            tracing::info!(path = %path.display(), "default config written");
            eprintln!("Wrote default config to {}", path.display());
            Ok(())
        }
    }
}
