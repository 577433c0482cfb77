//! Identity subcommand handlers.

use std::fmt::Write as _;
use std::path::PathBuf;

use serde::Serialize;

use pumplink_api::ReplayCounterStore;
use pumplink_core::{CoreError, FileIdentityStore, IdentityStore};

use crate::cli::{GlobalOpts, IdentityArgs, IdentityCommand};
use crate::error::CliError;
use crate::output;

/// What `identity show` reports. Cipher keys are deliberately absent.
#[derive(Debug, Serialize)]
struct IdentityView {
    address: String,
    pump_id: String,
    key_response_address: u8,
    replay_counter: u64,
    record: String,
}

fn detail(view: &IdentityView, color: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} {}", output::label("Status", color), output::status("paired", true, color));
    let _ = writeln!(out, "{} {}", output::label("Address", color), view.address);
    let _ = writeln!(out, "{} {}", output::label("Pump ID", color), view.pump_id);
    let _ = writeln!(
        out,
        "{} 0x{:02x}",
        output::label("Key response address", color),
        view.key_response_address
    );
    let _ = writeln!(out, "{} {}", output::label("Replay counter", color), view.replay_counter);
    let _ = write!(out, "{} {}", output::label("Record", color), view.record);
    out
}

/// The pairing record location: `--identity-file`, then the config.
pub(crate) fn identity_path(global: &GlobalOpts) -> Result<PathBuf, CliError> {
    if let Some(path) = &global.identity_file {
        return Ok(path.clone());
    }
    Ok(crate::load_config(global)?.identity_path())
}

// ── Handler ─────────────────────────────────────────────────────────

pub fn handle(args: IdentityArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let path = identity_path(global)?;
    let store = FileIdentityStore::new(&path);
    tracing::debug!(path = %path.display(), "using pairing record");

    match args.command {
        IdentityCommand::Show => {
            let identity = store
                .load_identity()
                .and_then(|identity| identity.ok_or(CoreError::NotPaired))
                .map_err(|e| CliError::from_identity_error(e, &path))?;
            let replay_counter = store
                .replay_counter()
                .map_err(|e| CliError::from_identity_error(e.into(), &path))?;

            let view = IdentityView {
                address: identity.address.to_string(),
                pump_id: identity.pump_id,
                key_response_address: identity.key_response_address,
                replay_counter,
                record: path.display().to_string(),
            };
            let color = output::should_color(global.color);
            let out = output::render_single(
                global.output,
                &view,
                |v| detail(v, color),
                |v| v.address.clone(),
            )?;
            output::print_output(&out, global.quiet);
            Ok(())
        }

        IdentityCommand::Unpair { yes } => {
            if !yes {
                return Err(CliError::NonInteractiveRequiresYes {
                    action: "identity unpair".into(),
                });
            }
            let removed = store
                .delete_identity()
                .map_err(|e| CliError::from_identity_error(e, &path))?;
            if removed {
                tracing::info!(path = %path.display(), "pairing record removed");
                output::print_output("Pump unpaired.", global.quiet);
            } else {
                output::print_output("No pump was paired.", global.quiet);
            }
            Ok(())
        }
    }
}
