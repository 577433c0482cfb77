//! Profile subcommand handlers.

use serde::Serialize;
use tabled::Tabled;

use pumplink_core::BasalProfile;
use pumplink_core::model::HOURS_PER_DAY;

use crate::cli::{GlobalOpts, ProfileArgs, ProfileCommand};
use crate::error::CliError;
use crate::output;

#[derive(Debug, Serialize)]
struct HourFactor {
    hour: usize,
    requested: f64,
    factor: u32,
}

#[derive(Tabled)]
struct HourRow {
    #[tabled(rename = "Hour")]
    hour: String,
    #[tabled(rename = "Requested IU/h")]
    requested: String,
    #[tabled(rename = "Factor")]
    factor: u32,
    #[tabled(rename = "Pump IU/h")]
    quantized: String,
}

fn to_row(h: &HourFactor) -> HourRow {
    HourRow {
        hour: format!("{:02}:00", h.hour),
        requested: format!("{:.3}", h.requested),
        factor: h.factor,
        quantized: format_units(h.factor),
    }
}

/// Milli-IU as IU with three decimals.
fn format_units(milli_units: u32) -> String {
    format!("{}.{:03}", milli_units / 1000, milli_units % 1000)
}

fn validate_rates(rates: &[f64]) -> Result<(), CliError> {
    if rates.len() != HOURS_PER_DAY {
        return Err(CliError::Validation {
            field: "rates".into(),
            reason: format!("expected {HOURS_PER_DAY} hourly rates, got {}", rates.len()),
        });
    }
    if let Some((hour, rate)) = rates
        .iter()
        .enumerate()
        .find(|(_, rate)| !rate.is_finite() || **rate < 0.0)
    {
        return Err(CliError::Validation {
            field: "rates".into(),
            reason: format!("rate for hour {hour} must be a non-negative number, got {rate}"),
        });
    }
    Ok(())
}

// ── Handler ─────────────────────────────────────────────────────────

pub fn handle(args: ProfileArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ProfileCommand::Quantize { rates } => {
            validate_rates(&rates)?;
            let profile = BasalProfile::from_rates(&rates)?;
            tracing::debug!(daily_total = profile.daily_total(), "profile quantized");

            let hours: Vec<HourFactor> = rates
                .iter()
                .zip(profile.factors())
                .enumerate()
                .map(|(hour, (requested, factor))| HourFactor {
                    hour,
                    requested: *requested,
                    factor: *factor,
                })
                .collect();

            let out = match global.output {
                crate::cli::OutputFormat::Table => {
                    let rows: Vec<HourRow> = hours.iter().map(to_row).collect();
                    format!(
                        "{}\nDaily total: {} IU",
                        output::render_table(&rows),
                        format_units(profile.daily_total())
                    )
                }
                format => output::render_list(format, &hours, to_row, |h| h.factor.to_string())?,
            };
            output::print_output(&out, global.quiet);
            Ok(())
        }
    }
}
