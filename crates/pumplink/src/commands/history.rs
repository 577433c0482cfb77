//! History subcommand handlers.

use std::fmt::Write as _;

use tabled::Tabled;

use pumplink_core::{
    BolusKind, BolusTag, ExpectedBolus, ExtendedPhase, HistoryDelta, HistoryEvent, SyncAction,
    classify,
};

use crate::cli::{BolusTagArg, GlobalOpts, HistoryArgs, HistoryCommand, OutputFormat};
use crate::error::CliError;
use crate::output;

impl From<BolusTagArg> for BolusTag {
    fn from(tag: BolusTagArg) -> Self {
        match tag {
            BolusTagArg::Normal => Self::Normal,
            BolusTagArg::Smb => Self::Smb,
            BolusTagArg::Priming => Self::Priming,
        }
    }
}

#[derive(Tabled)]
struct ActionRow {
    #[tabled(rename = "Counter")]
    counter: u64,
    #[tabled(rename = "Time (UTC)")]
    timestamp: String,
    #[tabled(rename = "Event")]
    event: String,
    #[tabled(rename = "Amount IU")]
    amount: String,
    #[tabled(rename = "Tag")]
    tag: String,
    #[tabled(rename = "Accounted")]
    accounted: String,
}

/// Tenths of an IU as IU.
fn format_tenths(amount: u32) -> String {
    format!("{}.{}", amount / 10, amount % 10)
}

fn describe(action: &SyncAction) -> (String, u32, Option<BolusTag>) {
    match action {
        SyncAction::Bolus {
            amount, kind, tag, ..
        } => {
            let event = match kind {
                BolusKind::Quick => "quick bolus".to_owned(),
                BolusKind::Standard { manual: true } => "manual bolus".to_owned(),
                BolusKind::Standard { manual: false } => "bolus".to_owned(),
            };
            (event, *amount, *tag)
        }
        SyncAction::ExtendedBolus {
            total_amount,
            duration_minutes,
            phase,
            ..
        } => {
            let phase = match phase {
                ExtendedPhase::Started => "started",
                ExtendedPhase::Ended => "ended",
            };
            (
                format!("extended bolus {phase} ({duration_minutes} min)"),
                *total_amount,
                None,
            )
        }
    }
}

fn to_row(action: &SyncAction, delta: &HistoryDelta) -> ActionRow {
    let (event, amount, tag) = describe(action);
    let (counter, timestamp) = match action {
        SyncAction::Bolus {
            counter, timestamp, ..
        }
        | SyncAction::ExtendedBolus {
            counter, timestamp, ..
        } => (*counter, timestamp),
    };
    ActionRow {
        counter,
        timestamp: timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
        event,
        amount: format_tenths(amount),
        tag: tag.map(|t| t.to_string()).unwrap_or_default(),
        accounted: if delta.unaccounted.contains(&counter) {
            "no".into()
        } else {
            "yes".into()
        },
    }
}

fn summary(delta: &HistoryDelta, color: bool) -> String {
    let verdict = output::status(
        &delta.verdict.to_string(),
        !delta.has_unaccounted_activity(),
        color,
    );
    let mut out = format!("{} {verdict}", output::label("Verdict", color));
    if let Some(amount) = delta.expected_amount {
        let _ = write!(
            out,
            "\n{} {} IU",
            output::label("Expected bolus infused", color),
            format_tenths(amount)
        );
    }
    out
}

// ── Handler ─────────────────────────────────────────────────────────

pub fn handle(args: &HistoryArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match &args.command {
        HistoryCommand::Classify {
            file,
            expect_counter,
            tag,
        } => {
            let contents = std::fs::read_to_string(file)?;
            let events: Vec<HistoryEvent> = serde_json::from_str(&contents)?;
            let expected = expect_counter.map(|counter| ExpectedBolus {
                counter,
                tag: tag.map(BolusTag::from).unwrap_or_default(),
            });
            let delta = classify(&events, expected);
            tracing::debug!(
                events = events.len(),
                verdict = %delta.verdict,
                "history classified"
            );

            let out = match global.output {
                OutputFormat::Table => {
                    let rows: Vec<ActionRow> =
                        delta.actions.iter().map(|a| to_row(a, &delta)).collect();
                    let color = output::should_color(global.color);
                    format!("{}\n{}", output::render_table(&rows), summary(&delta, color))
                }
                OutputFormat::Json => output::render_json(&delta, false)?,
                OutputFormat::JsonCompact => output::render_json(&delta, true)?,
                OutputFormat::Plain => delta
                    .unaccounted
                    .iter()
                    .map(u64::to_string)
                    .collect::<Vec<_>>()
                    .join("\n"),
            };
            output::print_output(&out, global.quiet);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenths_render_as_units() {
        assert_eq!(format_tenths(57), "5.7");
        assert_eq!(format_tenths(300), "30.0");
    }

    #[test]
    fn tag_arguments_map_onto_core_tags() {
        assert_eq!(BolusTag::from(BolusTagArg::Smb), BolusTag::Smb);
        assert_eq!(BolusTag::from(BolusTagArg::Priming), BolusTag::Priming);
    }
}
