// ── Channel record → domain conversions ──
//
// Raw records from pumplink-api become canonical model types here.
// Unknown codes are rejected rather than guessed.

use chrono::{TimeZone, Utc};
use pumplink_api::{HistoryRecord, HistoryRecordDetail, StatusReport};
use tracing::trace;

use crate::error::CoreError;
use crate::model::{BatteryState, HistoryEvent, HistoryEventKind, PumpStatus, ReservoirState};

impl TryFrom<StatusReport> for PumpStatus {
    type Error = CoreError;

    fn try_from(report: StatusReport) -> Result<Self, Self::Error> {
        let battery = match report.battery_code {
            0 => BatteryState::Absent,
            1 => BatteryState::Low,
            2 => BatteryState::Full,
            other => {
                return Err(CoreError::UnexpectedResponse {
                    message: format!("unknown battery code {other}"),
                });
            }
        };
        let reservoir = match report.reservoir_code {
            0 => ReservoirState::Empty,
            1 => ReservoirState::Low,
            2 => ReservoirState::Full,
            other => {
                return Err(CoreError::UnexpectedResponse {
                    message: format!("unknown reservoir code {other}"),
                });
            }
        };
        Ok(PumpStatus {
            running: report.running,
            battery,
            reservoir,
            reservoir_units: report.reservoir_units,
        })
    }
}

/// Convert one raw entry, dropping kinds that carry no therapy meaning.
pub fn history_event(record: HistoryRecord) -> Option<HistoryEvent> {
    let kind = match record.detail {
        HistoryRecordDetail::QuickBolusInfused { amount } => {
            HistoryEventKind::QuickBolusInfused { amount }
        }
        HistoryRecordDetail::StandardBolusInfused { amount, manual } => {
            HistoryEventKind::StandardBolusInfused { amount, manual }
        }
        HistoryRecordDetail::ExtendedBolusStarted {
            total_amount,
            duration_minutes,
        } => HistoryEventKind::ExtendedBolusStarted {
            total_amount,
            duration_minutes,
        },
        HistoryRecordDetail::ExtendedBolusEnded {
            total_amount,
            duration_minutes,
        } => HistoryEventKind::ExtendedBolusEnded {
            total_amount,
            duration_minutes,
        },
        HistoryRecordDetail::Other { code } => {
            trace!(counter = record.event_counter, code, "skipping history entry");
            return None;
        }
    };
    Some(HistoryEvent {
        counter: record.event_counter,
        timestamp: Utc.from_utc_datetime(&record.timestamp),
        kind,
    })
}

/// Convert a fetched delta, preserving order.
pub fn history_events(records: Vec<HistoryRecord>) -> Vec<HistoryEvent> {
    records.into_iter().filter_map(history_event).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    #[test]
    fn status_codes_map_to_states() {
        let status = PumpStatus::try_from(StatusReport {
            running: false,
            battery_code: 1,
            reservoir_code: 0,
            reservoir_units: 0,
        })
        .unwrap();
        assert!(!status.running);
        assert_eq!(status.battery, BatteryState::Low);
        assert_eq!(status.reservoir, ReservoirState::Empty);
    }

    #[test]
    fn unknown_battery_code_is_rejected() {
        let result = PumpStatus::try_from(StatusReport {
            running: true,
            battery_code: 9,
            reservoir_code: 2,
            reservoir_units: 120,
        });
        assert!(matches!(result, Err(CoreError::UnexpectedResponse { .. })));
    }

    #[test]
    fn other_records_are_dropped() {
        let timestamp = NaiveDate::from_ymd_opt(2026, 3, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        let events = history_events(vec![
            HistoryRecord {
                event_counter: 1,
                timestamp,
                detail: HistoryRecordDetail::Other { code: 0x55 },
            },
            HistoryRecord {
                event_counter: 2,
                timestamp,
                detail: HistoryRecordDetail::QuickBolusInfused { amount: 10 },
            },
        ]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].counter, 2);
        assert_eq!(events[0].timestamp.naive_utc(), timestamp);
    }
}
