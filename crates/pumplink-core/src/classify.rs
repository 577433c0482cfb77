// ── History delta classifier ──
//
// Turns the events recorded since the last checkpoint into therapy-sync
// actions and a verdict on whether the pump did anything this driver
// did not ask for.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::model::{HistoryEvent, HistoryEventKind, LastBolus};

/// Why a bolus was issued, carried through to the therapy record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BolusTag {
    #[default]
    Normal,
    /// Super-micro-bolus issued by an automated loop.
    Smb,
    /// Cannula or tube priming.
    Priming,
}

/// A bolus the caller just issued and expects to find in the delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedBolus {
    pub counter: u64,
    pub tag: BolusTag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Verdict {
    NoIrregularities,
    UnaccountedActivityDetected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BolusKind {
    Quick,
    Standard { manual: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtendedPhase {
    Started,
    Ended,
}

/// "Record this event in the therapy database."
///
/// Applying the same action twice must be a no-op at the sink; the
/// event counter is the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SyncAction {
    Bolus {
        counter: u64,
        timestamp: DateTime<Utc>,
        amount: u32,
        kind: BolusKind,
        /// Set only when the bolus matched the caller's expectation.
        tag: Option<BolusTag>,
    },
    ExtendedBolus {
        counter: u64,
        timestamp: DateTime<Utc>,
        total_amount: u32,
        duration_minutes: u16,
        phase: ExtendedPhase,
    },
}

impl SyncAction {
    pub fn counter(&self) -> u64 {
        match self {
            Self::Bolus { counter, .. } | Self::ExtendedBolus { counter, .. } => *counter,
        }
    }
}

/// Result of classifying one delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryDelta {
    pub actions: Vec<SyncAction>,
    pub verdict: Verdict,
    /// Counters of the events that were not accounted for.
    pub unaccounted: Vec<u64>,
    /// Infused amount of the expected bolus, when it was found.
    pub expected_amount: Option<u32>,
    /// Newest immediate bolus in the delta.
    pub last_bolus: Option<LastBolus>,
}

impl HistoryDelta {
    pub fn has_unaccounted_activity(&self) -> bool {
        self.verdict == Verdict::UnaccountedActivityDetected
    }
}

/// Classify `events` (oldest first).
///
/// Quick boluses, extended boluses and any standard bolus whose counter
/// is not the expected one count as unaccounted activity.
pub fn classify(events: &[HistoryEvent], expected: Option<ExpectedBolus>) -> HistoryDelta {
    let mut actions = Vec::with_capacity(events.len());
    let mut unaccounted = Vec::new();
    let mut expected_amount = None;
    let mut last_bolus: Option<(u64, LastBolus)> = None;

    for event in events {
        let action = match event.kind {
            HistoryEventKind::QuickBolusInfused { amount } => {
                unaccounted.push(event.counter);
                SyncAction::Bolus {
                    counter: event.counter,
                    timestamp: event.timestamp,
                    amount,
                    kind: BolusKind::Quick,
                    tag: None,
                }
            }
            HistoryEventKind::StandardBolusInfused { amount, manual } => {
                let tag = match expected {
                    Some(exp) if exp.counter == event.counter => {
                        expected_amount = Some(amount);
                        Some(exp.tag)
                    }
                    _ => {
                        unaccounted.push(event.counter);
                        None
                    }
                };
                SyncAction::Bolus {
                    counter: event.counter,
                    timestamp: event.timestamp,
                    amount,
                    kind: BolusKind::Standard { manual },
                    tag,
                }
            }
            HistoryEventKind::ExtendedBolusStarted {
                total_amount,
                duration_minutes,
            } => {
                unaccounted.push(event.counter);
                SyncAction::ExtendedBolus {
                    counter: event.counter,
                    timestamp: event.timestamp,
                    total_amount,
                    duration_minutes,
                    phase: ExtendedPhase::Started,
                }
            }
            HistoryEventKind::ExtendedBolusEnded {
                total_amount,
                duration_minutes,
            } => {
                unaccounted.push(event.counter);
                SyncAction::ExtendedBolus {
                    counter: event.counter,
                    timestamp: event.timestamp,
                    total_amount,
                    duration_minutes,
                    phase: ExtendedPhase::Ended,
                }
            }
        };

        if let Some(amount) = event.kind.bolus_amount() {
            if last_bolus.is_none_or(|(counter, _)| event.counter > counter) {
                last_bolus = Some((
                    event.counter,
                    LastBolus {
                        amount,
                        at: event.timestamp,
                    },
                ));
            }
        }

        actions.push(action);
    }

    let verdict = if unaccounted.is_empty() {
        Verdict::NoIrregularities
    } else {
        Verdict::UnaccountedActivityDetected
    };

    HistoryDelta {
        actions,
        verdict,
        unaccounted,
        expected_amount,
        last_bolus: last_bolus.map(|(_, bolus)| bolus),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    fn event(counter: u64, kind: HistoryEventKind) -> HistoryEvent {
        HistoryEvent {
            counter,
            timestamp: Utc
                .with_ymd_and_hms(2026, 3, 1, 8, 0, 0)
                .single()
                .unwrap_or_default()
                + chrono::Duration::minutes(i64::try_from(counter).unwrap_or_default()),
            kind,
        }
    }

    fn standard(counter: u64, amount: u32) -> HistoryEvent {
        event(
            counter,
            HistoryEventKind::StandardBolusInfused {
                amount,
                manual: false,
            },
        )
    }

    #[test]
    fn empty_delta_has_no_irregularities() {
        let delta = classify(&[], None);
        assert_eq!(delta.verdict, Verdict::NoIrregularities);
        assert!(delta.actions.is_empty());
        assert_eq!(delta.last_bolus, None);
    }

    #[test]
    fn quick_bolus_is_always_unaccounted() {
        let events = [event(7, HistoryEventKind::QuickBolusInfused { amount: 20 })];
        let delta = classify(&events, None);
        assert_eq!(delta.verdict, Verdict::UnaccountedActivityDetected);
        assert_eq!(delta.unaccounted, vec![7]);
        assert_eq!(delta.actions.len(), 1);
    }

    #[test]
    fn expected_standard_bolus_is_accounted() {
        let events = [standard(12, 57)];
        let expected = ExpectedBolus {
            counter: 12,
            tag: BolusTag::Smb,
        };
        let delta = classify(&events, Some(expected));

        assert_eq!(delta.verdict, Verdict::NoIrregularities);
        assert_eq!(delta.expected_amount, Some(57));
        assert!(matches!(
            delta.actions[0],
            SyncAction::Bolus {
                tag: Some(BolusTag::Smb),
                amount: 57,
                ..
            }
        ));
    }

    #[test]
    fn standard_bolus_with_other_counter_is_unaccounted() {
        let events = [standard(11, 30), standard(12, 57)];
        let expected = ExpectedBolus {
            counter: 12,
            tag: BolusTag::Normal,
        };
        let delta = classify(&events, Some(expected));

        assert_eq!(delta.verdict, Verdict::UnaccountedActivityDetected);
        assert_eq!(delta.unaccounted, vec![11]);
        assert_eq!(delta.expected_amount, Some(57));
    }

    #[test]
    fn extended_bolus_events_are_unaccounted() {
        let events = [
            event(
                3,
                HistoryEventKind::ExtendedBolusStarted {
                    total_amount: 40,
                    duration_minutes: 90,
                },
            ),
            event(
                4,
                HistoryEventKind::ExtendedBolusEnded {
                    total_amount: 40,
                    duration_minutes: 90,
                },
            ),
        ];
        let delta = classify(&events, None);
        assert_eq!(delta.unaccounted, vec![3, 4]);
        assert_eq!(delta.last_bolus, None);
    }

    #[test]
    fn every_event_yields_a_sync_action() {
        let events = [
            standard(1, 10),
            event(2, HistoryEventKind::QuickBolusInfused { amount: 5 }),
            standard(3, 15),
        ];
        let delta = classify(&events, None);
        let counters: Vec<u64> = delta.actions.iter().map(SyncAction::counter).collect();
        assert_eq!(counters, vec![1, 2, 3]);
    }

    #[test]
    fn last_bolus_is_the_newest() {
        let events = [standard(5, 10), standard(9, 25), standard(6, 40)];
        let delta = classify(&events, None);
        let last = delta.last_bolus.unwrap_or_else(|| panic!("no last bolus"));
        assert_eq!(last.amount, 25);
    }
}
