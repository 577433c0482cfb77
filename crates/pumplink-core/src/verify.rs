// ── Connect-time verification ──
//
// Runs once per established link (and again after an implicit
// reconnect): clock check, history reconciliation, basal profile
// reconciliation. Each step aborts the pipeline with its own error;
// whatever was left undone is redone on the next connection.

use chrono::Timelike;
use pumplink_api::PumpDevice;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::classify::{ExpectedBolus, HistoryDelta, classify};
use crate::convert;
use crate::error::CoreError;
use crate::model::DriverState;
use crate::session::Services;
use crate::sink::Notification;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ClockCheck {
    InSync { drift_secs: i64 },
    /// The clock was rewritten; `drift_secs` is the divergence found first.
    Adjusted { drift_secs: i64, attempts: u32 },
}

/// Outcome of basal reconciliation.
///
/// Temporary basal rates are not reconciled yet; a variant for them
/// belongs here once they are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ProfileCheck {
    /// No target profile is known yet.
    NoTarget,
    Matches,
    Written { forced: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub clock: ClockCheck,
    pub synced_events: usize,
    pub unaccounted: Vec<u64>,
    pub profile: ProfileCheck,
}

/// Run the full pipeline with the driver temporarily in `CheckingDevice`.
///
/// The prior state is restored afterwards unless something else (a
/// forced disconnect) changed the state in the meantime.
pub(crate) async fn verify(
    services: &Services,
    device: &dyn PumpDevice,
) -> Result<VerificationReport, CoreError> {
    let store = &services.store;
    let prior = store.state();
    let checking = store.transition(prior, DriverState::CheckingDevice);

    let result = run_steps(services, device).await;

    if checking {
        store.transition(DriverState::CheckingDevice, prior);
    }
    match &result {
        Ok(report) => debug!(?report, "pump verification complete"),
        Err(e) if e.is_cancellation() => debug!("pump verification cancelled"),
        Err(e) => warn!(error = %e, "pump verification failed"),
    }
    result
}

async fn run_steps(
    services: &Services,
    device: &dyn PumpDevice,
) -> Result<VerificationReport, CoreError> {
    let clock = check_clock(services, device).await?;
    let delta = reconcile_history(services, device, None).await?;
    let profile = reconcile_basal(services, device).await?;

    Ok(VerificationReport {
        clock,
        synced_events: delta.actions.len(),
        unaccounted: delta.unaccounted,
        profile,
    })
}

// ── Steps ────────────────────────────────────────────────────────

/// Compare the pump clock with UTC and rewrite it while it diverges by
/// at least the configured threshold.
pub(crate) async fn check_clock(
    services: &Services,
    device: &dyn PumpDevice,
) -> Result<ClockCheck, CoreError> {
    let config = &services.config;
    let threshold = i64::try_from(config.clock_drift_threshold.as_secs()).unwrap_or(i64::MAX);
    let mut attempts = 0u32;
    let mut first_drift = None;

    loop {
        let device_time = device.read_time().await?;
        let now = services.clock.now().naive_utc();
        let drift = (device_time - now).num_seconds();
        let initial = *first_drift.get_or_insert(drift);

        if drift.abs() < threshold {
            if attempts == 0 {
                return Ok(ClockCheck::InSync { drift_secs: drift });
            }
            services
                .notifier
                .notify(Notification::ClockAdjusted { drift_secs: initial });
            return Ok(ClockCheck::Adjusted {
                drift_secs: initial,
                attempts,
            });
        }

        if attempts >= config.clock_sync_attempts {
            return Err(CoreError::ClockSyncFailed {
                attempts,
                drift_secs: drift,
            });
        }

        attempts += 1;
        info!(drift_secs = drift, attempt = attempts, "pump clock diverged, writing UTC");
        device
            .write_time(services.clock.now().naive_utc())
            .await?;
    }
}

/// Fetch the history delta, classify it and sync every action.
///
/// Unaccounted activity is flagged and announced but never aborts here.
pub(crate) async fn reconcile_history(
    services: &Services,
    device: &dyn PumpDevice,
    expected: Option<ExpectedBolus>,
) -> Result<HistoryDelta, CoreError> {
    let records = device.fetch_history_delta().await?;
    let events = convert::history_events(records);
    let delta = classify(&events, expected);

    for action in &delta.actions {
        services.records.record(action).await?;
    }
    if let Some(bolus) = delta.last_bolus {
        services.store.update_last_bolus(bolus);
    }
    if delta.has_unaccounted_activity() {
        warn!(counters = ?delta.unaccounted, "unaccounted pump activity in history");
        services.notifier.notify(Notification::UnaccountedActivity {
            counters: delta.unaccounted.clone(),
        });
    }

    debug!(events = events.len(), verdict = %delta.verdict, "history delta synced");
    Ok(delta)
}

/// Make sure the pump runs the target basal profile.
pub(crate) async fn reconcile_basal(
    services: &Services,
    device: &dyn PumpDevice,
) -> Result<ProfileCheck, CoreError> {
    let Some(target) = services.profile.current() else {
        debug!("no target basal profile, skipping reconciliation");
        return Ok(ProfileCheck::NoTarget);
    };
    let forced = services.profile.force_pending();

    if !forced {
        let hour = usize::try_from(services.clock.now().hour()).unwrap_or_default();
        let active = device.read_current_basal_factor().await?;
        if target.factor_at(hour) == Some(active) {
            return Ok(ProfileCheck::Matches);
        }
        info!(hour, active, expected = ?target.factor_at(hour), "basal profile diverged");
    }

    if let Err(e) = device.write_basal_profile(target.factors()).await {
        services.profile.request_force();
        return Err(e.into());
    }
    services.profile.clear_force();
    services.notifier.notify(Notification::BasalProfileWritten);
    info!(forced, "basal profile written");
    Ok(ProfileCheck::Written { forced })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};
    use pumplink_api::mock::{MockOperation, MockPump};

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SessionConfig;
    use crate::model::BasalProfile;
    use crate::session::ProfileTarget;
    use crate::sink::{BroadcastNotifier, MemoryRecordSink};
    use crate::store::SessionStore;

    fn services(clock: Arc<ManualClock>) -> Services {
        Services {
            config: SessionConfig::default(),
            records: Arc::new(MemoryRecordSink::new()),
            notifier: Arc::new(BroadcastNotifier::new()),
            clock,
            store: Arc::new(SessionStore::new()),
            profile: ProfileTarget::default(),
        }
    }

    fn setup(offset_secs: i64) -> (Services, MockPump) {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 14, 30, 0).unwrap();
        let clock = Arc::new(ManualClock::new(now));
        let pump = MockPump::new();
        pump.set_device_time((now + Duration::seconds(offset_secs)).naive_utc());
        (services(clock), pump)
    }

    #[tokio::test]
    async fn drift_of_59_seconds_is_tolerated() {
        let (services, pump) = setup(-59);
        let check = check_clock(&services, &pump).await.unwrap();
        assert_eq!(check, ClockCheck::InSync { drift_secs: -59 });
        assert_eq!(pump.call_count(MockOperation::WriteTime), 0);
    }

    #[tokio::test]
    async fn drift_of_60_seconds_is_corrected() {
        let (services, pump) = setup(60);
        let check = check_clock(&services, &pump).await.unwrap();
        assert_eq!(
            check,
            ClockCheck::Adjusted {
                drift_secs: 60,
                attempts: 1
            }
        );
        assert_eq!(pump.call_count(MockOperation::WriteTime), 1);
    }

    #[tokio::test]
    async fn clock_that_will_not_move_fails_after_configured_attempts() {
        let (services, pump) = setup(3600);
        pump.ignore_time_writes(true);

        let err = check_clock(&services, &pump).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::ClockSyncFailed {
                attempts: 3,
                drift_secs: 3600
            }
        ));
        assert_eq!(pump.call_count(MockOperation::WriteTime), 3);
    }

    #[tokio::test]
    async fn basal_reconciliation_skips_without_target() {
        let (services, pump) = setup(0);
        let check = reconcile_basal(&services, &pump).await.unwrap();
        assert_eq!(check, ProfileCheck::NoTarget);
        assert!(pump.calls().is_empty());
    }

    #[tokio::test]
    async fn matching_hour_factor_needs_no_write() {
        let (services, pump) = setup(0);
        let mut factors = [500; 24];
        factors[14] = 730;
        services
            .profile
            .set(BasalProfile::from_factors(&factors).unwrap());
        pump.set_basal_factor(730);

        let check = reconcile_basal(&services, &pump).await.unwrap();
        assert_eq!(check, ProfileCheck::Matches);
        assert!(pump.written_profiles().is_empty());
    }

    #[tokio::test]
    async fn diverging_factor_triggers_full_write() {
        let (services, pump) = setup(0);
        services
            .profile
            .set(BasalProfile::from_factors(&[500; 24]).unwrap());
        pump.set_basal_factor(450);

        let check = reconcile_basal(&services, &pump).await.unwrap();
        assert_eq!(check, ProfileCheck::Written { forced: false });
        assert_eq!(pump.written_profiles(), vec![vec![500; 24]]);
    }

    #[tokio::test]
    async fn forced_write_skips_the_comparison() {
        let (services, pump) = setup(0);
        services
            .profile
            .set(BasalProfile::from_factors(&[500; 24]).unwrap());
        services.profile.request_force();
        pump.set_basal_factor(500);

        let check = reconcile_basal(&services, &pump).await.unwrap();
        assert_eq!(check, ProfileCheck::Written { forced: true });
        assert_eq!(pump.call_count(MockOperation::ReadBasalFactor), 0);
        assert!(!services.profile.force_pending());
    }

    #[tokio::test]
    async fn failed_profile_write_keeps_force_pending() {
        let (services, pump) = setup(0);
        services
            .profile
            .set(BasalProfile::from_factors(&[500; 24]).unwrap());
        pump.set_basal_factor(0);
        pump.fail_next(MockOperation::WriteBasalProfile, pumplink_api::Error::LinkLost);

        assert!(reconcile_basal(&services, &pump).await.is_err());
        assert!(services.profile.force_pending());
    }

    #[tokio::test]
    async fn verify_restores_prior_state() {
        let (services, pump) = setup(0);
        services.store.force_state(DriverState::Connecting);

        let report = verify(&services, &pump).await.unwrap();
        assert_eq!(report.profile, ProfileCheck::NoTarget);
        assert_eq!(services.store.state(), DriverState::Connecting);
    }
}
