#![allow(clippy::unwrap_used)]
// Integration tests for `Controller` against the scripted mock pump.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pumplink_api::mock::{MockConnector, MockOperation, MockPump};
use pumplink_api::{
    AlertKind, AlertScreen, CIPHER_KEY_LEN, CipherKey, DeviceAddress, HistoryRecordDetail,
    PumpIdentity, ReplayCounterStore,
};
use tokio::sync::broadcast;

use pumplink_core::{
    BasalProfile, BolusOutcome, BolusRequest, BolusTag, BroadcastNotifier, Collaborators, Command,
    CommandResult, Controller, CoreError, DisconnectOutcome, DriverState, Enactment, IdentityStore,
    MemoryIdentityStore, MemoryRecordSink, Notification, ProfileWriteOutcome, SessionConfig,
    SyncAction,
};

// ── Helpers ─────────────────────────────────────────────────────────

struct Harness {
    controller: Controller,
    pump: Arc<MockPump>,
    connector: Arc<MockConnector>,
    identity: Arc<MemoryIdentityStore>,
    records: Arc<MemoryRecordSink>,
    notifier: Arc<BroadcastNotifier>,
}

fn identity() -> PumpIdentity {
    PumpIdentity {
        address: DeviceAddress::new([0x00, 0x0e, 0x2f, 0x10, 0x20, 0x30]),
        client_pump_key: CipherKey::new([0x11; CIPHER_KEY_LEN]),
        pump_client_key: CipherKey::new([0x22; CIPHER_KEY_LEN]),
        key_response_address: 0x3c,
        pump_id: "PUMP_10230947".into(),
    }
}

fn harness_with(store: MemoryIdentityStore) -> Harness {
    let pump = Arc::new(MockPump::new());
    let connector = Arc::new(MockConnector::new(Arc::clone(&pump)));
    let identity = Arc::new(store);
    let records = Arc::new(MemoryRecordSink::new());
    let notifier = Arc::new(BroadcastNotifier::new());

    let collaborators = Collaborators::new(identity.clone(), connector.clone())
        .with_records(records.clone())
        .with_notifier(notifier.clone());
    let controller = Controller::new(SessionConfig::default(), collaborators);
    controller.start();

    Harness {
        controller,
        pump,
        connector,
        identity,
        records,
        notifier,
    }
}

/// A started controller with a paired pump.
fn harness() -> Harness {
    harness_with(MemoryIdentityStore::with_identity(identity(), 0))
}

async fn connected() -> Harness {
    let h = harness();
    h.controller.connect().await.unwrap();
    h
}

fn drain(rx: &mut broadcast::Receiver<Arc<Notification>>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        out.push((*notification).clone());
    }
    out
}

async fn wait_for_state(controller: &Controller, state: DriverState) {
    while controller.state() != state {
        tokio::task::yield_now().await;
    }
}

fn bolus(amount: u32) -> Command {
    Command::DeliverBolus(BolusRequest::new(amount, BolusTag::Normal))
}

// ── Connection lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn test_connect_settles_in_ready() {
    let h = harness();
    let mut rx = h.notifier.subscribe();

    h.controller.connect().await.unwrap();

    assert_eq!(h.controller.state(), DriverState::Ready);
    assert!(h.controller.connected_at().is_some());
    assert!(h.controller.status().unwrap().running);
    assert!(h.pump.is_connected());
    assert!(h.identity.replay_counter().unwrap() > 0);
    assert!(drain(&mut rx).contains(&Notification::ConnectionStatusChanged {
        state: DriverState::Ready
    }));
}

#[tokio::test]
async fn test_stopped_pump_settles_in_suspended() {
    let h = harness();
    h.pump.set_running(false);

    h.controller.connect().await.unwrap();

    assert_eq!(h.controller.state(), DriverState::Suspended);
}

#[tokio::test]
async fn test_connect_without_identity_fails_fast() {
    let h = harness_with(MemoryIdentityStore::new());

    let result = h.controller.connect().await;

    assert!(matches!(result, Err(CoreError::NotPaired)), "got: {result:?}");
    assert_eq!(h.controller.state(), DriverState::Disconnected);
    assert_eq!(h.connector.open_count(), 0);
}

#[tokio::test]
async fn test_connect_before_start_is_rejected() {
    let pump = Arc::new(MockPump::new());
    let connector = Arc::new(MockConnector::new(pump));
    let identity = Arc::new(MemoryIdentityStore::with_identity(identity(), 0));
    let controller = Controller::new(
        SessionConfig::default(),
        Collaborators::new(identity, connector),
    );

    let result = controller.connect().await;

    assert!(matches!(result, Err(CoreError::NotInitialized)));
}

#[tokio::test]
async fn test_second_connect_is_a_noop() {
    let h = connected().await;

    h.controller.connect().await.unwrap();

    assert_eq!(h.connector.open_count(), 1);
    assert_eq!(h.controller.state(), DriverState::Ready);
}

#[tokio::test]
async fn test_failed_open_leaves_driver_disconnected() {
    let h = harness();
    h.connector
        .fail_next_open(pumplink_api::Error::ConnectionFailed {
            reason: "pump out of range".into(),
        });

    let result = h.controller.connect().await;

    assert!(result.unwrap_err().is_connection_failure());
    assert_eq!(h.controller.state(), DriverState::Disconnected);
    assert!(h.controller.last_failure().is_some());
}

#[tokio::test]
async fn test_counter_write_failure_fails_connect() {
    let h = harness();
    h.identity.fail_counter_writes(true);

    let result = h.controller.connect().await;

    assert!(
        matches!(result, Err(CoreError::ReplayCounter { .. })),
        "got: {result:?}"
    );
    assert_eq!(h.controller.state(), DriverState::Disconnected);
    assert!(!h.pump.is_connected());
}

#[tokio::test]
async fn test_disconnect_while_connecting_is_deferred() {
    let h = harness();
    let gate = h.pump.hold_connect();

    let controller = h.controller.clone();
    let connecting = tokio::spawn(async move { controller.connect().await });
    wait_for_state(&h.controller, DriverState::Connecting).await;

    assert_eq!(h.controller.disconnect(false).await, DisconnectOutcome::Deferred);
    assert_eq!(h.controller.state(), DriverState::Connecting);

    gate.notify_one();
    connecting.await.unwrap().unwrap();

    assert_eq!(h.controller.state(), DriverState::Disconnected);
    assert!(!h.pump.is_connected());
    assert!(h.controller.connected_at().is_none());
}

#[tokio::test]
async fn test_forced_disconnect_interrupts_connecting() {
    let h = harness();
    let gate = h.pump.hold_connect();

    let controller = h.controller.clone();
    let connecting = tokio::spawn(async move { controller.connect().await });
    wait_for_state(&h.controller, DriverState::Connecting).await;

    assert_eq!(
        h.controller.disconnect(true).await,
        DisconnectOutcome::Disconnected
    );
    assert_eq!(h.controller.state(), DriverState::Disconnected);

    gate.notify_one();
    let result = connecting.await.unwrap();

    assert!(result.unwrap_err().is_cancellation());
    assert_eq!(h.controller.state(), DriverState::Disconnected);
    assert!(!h.pump.is_connected());
}

#[tokio::test]
async fn test_disconnect_when_idle() {
    let h = connected().await;

    assert_eq!(
        h.controller.disconnect(false).await,
        DisconnectOutcome::Disconnected
    );
    assert_eq!(
        h.controller.disconnect(false).await,
        DisconnectOutcome::AlreadyDisconnected
    );
    assert_eq!(h.controller.state(), DriverState::Disconnected);
}

#[tokio::test]
async fn test_shutdown_returns_to_not_initialized() {
    let h = connected().await;

    h.controller.shutdown().await;

    assert_eq!(h.controller.state(), DriverState::NotInitialized);
    assert!(!h.pump.is_connected());
}

// ── Pairing ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_corrupt_identity_is_unpaired_and_announced() {
    let h = harness();
    let mut rx = h.notifier.subscribe();
    h.identity.corrupt();

    let result = h.controller.connect().await;

    assert!(matches!(result, Err(CoreError::IdentityCorruption { .. })));
    assert!(!h.controller.is_paired().unwrap());
    assert_eq!(h.controller.state(), DriverState::Disconnected);
    assert!(
        drain(&mut rx)
            .iter()
            .any(|n| matches!(n, Notification::IdentityCorrupted { .. }))
    );
}

#[tokio::test]
async fn test_pair_is_rejected_while_connected() {
    let h = connected().await;

    let result = h.controller.pair(&identity());

    assert!(matches!(result, Err(CoreError::InvalidState { .. })));
}

#[tokio::test]
async fn test_pair_resets_the_replay_counter() {
    let h = harness();
    h.identity.set_replay_counter(41).unwrap();

    h.controller.pair(&identity()).unwrap();

    assert_eq!(h.identity.replay_counter().unwrap(), 0);
    assert!(h.controller.is_paired().unwrap());
}

#[tokio::test]
async fn test_unpair_forces_disconnect() {
    let h = connected().await;

    assert!(h.controller.unpair().await.unwrap());

    assert_eq!(h.controller.state(), DriverState::Disconnected);
    assert!(!h.pump.is_connected());
    assert_eq!(h.identity.load_identity().unwrap(), None);
}

// ── Connect-time verification ───────────────────────────────────────

#[tokio::test]
async fn test_pump_clock_is_corrected_on_connect() {
    let h = harness();
    let mut rx = h.notifier.subscribe();
    h.pump
        .set_device_time(Utc::now().naive_utc() - chrono::Duration::hours(2));

    h.controller.connect().await.unwrap();

    let drift = (h.pump.device_time() - Utc::now().naive_utc()).num_seconds();
    assert!(drift.abs() < 5, "pump clock still off by {drift}s");
    assert!(
        drain(&mut rx)
            .iter()
            .any(|n| matches!(n, Notification::ClockAdjusted { .. }))
    );
}

#[tokio::test]
async fn test_unsettled_pump_clock_fails_connect() {
    let h = harness();
    h.pump
        .set_device_time(Utc::now().naive_utc() + chrono::Duration::hours(1));
    h.pump.ignore_time_writes(true);

    let result = h.controller.connect().await;

    assert!(
        matches!(result, Err(CoreError::ClockSyncFailed { attempts: 3, .. })),
        "got: {result:?}"
    );
    assert_eq!(h.pump.call_count(MockOperation::WriteTime), 3);
    assert_eq!(h.controller.state(), DriverState::Disconnected);
    assert!(!h.pump.is_connected());
    assert!(h.controller.connected_at().is_none());
}

#[tokio::test]
async fn test_history_is_synced_on_connect() {
    let h = harness();
    let counter = h
        .pump
        .push_history(HistoryRecordDetail::QuickBolusInfused { amount: 15 });

    h.controller.connect().await.unwrap();

    assert!(h.records.get(counter).is_some());
    assert_eq!(h.controller.last_bolus().unwrap().amount, 15);
}

#[tokio::test]
async fn test_implicit_reconnect_reverifies_pump() {
    let h = connected().await;
    assert_eq!(h.pump.call_count(MockOperation::ReadTime), 1);
    h.pump.reconnect_on_next_exchange();

    h.controller.execute(Command::ReadStatus).await.unwrap();

    assert_eq!(h.pump.call_count(MockOperation::ReadTime), 2);
    assert_eq!(h.controller.state(), DriverState::Ready);
}

#[tokio::test]
async fn test_failed_reverification_keeps_bolus_result_and_disconnects() {
    let h = connected().await;
    let mut rx = h.notifier.subscribe();
    h.pump.reconnect_on_next_exchange();
    h.pump
        .fail_next(MockOperation::ReadTime, pumplink_api::Error::LinkLost);

    let CommandResult::Bolus(result) = h.controller.execute(bolus(57)).await.unwrap() else {
        panic!("expected bolus result");
    };

    assert!(result.success);
    assert_eq!(result.enactment, Enactment::Enacted { amount: 57 });
    assert!(result.verification_error.is_some());
    assert_eq!(h.controller.last_bolus().unwrap().amount, 57);
    assert_eq!(h.controller.state(), DriverState::Disconnected);
    assert!(!h.pump.is_connected());
    assert!(drain(&mut rx).contains(&Notification::ConnectionStatusChanged {
        state: DriverState::Disconnected
    }));
}

#[tokio::test]
async fn test_failed_reverification_fails_status_read() {
    let h = connected().await;
    h.pump.reconnect_on_next_exchange();
    h.pump
        .fail_next(MockOperation::ReadTime, pumplink_api::Error::LinkLost);

    let result = h.controller.execute(Command::ReadStatus).await;

    assert!(result.is_err(), "got: {result:?}");
    assert!(h.controller.last_failure().is_some());
    assert_eq!(h.controller.state(), DriverState::Disconnected);
    assert!(!h.pump.is_connected());
}

// ── Commands ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_command_while_disconnected_is_rejected() {
    let h = harness();

    let result = h.controller.execute(Command::ReadStatus).await;

    assert!(matches!(
        result,
        Err(CoreError::InvalidState {
            state: DriverState::Disconnected
        })
    ));
}

#[tokio::test]
async fn test_read_status_publishes_status() {
    let h = connected().await;
    h.pump.set_running(false);

    let result = h.controller.execute(Command::ReadStatus).await.unwrap();

    let CommandResult::Status(status) = result else {
        panic!("expected status, got {result:?}");
    };
    assert!(!status.running);
    assert_eq!(h.controller.status(), Some(status));
    assert_eq!(h.controller.state(), DriverState::Suspended);
}

#[tokio::test]
async fn test_profile_set_offline_is_written_on_connect() {
    let h = harness();
    let profile = BasalProfile::from_rates(&[0.5; 24]).unwrap();

    let result = h
        .controller
        .execute(Command::SetBasalProfile(profile.clone()))
        .await
        .unwrap();

    assert!(matches!(
        result,
        CommandResult::BasalProfile(ref r) if r.outcome == ProfileWriteOutcome::NotEnacted
    ));
    assert_eq!(h.controller.target_profile(), Some(profile.clone()));
    assert!(h.pump.written_profiles().is_empty());

    h.controller.connect().await.unwrap();

    assert_eq!(h.pump.written_profiles(), vec![profile.factors().to_vec()]);
}

#[tokio::test]
async fn test_profile_write_then_unchanged() {
    let h = connected().await;
    let profile = BasalProfile::from_rates(&[0.85; 24]).unwrap();

    let first = h
        .controller
        .execute(Command::SetBasalProfile(profile.clone()))
        .await
        .unwrap();
    let second = h
        .controller
        .execute(Command::SetBasalProfile(profile))
        .await
        .unwrap();

    let (CommandResult::BasalProfile(first), CommandResult::BasalProfile(second)) = (first, second)
    else {
        panic!("expected profile results");
    };
    assert_eq!(first.outcome, ProfileWriteOutcome::Written);
    assert_eq!(second.outcome, ProfileWriteOutcome::Unchanged);
    assert_eq!(h.pump.written_profiles().len(), 1);
}

#[tokio::test]
async fn test_failed_profile_write_is_uncertain_and_retried() {
    let h = connected().await;
    let profile = BasalProfile::from_rates(&[1.0; 24]).unwrap();
    h.pump
        .fail_next(MockOperation::WriteBasalProfile, pumplink_api::Error::LinkLost);

    let result = h
        .controller
        .execute(Command::SetBasalProfile(profile))
        .await
        .unwrap();
    let CommandResult::BasalProfile(result) = result else {
        panic!("expected profile result");
    };
    assert_eq!(result.outcome, ProfileWriteOutcome::Uncertain);
    assert!(result.error.is_some());

    h.controller.disconnect(false).await;
    h.controller.connect().await.unwrap();

    assert_eq!(h.pump.written_profiles().len(), 1);
}

// ── Bolus delivery ──────────────────────────────────────────────────

#[tokio::test]
async fn test_bolus_is_confirmed_from_history() {
    let h = connected().await;

    let result = h.controller.execute(bolus(57)).await.unwrap();

    let CommandResult::Bolus(result) = result else {
        panic!("expected bolus result, got {result:?}");
    };
    assert!(result.success);
    assert_eq!(result.outcome, BolusOutcome::Completed);
    assert_eq!(result.enactment, Enactment::Enacted { amount: 57 });
    assert_eq!(h.controller.last_bolus().unwrap().amount, 57);
    assert_eq!(h.controller.state(), DriverState::Ready);

    let synced = h.records.records();
    assert_eq!(synced.len(), 1);
    assert!(matches!(
        synced[0],
        SyncAction::Bolus {
            amount: 57,
            tag: Some(BolusTag::Normal),
            ..
        }
    ));
}

#[tokio::test]
async fn test_pump_reported_amount_wins() {
    let h = connected().await;
    h.pump.set_infused_amount(40);

    let CommandResult::Bolus(result) = h.controller.execute(bolus(57)).await.unwrap() else {
        panic!("expected bolus result");
    };

    assert_eq!(result.requested, 57);
    assert_eq!(result.enactment, Enactment::Enacted { amount: 40 });
}

#[tokio::test]
async fn test_cancelled_bolus_reports_partial_amount() {
    let h = connected().await;
    h.pump.set_bolus_duration(Duration::from_secs(60));
    h.pump.set_partial_on_cancel(30);
    let started = h.pump.bolus_started();

    let handle = h
        .controller
        .spawn_bolus(BolusRequest::new(57, BolusTag::Smb));
    started.notified().await;
    handle.cancel();
    let result = handle.join().await.unwrap();

    assert_eq!(result.outcome, BolusOutcome::Cancelled);
    assert_eq!(result.enactment, Enactment::Enacted { amount: 30 });
    assert!(result.success);
    assert_eq!(h.controller.last_bolus().unwrap().amount, 30);
}

#[tokio::test]
async fn test_zero_bolus_is_rejected_without_touching_pump() {
    let h = connected().await;

    let result = h.controller.execute(bolus(0)).await;

    assert!(matches!(result, Err(CoreError::Validation { .. })));
    assert_eq!(h.pump.call_count(MockOperation::StartBolus), 0);
    assert_eq!(h.controller.state(), DriverState::Ready);
}

#[tokio::test]
async fn test_unaccounted_activity_aborts_bolus() {
    let h = connected().await;
    let mut rx = h.notifier.subscribe();
    let foreign = h
        .pump
        .push_history(HistoryRecordDetail::QuickBolusInfused { amount: 20 });

    let CommandResult::Bolus(result) = h.controller.execute(bolus(57)).await.unwrap() else {
        panic!("expected bolus result");
    };

    assert_eq!(result.outcome, BolusOutcome::AbortedUnaccountedActivity);
    assert_eq!(result.enactment, Enactment::NotEnacted);
    assert!(!result.success);
    assert_eq!(h.pump.call_count(MockOperation::StartBolus), 0);
    assert!(h.records.get(foreign).is_some());
    assert!(drain(&mut rx).contains(&Notification::UnaccountedActivity {
        counters: vec![foreign]
    }));
}

#[tokio::test]
async fn test_disconnect_during_bolus_waits_for_reconciliation() {
    let h = connected().await;
    h.pump.set_bolus_duration(Duration::from_millis(50));
    let started = h.pump.bolus_started();

    let handle = h.controller.spawn_bolus(BolusRequest::new(25, BolusTag::Normal));
    started.notified().await;

    assert_eq!(h.controller.disconnect(false).await, DisconnectOutcome::Deferred);
    assert_eq!(h.controller.state(), DriverState::ExecutingCommand);

    let result = handle.join().await.unwrap();

    assert_eq!(result.enactment, Enactment::Enacted { amount: 25 });
    assert_eq!(h.controller.state(), DriverState::Disconnected);
    assert!(!h.pump.is_connected());
}

#[tokio::test]
async fn test_alert_during_bolus_is_reported() {
    let h = connected().await;
    let mut rx = h.notifier.subscribe();
    let alert = AlertScreen {
        kind: AlertKind::Error,
        code: 7,
    };
    h.pump
        .fail_next(MockOperation::WaitBolus, pumplink_api::Error::Alert(alert));

    let CommandResult::Bolus(result) = h.controller.execute(bolus(30)).await.unwrap() else {
        panic!("expected bolus result");
    };

    assert_eq!(result.alert, Some(alert));
    assert_eq!(result.outcome, BolusOutcome::Failed);
    assert!(!result.success);
    assert!(result.error.is_some());
    assert!(result.verification_error.is_none());
    assert_eq!(h.pump.call_count(MockOperation::FetchHistory), 3);
    assert!(drain(&mut rx).contains(&Notification::DeviceAlert { alert }));
    assert_eq!(h.controller.state(), DriverState::Ready);
}

#[tokio::test]
async fn test_deferred_disconnect_rejects_new_commands() {
    let h = connected().await;
    h.pump.set_bolus_duration(Duration::from_millis(100));
    let started = h.pump.bolus_started();

    let handle = h.controller.spawn_bolus(BolusRequest::new(25, BolusTag::Normal));
    started.notified().await;
    assert_eq!(h.controller.disconnect(false).await, DisconnectOutcome::Deferred);

    let result = h.controller.execute(Command::ReadStatus).await;

    assert!(
        matches!(result, Err(CoreError::InvalidState { .. })),
        "got: {result:?}"
    );
    assert_eq!(h.pump.call_count(MockOperation::ReadStatus), 1);

    handle.join().await.unwrap();
    assert_eq!(h.controller.state(), DriverState::Disconnected);
}

#[tokio::test]
async fn test_command_queued_behind_deferred_disconnect_is_dropped() {
    let h = connected().await;
    h.pump.set_bolus_duration(Duration::from_millis(100));
    let started = h.pump.bolus_started();

    let handle = h.controller.spawn_bolus(BolusRequest::new(25, BolusTag::Normal));
    started.notified().await;

    // Admitted before the disconnect request, then parked on the command lock.
    let controller = h.controller.clone();
    let queued = tokio::spawn(async move { controller.execute(Command::ReadStatus).await });
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
    assert_eq!(h.controller.disconnect(false).await, DisconnectOutcome::Deferred);

    handle.join().await.unwrap();
    let result = queued.await.unwrap();

    assert!(
        matches!(result, Err(CoreError::InvalidState { .. })),
        "got: {result:?}"
    );
    assert_eq!(h.pump.call_count(MockOperation::ReadStatus), 1);
    assert_eq!(h.controller.state(), DriverState::Disconnected);
    assert!(!h.pump.is_connected());
}

#[test]
#[should_panic(expected = "runtime")]
fn test_spawn_bolus_requires_a_tokio_runtime() {
    let h = harness();
    let _handle = h.controller.spawn_bolus(BolusRequest::new(10, BolusTag::Normal));
}
