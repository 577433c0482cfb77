// ── Scripted in-memory pump ──
//
// A `PumpDevice` whose clock, status, history and failures are set up
// by the test. Each exchange bumps the attached replay counter exactly
// like a real channel would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDateTime, Timelike, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::device::{HistoryRecord, HistoryRecordDetail, PumpConnector, PumpDevice, StatusReport};
use crate::error::Error;
use crate::pairing::{PumpIdentity, ReplayCounterStore};

/// The exchange kinds a [`MockPump`] records and can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    Connect,
    ReadStatus,
    ReadTime,
    WriteTime,
    FetchHistory,
    ReadBasalFactor,
    WriteBasalProfile,
    StartBolus,
    WaitBolus,
}

struct MockState {
    connected: bool,
    device_time: NaiveDateTime,
    ignore_time_writes: bool,
    status: StatusReport,
    history: Vec<HistoryRecord>,
    next_counter: u64,
    basal_factor: u32,
    written_profiles: Vec<Vec<u32>>,
    failures: HashMap<MockOperation, Error>,
    reconnect_next_exchange: bool,
    calls: Vec<MockOperation>,
    bolus_duration: Duration,
    partial_on_cancel: u32,
    infused_override: Option<u32>,
    active_bolus: Option<(u64, u32)>,
}

// ── MockPump ─────────────────────────────────────────────────────

pub struct MockPump {
    state: Mutex<MockState>,
    counter: Mutex<Option<Arc<dyn ReplayCounterStore>>>,
    connect_gate: Mutex<Option<Arc<Notify>>>,
    bolus_started: Arc<Notify>,
    reconnects: AtomicU64,
}

impl Default for MockPump {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPump {
    /// A running pump with a full battery and reservoir whose clock reads
    /// the current UTC time. The clock does not advance on its own.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                connected: false,
                device_time: Utc::now().naive_utc(),
                ignore_time_writes: false,
                status: StatusReport {
                    running: true,
                    battery_code: 2,
                    reservoir_code: 2,
                    reservoir_units: 300,
                },
                history: Vec::new(),
                next_counter: 1,
                basal_factor: 0,
                written_profiles: Vec::new(),
                failures: HashMap::new(),
                reconnect_next_exchange: false,
                calls: Vec::new(),
                bolus_duration: Duration::from_millis(10),
                partial_on_cancel: 0,
                infused_override: None,
                active_bolus: None,
            }),
            counter: Mutex::new(None),
            connect_gate: Mutex::new(None),
            bolus_started: Arc::new(Notify::new()),
            reconnects: AtomicU64::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Scripting ────────────────────────────────────────────────

    pub fn attach_counter(&self, counter: Arc<dyn ReplayCounterStore>) {
        *self.counter.lock().unwrap_or_else(PoisonError::into_inner) = Some(counter);
    }

    pub fn set_device_time(&self, time: NaiveDateTime) {
        self.state().device_time = time;
    }

    /// Make the pump acknowledge time writes without applying them.
    pub fn ignore_time_writes(&self, ignore: bool) {
        self.state().ignore_time_writes = ignore;
    }

    pub fn set_status(&self, status: StatusReport) {
        self.state().status = status;
    }

    pub fn set_running(&self, running: bool) {
        self.state().status.running = running;
    }

    pub fn set_basal_factor(&self, factor: u32) {
        self.state().basal_factor = factor;
    }

    /// Append an entry to the pending history delta, returning its counter.
    pub fn push_history(&self, detail: HistoryRecordDetail) -> u64 {
        let mut state = self.state();
        let counter = state.next_counter;
        state.next_counter += 1;
        let timestamp = state.device_time;
        state.history.push(HistoryRecord {
            event_counter: counter,
            timestamp,
            detail,
        });
        counter
    }

    /// Fail the next call of `op` with `error`. One-shot.
    pub fn fail_next(&self, op: MockOperation, error: Error) {
        self.state().failures.insert(op, error);
    }

    /// Simulate a dropped and transparently re-established link during
    /// the next successful exchange.
    pub fn reconnect_on_next_exchange(&self) {
        self.state().reconnect_next_exchange = true;
    }

    pub fn set_bolus_duration(&self, duration: Duration) {
        self.state().bolus_duration = duration;
    }

    /// Amount logged when a running bolus is cancelled.
    pub fn set_partial_on_cancel(&self, amount: u32) {
        self.state().partial_on_cancel = amount;
    }

    /// Amount logged when a bolus completes, instead of the requested one.
    pub fn set_infused_amount(&self, amount: u32) {
        self.state().infused_override = Some(amount);
    }

    /// Block `connect()` until the returned gate is notified.
    pub fn hold_connect(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self
            .connect_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&gate));
        gate
    }

    /// Notified once each time a bolus has been accepted by the pump.
    pub fn bolus_started(&self) -> Arc<Notify> {
        Arc::clone(&self.bolus_started)
    }

    // ── Inspection ───────────────────────────────────────────────

    pub fn device_time(&self) -> NaiveDateTime {
        self.state().device_time
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn calls(&self) -> Vec<MockOperation> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, op: MockOperation) -> usize {
        self.state().calls.iter().filter(|c| **c == op).count()
    }

    pub fn written_profiles(&self) -> Vec<Vec<u32>> {
        self.state().written_profiles.clone()
    }

    // ── Internals ────────────────────────────────────────────────

    fn exchange(&self, op: MockOperation) -> Result<(), Error> {
        let mut state = self.state();
        state.calls.push(op);
        if let Some(err) = state.failures.remove(&op) {
            trace!(?op, error = %err, "scripted failure");
            return Err(err);
        }
        if std::mem::take(&mut state.reconnect_next_exchange) {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            trace!(?op, "scripted implicit reconnect");
        }
        drop(state);
        self.bump_counter()
    }

    fn bump_counter(&self) -> Result<(), Error> {
        let counter = self
            .counter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(store) = counter {
            let next = store.replay_counter()? + 1;
            store.set_replay_counter(next)?;
        }
        Ok(())
    }
}

#[async_trait]
impl PumpDevice for MockPump {
    async fn connect(&self) -> Result<(), Error> {
        let gate = self
            .connect_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.exchange(MockOperation::Connect)?;
        self.state().connected = true;
        Ok(())
    }

    async fn disconnect(&self) {
        self.state().connected = false;
    }

    fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    async fn read_status(&self) -> Result<StatusReport, Error> {
        self.exchange(MockOperation::ReadStatus)?;
        Ok(self.state().status)
    }

    async fn read_time(&self) -> Result<NaiveDateTime, Error> {
        self.exchange(MockOperation::ReadTime)?;
        Ok(self.state().device_time)
    }

    async fn write_time(&self, time: NaiveDateTime) -> Result<(), Error> {
        self.exchange(MockOperation::WriteTime)?;
        let mut state = self.state();
        if !state.ignore_time_writes {
            state.device_time = time;
        }
        Ok(())
    }

    async fn fetch_history_delta(&self) -> Result<Vec<HistoryRecord>, Error> {
        self.exchange(MockOperation::FetchHistory)?;
        Ok(std::mem::take(&mut self.state().history))
    }

    async fn read_current_basal_factor(&self) -> Result<u32, Error> {
        self.exchange(MockOperation::ReadBasalFactor)?;
        Ok(self.state().basal_factor)
    }

    async fn write_basal_profile(&self, factors: &[u32]) -> Result<(), Error> {
        self.exchange(MockOperation::WriteBasalProfile)?;
        let mut state = self.state();
        let hour = usize::try_from(state.device_time.hour()).unwrap_or_default();
        if let Some(factor) = factors.get(hour) {
            state.basal_factor = *factor;
        }
        state.written_profiles.push(factors.to_vec());
        Ok(())
    }

    async fn start_bolus(&self, amount: u32) -> Result<u64, Error> {
        self.exchange(MockOperation::StartBolus)?;
        let counter = {
            let mut state = self.state();
            let counter = state.next_counter;
            state.next_counter += 1;
            state.active_bolus = Some((counter, amount));
            counter
        };
        self.bolus_started.notify_one();
        Ok(counter)
    }

    async fn wait_bolus(&self, event_counter: u64, cancel: &CancellationToken) -> Result<(), Error> {
        self.exchange(MockOperation::WaitBolus)?;
        let duration = self.state().bolus_duration;

        let cancelled = tokio::select! {
            () = tokio::time::sleep(duration) => false,
            () = cancel.cancelled() => true,
        };

        let mut state = self.state();
        let requested = match state.active_bolus.take() {
            Some((counter, amount)) if counter == event_counter => amount,
            _ => {
                return Err(Error::UnexpectedResponse {
                    message: format!("no active bolus with counter {event_counter}"),
                });
            }
        };
        let amount = if cancelled {
            state.partial_on_cancel
        } else {
            state.infused_override.unwrap_or(requested)
        };
        let timestamp = state.device_time;
        state.history.push(HistoryRecord {
            event_counter,
            timestamp,
            detail: HistoryRecordDetail::StandardBolusInfused {
                amount,
                manual: false,
            },
        });

        if cancelled {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ── MockConnector ────────────────────────────────────────────────

pub struct MockConnector {
    pump: Arc<MockPump>,
    fail_open: Mutex<Option<Error>>,
    opens: AtomicUsize,
}

impl MockConnector {
    pub fn new(pump: Arc<MockPump>) -> Self {
        Self {
            pump,
            fail_open: Mutex::new(None),
            opens: AtomicUsize::new(0),
        }
    }

    pub fn pump(&self) -> &Arc<MockPump> {
        &self.pump
    }

    /// Fail the next `open()` with `error`. One-shot.
    pub fn fail_next_open(&self, error: Error) {
        *self.fail_open.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PumpConnector for MockConnector {
    async fn open(
        &self,
        identity: &PumpIdentity,
        counter: Arc<dyn ReplayCounterStore>,
    ) -> Result<Arc<dyn PumpDevice>, Error> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self
            .fail_open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            return Err(err);
        }
        trace!(address = %identity.address, "mock device opened");
        self.pump.attach_counter(counter);
        let device: Arc<dyn PumpDevice> = self.pump.clone();
        Ok(device)
    }
}
