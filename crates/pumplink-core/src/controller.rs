// ── Controller abstraction ──
//
// Full lifecycle management for the single paired pump: pairing,
// connection, connect-time verification, command execution and
// (possibly deferred) teardown. State is published through the
// SessionStore.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use pumplink_api::{PumpConnector, PumpIdentity, ReplayCounterStore};
use serde::Serialize;
use strum::Display;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bolus::{BolusHandle, BolusRequest};
use crate::clock::{Clock, SystemClock};
use crate::command::{self, Command, CommandResult, ProfileWriteOutcome, ProfileWriteResult};
use crate::config::SessionConfig;
use crate::error::CoreError;
use crate::executor::{self, Wrapped};
use crate::identity::IdentityStore;
use crate::model::{BasalProfile, DriverState, LastBolus, PumpStatus};
use crate::session::{CommandContext, ProfileTarget, Services, Session, SessionSlot};
use crate::sink::{
    BroadcastNotifier, MemoryRecordSink, Notification, NotificationSink, TherapyRecordSink,
};
use crate::store::SessionStore;
use crate::stream::StateStream;
use crate::verify;

const TEARDOWN_POLL: Duration = Duration::from_millis(10);

// ── Collaborators ────────────────────────────────────────────────

/// External services the controller is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub identity: Arc<dyn IdentityStore>,
    pub connector: Arc<dyn PumpConnector>,
    pub records: Arc<dyn TherapyRecordSink>,
    pub notifier: Arc<dyn NotificationSink>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// In-memory record sink, broadcast notifier and system clock.
    pub fn new(identity: Arc<dyn IdentityStore>, connector: Arc<dyn PumpConnector>) -> Self {
        Self {
            identity,
            connector,
            records: Arc::new(MemoryRecordSink::new()),
            notifier: Arc::new(BroadcastNotifier::new()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_records(mut self, records: Arc<dyn TherapyRecordSink>) -> Self {
        self.records = records;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

// ── DisconnectOutcome ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DisconnectOutcome {
    Disconnected,
    /// An operation is running; the disconnect runs when it finishes.
    Deferred,
    AlreadyDisconnected,
    /// Another teardown is already underway.
    InProgress,
}

/// Busy accounting for deferred disconnects.
#[derive(Debug, Default)]
struct Gate {
    busy: usize,
    pending_disconnect: bool,
    tearing_down: bool,
}

// ── Controller ───────────────────────────────────────────────────

/// The main entry point for consumers.
///
/// Cheaply cloneable via `Arc<ControllerInner>`. Owns the one device
/// session and serializes every command through the command wrapper.
///
/// Requires a Tokio runtime: `connect`, `execute` and `spawn_bolus`
/// spawn tasks and panic when called outside one.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    services: Arc<Services>,
    identity: Arc<dyn IdentityStore>,
    connector: Arc<dyn PumpConnector>,
    session: SessionSlot,
    gate: Mutex<Gate>,
    command_lock: tokio::sync::Mutex<()>,
}

impl Controller {
    /// Create a controller in `NotInitialized`. Call [`start()`](Self::start)
    /// before connecting.
    pub fn new(config: SessionConfig, collaborators: Collaborators) -> Self {
        let services = Services {
            config,
            records: collaborators.records,
            notifier: collaborators.notifier,
            clock: collaborators.clock,
            store: Arc::new(SessionStore::new()),
            profile: ProfileTarget::default(),
        };

        Self {
            inner: Arc::new(ControllerInner {
                services: Arc::new(services),
                identity: collaborators.identity,
                connector: collaborators.connector,
                session: SessionSlot::default(),
                gate: Mutex::new(Gate::default()),
                command_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.services.config
    }

    /// Access the underlying SessionStore.
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.inner.services.store
    }

    fn gate(&self) -> MutexGuard<'_, Gate> {
        self.inner.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Process lifecycle ────────────────────────────────────────

    /// `NotInitialized` → `Disconnected`. Idempotent.
    pub fn start(&self) {
        if self
            .store()
            .transition(DriverState::NotInitialized, DriverState::Disconnected)
        {
            info!("pump driver started");
        }
    }

    /// Force a disconnect and return to `NotInitialized`.
    pub async fn shutdown(&self) {
        self.force_disconnect().await;
        self.store().force_state(DriverState::NotInitialized);
        info!("pump driver shut down");
    }

    // ── Pairing ──────────────────────────────────────────────────

    /// Store a freshly paired identity, replacing any previous one.
    ///
    /// Only allowed while disconnected. Reconciliation state tied to the
    /// old pump (status, last bolus, target profile) is discarded.
    pub fn pair(&self, identity: &PumpIdentity) -> Result<(), CoreError> {
        let state = self.state();
        if state.is_active() || self.inner.session.get().is_some() {
            return Err(CoreError::InvalidState { state });
        }
        self.inner.identity.create_identity(identity)?;
        self.reset_reconciliation();
        info!(address = %identity.address, pump_id = %identity.pump_id, "pump paired");
        Ok(())
    }

    /// Force a disconnect, then delete the stored identity.
    ///
    /// Returns whether an identity existed.
    pub async fn unpair(&self) -> Result<bool, CoreError> {
        self.force_disconnect().await;
        let existed = self.inner.identity.delete_identity()?;
        self.reset_reconciliation();
        info!(existed, "pump unpaired");
        Ok(existed)
    }

    pub fn is_paired(&self) -> Result<bool, CoreError> {
        Ok(self.inner.identity.load_identity()?.is_some())
    }

    fn reset_reconciliation(&self) {
        self.store().reset_reconciliation();
        self.inner.services.profile.clear();
    }

    // ── Connection lifecycle ─────────────────────────────────────

    /// Connect to the paired pump.
    ///
    /// A no-op while a session is active or being established. Opens the
    /// device, runs the verification pipeline and settles in `Ready` or
    /// `Suspended`. Any failure tears the half-open session down.
    pub async fn connect(&self) -> Result<(), CoreError> {
        let state = self.state();
        match state {
            DriverState::NotInitialized => return Err(CoreError::NotInitialized),
            DriverState::Disconnected => {}
            _ => {
                debug!(%state, "connect ignored, session already active");
                return Ok(());
            }
        }

        let identity = self.load_identity_for_connect()?;

        {
            let mut gate = self.gate();
            let state = self.state();
            if state != DriverState::Disconnected {
                debug!(%state, "connect ignored, session already active");
                return Ok(());
            }
            if gate.tearing_down {
                return Err(CoreError::InvalidState { state });
            }
            self.store()
                .transition(DriverState::Disconnected, DriverState::Connecting);
            gate.busy += 1;
        }

        // The attempt runs detached so that dropping the caller cannot
        // leave the busy count raised.
        let ctrl = self.clone();
        tokio::spawn(async move { ctrl.run_connect(identity).await })
            .await
            .map_err(|e| CoreError::Internal(format!("connect task failed: {e}")))?
    }

    fn load_identity_for_connect(&self) -> Result<PumpIdentity, CoreError> {
        match self.inner.identity.load_identity() {
            Ok(Some(identity)) => Ok(identity),
            Ok(None) => Err(CoreError::NotPaired),
            Err(CoreError::IdentityCorruption { message }) => {
                warn!(reason = %message, "stored pump identity is corrupt, unpairing");
                if let Err(e) = self.inner.identity.delete_identity() {
                    warn!(error = %e, "failed to delete corrupt identity");
                }
                self.reset_reconciliation();
                self.inner
                    .services
                    .notifier
                    .notify(Notification::IdentityCorrupted {
                        reason: message.clone(),
                    });
                Err(CoreError::IdentityCorruption { message })
            }
            Err(e) => Err(e),
        }
    }

    async fn run_connect(&self, identity: PumpIdentity) -> Result<(), CoreError> {
        let result = self.establish(&identity).await;
        if let Err(e) = &result {
            if e.is_cancellation() {
                debug!("connection attempt cancelled");
            } else {
                warn!(error = %e, "connection attempt failed");
            }
            self.force_disconnect().await;
        }
        self.leave_busy().await;
        result
    }

    async fn establish(&self, identity: &PumpIdentity) -> Result<(), CoreError> {
        let services = &self.inner.services;
        let store = &services.store;
        let timeout = services.config.connect_timeout;
        let counter: Arc<dyn ReplayCounterStore> = self.inner.identity.clone();
        let cancel = CancellationToken::new();

        info!(address = %identity.address, "connecting to pump");
        let link = async {
            let device = self.inner.connector.open(identity, counter).await?;
            self.inner.session.replace(Session {
                device: Arc::clone(&device),
                cancel: cancel.clone(),
            });
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(pumplink_api::Error::Cancelled),
                result = device.connect() => result?,
            }
            Ok::<_, pumplink_api::Error>(device)
        };
        let device = match tokio::time::timeout(timeout, link).await {
            Ok(Ok(device)) => device,
            Ok(Err(e)) => {
                let e = CoreError::from(e);
                executor::note_failure(services, &e);
                return Err(e);
            }
            Err(_) => {
                let e = CoreError::Timeout {
                    timeout_secs: timeout.as_secs(),
                };
                executor::note_failure(services, &e);
                return Err(e);
            }
        };

        let _lock = self.inner.command_lock.lock().await;
        if store.state() != DriverState::Connecting {
            // A forced disconnect won the race.
            return Err(CoreError::Cancelled);
        }

        let report = executor::wrap(services, device.as_ref(), || {
            verify::verify(services, device.as_ref())
        })
        .await?
        .into_result()?;
        let status = executor::wrap(services, device.as_ref(), || async {
            let report = device.read_status().await.map_err(CoreError::from)?;
            PumpStatus::try_from(report)
        })
        .await?
        .into_result()?;
        store.set_status(Some(status));

        let settled = if status.running {
            DriverState::Ready
        } else {
            DriverState::Suspended
        };
        if !store.transition(DriverState::Connecting, settled) {
            return Err(CoreError::Cancelled);
        }
        store.set_connected_at(Some(services.clock.now()));
        services
            .notifier
            .notify(Notification::ConnectionStatusChanged { state: settled });
        info!(
            state = %settled,
            clock = ?report.clock,
            profile = ?report.profile,
            synced_events = report.synced_events,
            "pump connected"
        );
        Ok(())
    }

    /// Disconnect from the pump.
    ///
    /// Without `force`, a disconnect requested while an operation runs is
    /// deferred and replayed once that operation finishes. With `force`
    /// (or when idle) the session is torn down immediately. Only one
    /// teardown proceeds at a time.
    pub async fn disconnect(&self, force: bool) -> DisconnectOutcome {
        {
            let mut gate = self.gate();
            if gate.tearing_down {
                return DisconnectOutcome::InProgress;
            }
            if !force && gate.busy > 0 {
                gate.pending_disconnect = true;
                info!(busy = gate.busy, "disconnect deferred until the running operation finishes");
                return DisconnectOutcome::Deferred;
            }
            gate.pending_disconnect = false;
            if !self.state().is_active() && self.inner.session.get().is_none() {
                return DisconnectOutcome::AlreadyDisconnected;
            }
            gate.tearing_down = true;
        }

        self.teardown().await;
        self.gate().tearing_down = false;
        DisconnectOutcome::Disconnected
    }

    async fn force_disconnect(&self) {
        while self.disconnect(true).await == DisconnectOutcome::InProgress {
            tokio::time::sleep(TEARDOWN_POLL).await;
        }
    }

    async fn teardown(&self) {
        let store = self.store();
        if let Some(session) = self.inner.session.take() {
            session.cancel.cancel();
            session.device.disconnect().await;
        }
        store.set_connected_at(None);

        let previous = store.state();
        if previous.is_active() {
            store.force_state(DriverState::Disconnected);
            self.inner
                .services
                .notifier
                .notify(Notification::ConnectionStatusChanged {
                    state: DriverState::Disconnected,
                });
        }
        info!(from = %previous, "pump disconnected");
    }

    fn enter_busy(&self) -> Result<(), CoreError> {
        let mut gate = self.gate();
        let state = self.state();
        match state {
            DriverState::NotInitialized => Err(CoreError::NotInitialized),
            DriverState::Disconnected => Err(CoreError::InvalidState { state }),
            // A deferred disconnect admits no new work.
            _ if gate.tearing_down || gate.pending_disconnect => {
                Err(CoreError::InvalidState { state })
            }
            _ => {
                gate.busy += 1;
                Ok(())
            }
        }
    }

    /// Leave the busy section and replay a deferred disconnect.
    async fn leave_busy(&self) {
        let replay = {
            let mut gate = self.gate();
            gate.busy = gate.busy.saturating_sub(1);
            gate.busy == 0 && std::mem::take(&mut gate.pending_disconnect)
        };
        if replay {
            info!("running deferred disconnect");
            self.disconnect(false).await;
        }
    }

    // ── Command execution ────────────────────────────────────────

    /// Execute a command against the pump.
    ///
    /// `SetBasalProfile` while disconnected only records the target
    /// profile; it is written on the next connect.
    pub async fn execute(&self, cmd: Command) -> Result<CommandResult, CoreError> {
        if let Command::SetBasalProfile(profile) = &cmd {
            match self.state() {
                DriverState::NotInitialized => return Err(CoreError::NotInitialized),
                DriverState::Disconnected => return Ok(self.defer_profile(profile.clone())),
                _ => {}
            }
        }

        let ctrl = self.clone();
        tokio::spawn(async move { ctrl.run_command(cmd, None).await })
            .await
            .map_err(|e| CoreError::Internal(format!("command task failed: {e}")))?
    }

    /// Start a bolus in the background.
    ///
    /// The handle's cancellation token is a child of the session token,
    /// so a teardown cancels the delivery too. The post-delivery history
    /// check always runs.
    pub fn spawn_bolus(&self, request: BolusRequest) -> BolusHandle {
        let cancel = self
            .inner
            .session
            .get()
            .map_or_else(CancellationToken::new, |session| session.cancel.child_token());
        let ctrl = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            match ctrl
                .run_command(Command::DeliverBolus(request), Some(token))
                .await?
            {
                CommandResult::Bolus(result) => Ok(result),
                other => Err(CoreError::Internal(format!(
                    "unexpected bolus command result: {other:?}"
                ))),
            }
        });
        BolusHandle::new(cancel, task)
    }

    fn defer_profile(&self, profile: BasalProfile) -> CommandResult {
        let target = &self.inner.services.profile;
        let unchanged = target.current().is_some_and(|current| *current == profile);
        if unchanged && !target.force_pending() {
            return CommandResult::BasalProfile(ProfileWriteResult::new(
                ProfileWriteOutcome::Unchanged,
            ));
        }
        target.set(profile);
        target.request_force();
        info!("basal profile stored, will be written on next connect");
        CommandResult::BasalProfile(ProfileWriteResult::new(ProfileWriteOutcome::NotEnacted))
    }

    async fn run_command(
        &self,
        cmd: Command,
        cancel: Option<CancellationToken>,
    ) -> Result<CommandResult, CoreError> {
        self.enter_busy()?;
        let (result, unverified) = self.run_locked(cmd, cancel).await;
        if unverified {
            warn!("pump could not be re-verified after reconnect, disconnecting");
            self.force_disconnect().await;
        }
        self.leave_busy().await;
        result
    }

    /// Run `cmd` under the command lock. The flag reports a failed
    /// re-verification; the caller must then tear the session down.
    async fn run_locked(
        &self,
        cmd: Command,
        cancel: Option<CancellationToken>,
    ) -> (Result<CommandResult, CoreError>, bool) {
        let services = &self.inner.services;
        let store = &services.store;

        let _lock = self.inner.command_lock.lock().await;
        let prior = store.state();
        // A disconnect requested while this command queued for the lock.
        if self.gate().pending_disconnect {
            return (Err(CoreError::InvalidState { state: prior }), false);
        }
        let Some(session) = self.inner.session.get() else {
            return (Err(CoreError::InvalidState { state: prior }), false);
        };
        if !prior.accepts_commands() || !store.transition(prior, DriverState::ExecutingCommand) {
            return (Err(CoreError::InvalidState { state: prior }), false);
        }

        let ctx = CommandContext {
            services: Arc::clone(services),
            device: session.device,
            cancel: cancel.unwrap_or_else(|| session.cancel.child_token()),
        };
        debug!(command = cmd.name(), "executing command");
        let wrapped =
            executor::wrap(services, ctx.device.as_ref(), || command::route(&ctx, cmd)).await;

        let settled = match store.status() {
            Some(status) if !status.running => DriverState::Suspended,
            _ => DriverState::Ready,
        };
        store.transition(DriverState::ExecutingCommand, settled);

        match wrapped {
            Ok(Wrapped {
                value,
                verification: Some(e),
            }) => (value.with_verification_error(&e), true),
            Ok(Wrapped {
                value,
                verification: None,
            }) => (Ok(value), false),
            Err(e) => (Err(e), false),
        }
    }

    // ── State observation ────────────────────────────────────────

    pub fn state(&self) -> DriverState {
        self.store().state()
    }

    pub fn subscribe_state(&self) -> StateStream<DriverState> {
        self.store().subscribe_state()
    }

    pub fn status(&self) -> Option<PumpStatus> {
        self.store().status()
    }

    pub fn subscribe_status(&self) -> StateStream<Option<PumpStatus>> {
        self.store().subscribe_status()
    }

    pub fn last_bolus(&self) -> Option<LastBolus> {
        self.store().last_bolus()
    }

    pub fn subscribe_last_bolus(&self) -> StateStream<Option<LastBolus>> {
        self.store().subscribe_last_bolus()
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.store().connected_at()
    }

    pub fn subscribe_connected_at(&self) -> StateStream<Option<DateTime<Utc>>> {
        self.store().subscribe_connected_at()
    }

    /// The last failure recorded by the command wrapper.
    pub fn last_failure(&self) -> Option<CoreError> {
        self.store().last_failure()
    }

    /// The basal profile the pump is reconciled against.
    pub fn target_profile(&self) -> Option<BasalProfile> {
        self.inner
            .services
            .profile
            .current()
            .map(|profile| (*profile).clone())
    }
}
