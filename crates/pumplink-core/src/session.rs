// ── Session internals ──
//
// The collaborators shared by the lifecycle manager, the verification
// pipeline and the command handlers, plus the handle of the one live
// device session.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwapOption;
use pumplink_api::PumpDevice;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::error::CoreError;
use crate::model::BasalProfile;
use crate::sink::{NotificationSink, TherapyRecordSink};
use crate::store::SessionStore;

/// Everything a device operation needs besides the device itself.
pub(crate) struct Services {
    pub config: SessionConfig,
    pub records: Arc<dyn TherapyRecordSink>,
    pub notifier: Arc<dyn NotificationSink>,
    pub clock: Arc<dyn Clock>,
    pub store: Arc<SessionStore>,
    pub profile: ProfileTarget,
}

// ── ProfileTarget ────────────────────────────────────────────────

/// The basal profile the pump should be running, and whether the next
/// verification must write it regardless of what the pump reports.
#[derive(Default)]
pub(crate) struct ProfileTarget {
    target: ArcSwapOption<BasalProfile>,
    force_write: AtomicBool,
}

impl ProfileTarget {
    pub fn current(&self) -> Option<Arc<BasalProfile>> {
        self.target.load_full()
    }

    pub fn set(&self, profile: BasalProfile) {
        self.target.store(Some(Arc::new(profile)));
    }

    pub fn clear(&self) {
        self.target.store(None);
        self.force_write.store(false, Ordering::SeqCst);
    }

    pub fn force_pending(&self) -> bool {
        self.force_write.load(Ordering::SeqCst)
    }

    pub fn request_force(&self) {
        self.force_write.store(true, Ordering::SeqCst);
    }

    pub fn clear_force(&self) {
        self.force_write.store(false, Ordering::SeqCst);
    }
}

// ── Session ──────────────────────────────────────────────────────

/// The exclusively-owned device handle of the current connection.
#[derive(Clone)]
pub(crate) struct Session {
    pub device: Arc<dyn PumpDevice>,
    /// Cancelled when the session is torn down.
    pub cancel: CancellationToken,
}

/// Slot for the current session. Never held across an await.
#[derive(Default)]
pub(crate) struct SessionSlot(Mutex<Option<Session>>);

impl SessionSlot {
    fn lock(&self) -> MutexGuard<'_, Option<Session>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self) -> Option<Session> {
        self.lock().clone()
    }

    pub fn replace(&self, session: Session) -> Option<Session> {
        self.lock().replace(session)
    }

    pub fn take(&self) -> Option<Session> {
        self.lock().take()
    }
}

// ── CommandContext ───────────────────────────────────────────────

/// What a command handler runs against.
pub(crate) struct CommandContext {
    pub services: Arc<Services>,
    pub device: Arc<dyn PumpDevice>,
    /// Cancelled when the command (or the whole session) is cancelled.
    pub cancel: CancellationToken,
}

impl CommandContext {
    /// Run `fut`, giving up with [`CoreError::Cancelled`] if the command
    /// is cancelled first.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T, CoreError>
    where
        F: Future<Output = Result<T, CoreError>>,
    {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(CoreError::Cancelled),
            result = fut => result,
        }
    }
}
