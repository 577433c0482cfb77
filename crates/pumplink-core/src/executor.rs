// ── Command execution wrapper ──
//
// The single choke point for every command-carrying exchange with the
// pump. Captures device alerts, re-verifies after an implicit reconnect
// and records failures. Deferred disconnects are replayed by the
// lifecycle manager once the wrapped operation has returned.

use std::future::Future;

use pumplink_api::PumpDevice;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::session::Services;
use crate::sink::Notification;
use crate::verify;

/// A completed operation plus the outcome of any re-verification.
#[derive(Debug)]
pub(crate) struct Wrapped<T> {
    pub value: T,
    /// Set when the link was re-established during the operation and
    /// the verification pipeline then failed. The session is no longer
    /// trustworthy.
    pub verification: Option<CoreError>,
}

impl<T> Wrapped<T> {
    /// Treat a failed re-verification as the operation's own failure.
    pub fn into_result(self) -> Result<T, CoreError> {
        match self.verification {
            Some(e) => Err(e),
            None => Ok(self.value),
        }
    }
}

/// Run `op` against `device`.
///
/// On success, if the channel had to re-establish the link while `op`
/// ran, the verification pipeline runs again. Its failure never replaces
/// the value `op` produced; it is returned alongside it.
pub(crate) async fn wrap<T, F, Fut>(
    services: &Services,
    device: &dyn PumpDevice,
    op: F,
) -> Result<Wrapped<T>, CoreError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    let reconnects_before = device.reconnect_count();

    let value = match op().await {
        Ok(value) => value,
        Err(e) => {
            note_failure(services, &e);
            return Err(e);
        }
    };

    if device.reconnect_count() == reconnects_before {
        return Ok(Wrapped {
            value,
            verification: None,
        });
    }

    info!("link was re-established during command, re-verifying pump");
    let verification = verify::verify(services, device).await.err();
    if let Some(e) = &verification {
        warn!(error = %e, "re-verification after reconnect failed");
        note_failure(services, e);
    }
    Ok(Wrapped {
        value,
        verification,
    })
}

/// Surface a failure the way the wrapper does.
///
/// Alerts go to the notification sink, cancellation is only logged at
/// debug, everything else is recorded for [`last_failure`].
///
/// [`last_failure`]: crate::Controller::last_failure
pub(crate) fn note_failure(services: &Services, error: &CoreError) {
    match error {
        CoreError::Cancelled => {
            debug!("command cancelled");
            return;
        }
        CoreError::DeviceAlert { alert } => {
            warn!(%alert, "pump raised an alert");
            services
                .notifier
                .notify(Notification::DeviceAlert { alert: *alert });
        }
        other => warn!(error = %other, "command failed"),
    }
    services.store.record_failure(error.clone());
}
