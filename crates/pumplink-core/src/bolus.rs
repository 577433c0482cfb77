// ── Bolus delivery reconciler ──
//
// Issues a bolus and then asks the pump's own history what was actually
// infused. The post-delivery history check runs in its own task so that
// cancelling the delivery can never skip it.

use std::sync::Arc;

use pumplink_api::{AlertScreen, PumpDevice};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::classify::{BolusTag, ExpectedBolus, HistoryDelta};
use crate::error::CoreError;
use crate::executor;
use crate::session::{CommandContext, Services};
use crate::verify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BolusRequest {
    /// Amount in 0.1 IU steps.
    pub amount: u32,
    pub tag: BolusTag,
}

impl BolusRequest {
    pub fn new(amount: u32, tag: BolusTag) -> Self {
        Self { amount, tag }
    }
}

/// What the pump's history says happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "enactment", rename_all = "snake_case")]
pub enum Enactment {
    /// Nothing was infused.
    NotEnacted,
    /// History confirms `amount` (0.1 IU steps) was infused.
    Enacted { amount: u32 },
    /// Delivery may have started but history could not confirm it.
    Uncertain,
}

impl Enactment {
    pub fn is_enacted(self) -> bool {
        matches!(self, Self::Enacted { .. })
    }
}

/// How the delivery itself ended, independent of what history says.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BolusOutcome {
    Completed,
    Cancelled,
    Failed,
    /// History showed activity this driver did not initiate, so the
    /// bolus was never started.
    AbortedUnaccountedActivity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BolusResult {
    pub requested: u32,
    pub tag: BolusTag,
    pub success: bool,
    pub enactment: Enactment,
    pub outcome: BolusOutcome,
    pub alert: Option<AlertScreen>,
    pub error: Option<String>,
    /// Re-verification after an implicit reconnect failed. The delivery
    /// fields still describe what happened; the session was torn down.
    pub verification_error: Option<String>,
}

impl BolusResult {
    fn aborted(request: BolusRequest) -> Self {
        Self {
            requested: request.amount,
            tag: request.tag,
            success: false,
            enactment: Enactment::NotEnacted,
            outcome: BolusOutcome::AbortedUnaccountedActivity,
            alert: None,
            error: None,
            verification_error: None,
        }
    }
}

/// Deliver `request` and reconcile it against history.
///
/// `Err` means nothing was started. Once the pump accepted the bolus the
/// result is always `Ok` and carries what history confirmed.
pub(crate) async fn deliver(
    ctx: &CommandContext,
    request: BolusRequest,
) -> Result<BolusResult, CoreError> {
    if request.amount == 0 {
        return Err(CoreError::Validation {
            message: "bolus amount must be greater than zero".into(),
        });
    }
    let services = &ctx.services;
    let device = ctx.device.as_ref();

    // Neither the history fetch nor the start command is interrupted
    // half-way: cancellation is only honoured between exchanges.
    ensure_not_cancelled(&ctx.cancel)?;
    let pre = verify::reconcile_history(services, device, None).await?;
    if pre.has_unaccounted_activity() {
        warn!(
            counters = ?pre.unaccounted,
            requested = request.amount,
            "unaccounted pump activity, bolus aborted before delivery"
        );
        return Ok(BolusResult::aborted(request));
    }

    ensure_not_cancelled(&ctx.cancel)?;
    let counter = device.start_bolus(request.amount).await?;
    info!(counter, requested = request.amount, tag = %request.tag, "bolus started");

    let (outcome, alert, error) = match device.wait_bolus(counter, &ctx.cancel).await {
        Ok(()) => (BolusOutcome::Completed, None, None),
        Err(pumplink_api::Error::Cancelled) => {
            info!(counter, "bolus cancelled");
            (BolusOutcome::Cancelled, None, None)
        }
        Err(e) => {
            let e = CoreError::from(e);
            executor::note_failure(services, &e);
            let alert = match &e {
                CoreError::DeviceAlert { alert } => Some(*alert),
                _ => None,
            };
            (BolusOutcome::Failed, alert, Some(e.to_string()))
        }
    };

    let expected = ExpectedBolus {
        counter,
        tag: request.tag,
    };
    let check = post_delivery_check(
        Arc::clone(&ctx.services),
        Arc::clone(&ctx.device),
        expected,
    )
    .await;

    Ok(reconcile(request, outcome, alert, error, check))
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<(), CoreError> {
    if cancel.is_cancelled() {
        Err(CoreError::Cancelled)
    } else {
        Ok(())
    }
}

/// Fetch the history delta in a detached task. Cancelling or dropping
/// the caller does not stop it.
async fn post_delivery_check(
    services: Arc<Services>,
    device: Arc<dyn PumpDevice>,
    expected: ExpectedBolus,
) -> Result<HistoryDelta, CoreError> {
    let task = tokio::spawn(async move {
        verify::reconcile_history(&services, device.as_ref(), Some(expected)).await
    });
    task.await
        .map_err(|e| CoreError::Internal(format!("history check task failed: {e}")))?
}

fn reconcile(
    request: BolusRequest,
    outcome: BolusOutcome,
    alert: Option<AlertScreen>,
    error: Option<String>,
    check: Result<HistoryDelta, CoreError>,
) -> BolusResult {
    let (success, enactment, error) = match check {
        Ok(delta) => match delta.expected_amount {
            Some(0) => (outcome != BolusOutcome::Failed, Enactment::NotEnacted, error),
            Some(amount) => (
                outcome != BolusOutcome::Failed,
                Enactment::Enacted { amount },
                error,
            ),
            None => {
                warn!(requested = request.amount, "bolus missing from pump history");
                (
                    false,
                    Enactment::NotEnacted,
                    error.or_else(|| Some("bolus not found in pump history".into())),
                )
            }
        },
        Err(e) => {
            warn!(error = %e, "post-bolus history check failed, amount uncertain");
            (false, Enactment::Uncertain, Some(e.to_string()))
        }
    };

    BolusResult {
        requested: request.amount,
        tag: request.tag,
        success,
        enactment,
        outcome,
        alert,
        error,
        verification_error: None,
    }
}

// ── BolusHandle ──────────────────────────────────────────────────

/// A bolus running in the background.
pub struct BolusHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<Result<BolusResult, CoreError>>,
}

impl BolusHandle {
    pub(crate) fn new(
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<Result<BolusResult, CoreError>>,
    ) -> Self {
        Self { cancel, task }
    }

    /// Ask the pump to stop infusing. The history check still runs.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for delivery and reconciliation to finish.
    pub async fn join(self) -> Result<BolusResult, CoreError> {
        self.task
            .await
            .map_err(|e| CoreError::Internal(format!("bolus task failed: {e}")))?
    }
}
