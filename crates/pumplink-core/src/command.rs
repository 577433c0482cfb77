// ── Command API ──
//
// Every therapy-affecting or status operation flows through a unified
// `Command` enum. The controller runs each one inside the command
// wrapper with the driver in `ExecutingCommand`.

use serde::Serialize;
use tracing::{info, warn};

use crate::bolus::{self, BolusRequest, BolusResult};
use crate::error::CoreError;
use crate::executor;
use crate::model::{BasalProfile, PumpStatus};
use crate::session::CommandContext;
use crate::sink::Notification;

/// All operations the driver runs against the pump on request.
///
/// Temporary basal rates and zero-basal-on-suspend are not supported yet
/// and have no variant; callers cannot ask for them by accident.
#[derive(Debug, Clone)]
pub enum Command {
    ReadStatus,
    DeliverBolus(BolusRequest),
    SetBasalProfile(BasalProfile),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadStatus => "read_status",
            Self::DeliverBolus(_) => "deliver_bolus",
            Self::SetBasalProfile(_) => "set_basal_profile",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandResult {
    Status(PumpStatus),
    Bolus(BolusResult),
    BasalProfile(ProfileWriteResult),
}

impl CommandResult {
    /// Attach a failed re-verification to a completed command.
    ///
    /// Therapy results keep what the pump did and carry the error
    /// alongside. A bare status read has nothing worth keeping.
    pub(crate) fn with_verification_error(self, error: &CoreError) -> Result<Self, CoreError> {
        match self {
            Self::Status(_) => Err(error.clone()),
            Self::Bolus(mut result) => {
                result.verification_error = Some(error.to_string());
                Ok(Self::Bolus(result))
            }
            Self::BasalProfile(mut result) => {
                result.verification_error = Some(error.to_string());
                Ok(Self::BasalProfile(result))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileWriteOutcome {
    /// The pump now runs the profile.
    Written,
    /// The profile already was the target; the pump was not touched.
    Unchanged,
    /// Not connected. The profile becomes the target and is written on
    /// the next connect.
    NotEnacted,
    /// The write failed after it began. The next connect rewrites it.
    Uncertain,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileWriteResult {
    pub outcome: ProfileWriteOutcome,
    pub error: Option<String>,
    pub verification_error: Option<String>,
}

impl ProfileWriteResult {
    pub(crate) fn new(outcome: ProfileWriteOutcome) -> Self {
        Self {
            outcome,
            error: None,
            verification_error: None,
        }
    }
}

// ── Routing ──────────────────────────────────────────────────────

pub(crate) async fn route(ctx: &CommandContext, cmd: Command) -> Result<CommandResult, CoreError> {
    match cmd {
        Command::ReadStatus => read_status(ctx).await.map(CommandResult::Status),
        Command::DeliverBolus(request) => bolus::deliver(ctx, request)
            .await
            .map(CommandResult::Bolus),
        Command::SetBasalProfile(profile) => Ok(CommandResult::BasalProfile(
            write_basal_profile(ctx, profile).await,
        )),
    }
}

/// Read and publish the pump status.
pub(crate) async fn read_status(ctx: &CommandContext) -> Result<PumpStatus, CoreError> {
    let report = ctx
        .guard(async { ctx.device.read_status().await.map_err(CoreError::from) })
        .await?;
    let status = PumpStatus::try_from(report)?;
    ctx.services.store.set_status(Some(status));
    Ok(status)
}

/// Make `profile` the target and write it to the pump.
///
/// Failures are folded into the result so that the caller can tell
/// "not written" from "possibly half-written".
async fn write_basal_profile(ctx: &CommandContext, profile: BasalProfile) -> ProfileWriteResult {
    let target = &ctx.services.profile;
    let unchanged = target
        .current()
        .is_some_and(|current| *current == profile);
    if unchanged && !target.force_pending() {
        return ProfileWriteResult::new(ProfileWriteOutcome::Unchanged);
    }

    target.set(profile.clone());
    if ctx.cancel.is_cancelled() {
        target.request_force();
        return ProfileWriteResult {
            outcome: ProfileWriteOutcome::NotEnacted,
            error: Some(CoreError::Cancelled.to_string()),
            verification_error: None,
        };
    }

    match ctx.device.write_basal_profile(profile.factors()).await {
        Ok(()) => {
            target.clear_force();
            ctx.services
                .notifier
                .notify(Notification::BasalProfileWritten);
            info!(daily_total = profile.daily_total(), "basal profile written");
            ProfileWriteResult::new(ProfileWriteOutcome::Written)
        }
        Err(e) => {
            target.request_force();
            let e = CoreError::from(e);
            executor::note_failure(&ctx.services, &e);
            warn!("basal profile write failed, rewrite scheduled for next connect");
            ProfileWriteResult {
                outcome: ProfileWriteOutcome::Uncertain,
                error: Some(e.to_string()),
                verification_error: None,
            }
        }
    }
}
