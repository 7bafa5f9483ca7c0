//! Runner: claims an action and advances it by exactly one step.
//!
//! Every write back to the store is conditional on the state observed at
//! claim time (status, step, attempt count and heartbeat). A runner that
//! lost the action to a concurrent one, or whose claim went stale while the
//! platform call was in flight, finds its write rejected and reports
//! `Transition::Skipped` instead of clobbering newer progress.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::platform::{CredentialResolver, PlatformApi};

use super::action::{Action, ActionLogEntry, ActionStatus, LogLevel, Step};
use super::db::{with_store, ActionDb, ClaimRequest};
use super::executor::{self, StepOutcome};
use super::machine::Resolution;
use super::retry::{RetryDecision, RetryPolicy};
use super::sweeper::SweepReport;

/// What one `advance` call did to an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Advanced,
    Polled,
    Degraded,
    Succeeded,
    Failed,
    Rescheduled,
    /// Not claimable, or the write lost to a concurrent runner.
    Skipped,
    /// The cycle deadline hit mid-step; the claim is left to go stale.
    HandedOff,
}

impl Transition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Advanced => "advanced",
            Self::Polled => "polled",
            Self::Degraded => "degraded",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Rescheduled => "rescheduled",
            Self::Skipped => "skipped",
            Self::HandedOff => "handed_off",
        }
    }
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-outcome counts for one dispatch cycle (or one partition of it).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub selected: usize,
    pub advanced: usize,
    pub polled: usize,
    pub degraded: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rescheduled: usize,
    pub skipped: usize,
    pub handed_off: usize,
    pub errors: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep: Option<SweepReport>,
}

impl CycleReport {
    pub fn record(&mut self, transition: Transition) {
        let slot = match transition {
            Transition::Advanced => &mut self.advanced,
            Transition::Polled => &mut self.polled,
            Transition::Degraded => &mut self.degraded,
            Transition::Succeeded => &mut self.succeeded,
            Transition::Failed => &mut self.failed,
            Transition::Rescheduled => &mut self.rescheduled,
            Transition::Skipped => &mut self.skipped,
            Transition::HandedOff => &mut self.handed_off,
        };
        *slot += 1;
    }

    /// Fold a partition's counts into this report. `selected` and `sweep`
    /// belong to the cycle and are left alone.
    pub fn merge(&mut self, other: &CycleReport) {
        self.advanced += other.advanced;
        self.polled += other.polled;
        self.degraded += other.degraded;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.rescheduled += other.rescheduled;
        self.skipped += other.skipped;
        self.handed_off += other.handed_off;
        self.errors += other.errors;
    }

    /// Actions whose step ran to a persisted transition.
    pub fn progressed(&self) -> usize {
        self.advanced
            + self.polled
            + self.degraded
            + self.succeeded
            + self.failed
            + self.rescheduled
    }
}

pub struct Runner {
    db: Arc<ActionDb>,
    platform: Arc<dyn PlatformApi>,
    credentials: Arc<dyn CredentialResolver>,
    policy: RetryPolicy,
    stale_after: chrono::Duration,
}

impl Runner {
    pub fn new(
        db: Arc<ActionDb>,
        platform: Arc<dyn PlatformApi>,
        credentials: Arc<dyn CredentialResolver>,
        policy: RetryPolicy,
        stale_after: chrono::Duration,
    ) -> Self {
        Self {
            db,
            platform,
            credentials,
            policy,
            stale_after,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Claim action `id` and run one step of it.
    ///
    /// `now` is the logical time of the cycle: it stamps the claim, the
    /// heartbeat and every timestamp written. `deadline` bounds the platform
    /// call. `force` ignores `scheduled_for`.
    pub async fn advance(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        deadline: Instant,
        force: bool,
    ) -> Result<Transition> {
        let req = ClaimRequest {
            now,
            stale_before: now - self.stale_after,
            max_attempts: self.policy.max_attempts,
            force,
        };
        let Some(claimed) = with_store(&self.db, move |db| db.claim(id, req)).await? else {
            debug!(action_id = %id, "not claimable, skipping");
            return Ok(Transition::Skipped);
        };

        let machine = claimed.operation.machine();
        let step = match machine.resume_at(claimed.current_step) {
            Ok(step) => step,
            Err(e) => {
                // Stored position is not part of this operation's table.
                let resolution = Resolution::Fail {
                    message: e.to_string(),
                };
                let step = claimed.current_step.unwrap_or_else(|| machine.initial());
                return self.apply(&claimed, step, resolution, now).await;
            }
        };
        debug!(
            action_id = %claimed.id,
            owner = %claimed.owner,
            step = %step,
            attempt = claimed.attempt_count,
            "claimed"
        );

        let Some(cred) = self.credentials.resolve(&claimed.credential_ref) else {
            let resolution = Resolution::Fail {
                message: format!("no credential available for '{}'", claimed.credential_ref),
            };
            return self.apply(&claimed, step, resolution, now).await;
        };

        let outcome = match timeout_at(
            deadline,
            executor::execute(self.platform.as_ref(), &cred, &claimed, step),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    action_id = %claimed.id,
                    owner = %claimed.owner,
                    step = %step,
                    "cycle budget exhausted mid-step, handing off"
                );
                return Ok(Transition::HandedOff);
            }
        };

        let outcome = match outcome {
            StepOutcome::Poll(detail) if claimed.deadline_passed(now) => {
                executor::window_elapsed(step, &detail)
            }
            other => other,
        };

        let resolution = machine
            .resolve(step, outcome)
            .unwrap_or_else(|e| Resolution::Fail {
                message: e.to_string(),
            });
        self.apply(&claimed, step, resolution, now).await
    }

    /// Persist `resolution` for `claimed`, guarded on the claimed state, and
    /// append the matching log entry.
    async fn apply(
        &self,
        claimed: &Action,
        step: Step,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let (transition, level, message) = describe(claimed, step, &resolution, &self.policy, now);

        let id = claimed.id;
        let (seen_step, seen_attempts, seen_beat) = (
            claimed.current_step,
            claimed.attempt_count,
            claimed.last_heartbeat,
        );
        let guard = move |a: &Action| {
            a.status == ActionStatus::Running
                && a.current_step == seen_step
                && a.attempt_count == seen_attempts
                && a.last_heartbeat == seen_beat
        };
        let policy = self.policy;
        let mutate = move |a: &mut Action| match resolution {
            Resolution::Advance { next, data } => {
                a.current_step = Some(next);
                a.step_data.extend(data);
                a.touch(now);
            }
            Resolution::Stay { .. } => {
                a.current_step = Some(step);
                a.touch(now);
            }
            Resolution::Degrade { next, reason: _, data } => {
                a.current_step = Some(next);
                a.step_data.extend(data);
                a.touch(now);
            }
            Resolution::Complete { data } => {
                a.current_step = Some(step);
                a.step_data.extend(data);
                a.touch(now);
                a.error_message = None;
                a.finish(ActionStatus::Succeeded, now);
            }
            Resolution::Fail { message } => {
                a.current_step = Some(step);
                a.attempt_count += 1;
                a.touch(now);
                a.error_message = Some(message);
                a.finish(ActionStatus::Failed, now);
            }
            Resolution::Retry { message } => {
                a.current_step = Some(step);
                a.attempt_count += 1;
                a.touch(now);
                a.error_message = Some(message);
                match policy.decide(a.attempt_count, a.retry_until, now) {
                    RetryDecision::RetryAt(at) => {
                        a.status = ActionStatus::Scheduled;
                        a.scheduled_for = Some(at);
                    }
                    RetryDecision::GiveUp => a.finish(ActionStatus::Failed, now),
                }
            }
        };
        let written = with_store(&self.db, move |db| db.update_if(id, guard, mutate)).await?;

        if written.is_none() {
            debug!(
                action_id = %claimed.id,
                step = %step,
                "superseded by a concurrent update, result discarded"
            );
            return Ok(Transition::Skipped);
        }

        match level {
            LogLevel::Info => info!(
                action_id = %claimed.id,
                owner = %claimed.owner,
                step = %step,
                "{message}"
            ),
            LogLevel::Warn => warn!(
                action_id = %claimed.id,
                owner = %claimed.owner,
                step = %step,
                "{message}"
            ),
            LogLevel::Error => error!(
                action_id = %claimed.id,
                owner = %claimed.owner,
                step = %step,
                "{message}"
            ),
        }
        let entry = ActionLogEntry::new(claimed.id, level, Some(step), message, now);
        if let Err(e) = with_store(&self.db, move |db| db.append_log(&entry)).await {
            error!(action_id = %claimed.id, error = %e, "failed to append action log");
        }
        Ok(transition)
    }

    /// Run one owner's actions in order, one step each, until done or the
    /// deadline passes. Actions not reached are counted as handed off.
    pub async fn run_partition(
        &self,
        owner: &str,
        ids: &[Uuid],
        now: DateTime<Utc>,
        deadline: Instant,
    ) -> CycleReport {
        let mut report = CycleReport::default();
        for (i, id) in ids.iter().enumerate() {
            if Instant::now() >= deadline {
                report.handed_off += ids.len() - i;
                debug!(owner, remaining = ids.len() - i, "partition out of budget");
                break;
            }
            match self.advance(*id, now, deadline, false).await {
                Ok(t) => report.record(t),
                Err(e) => {
                    error!(action_id = %id, owner, error = %e, "advancing action failed");
                    report.errors += 1;
                }
            }
        }
        report
    }
}

/// The transition, log level and log message a resolution produces.
fn describe(
    claimed: &Action,
    step: Step,
    resolution: &Resolution,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> (Transition, LogLevel, String) {
    match resolution {
        Resolution::Advance { next, .. } => (
            Transition::Advanced,
            LogLevel::Info,
            format!("{step} done, next step {next}"),
        ),
        Resolution::Stay { detail } => (
            Transition::Polled,
            LogLevel::Info,
            format!("{step} waiting: {detail}"),
        ),
        Resolution::Degrade { next, reason, .. } => (
            Transition::Degraded,
            LogLevel::Warn,
            format!("{step} skipped, continuing at {next}: {reason}"),
        ),
        Resolution::Complete { .. } => (
            Transition::Succeeded,
            LogLevel::Info,
            format!("{step} done, {} succeeded", claimed.operation),
        ),
        Resolution::Fail { message } => (
            Transition::Failed,
            LogLevel::Error,
            format!("failed: {message}"),
        ),
        Resolution::Retry { message } => {
            let attempts = claimed.attempt_count + 1;
            match policy.decide(attempts, claimed.retry_until, now) {
                RetryDecision::RetryAt(at) => (
                    Transition::Rescheduled,
                    LogLevel::Warn,
                    format!(
                        "{message}; attempt {attempts}/{}, retrying at {}",
                        policy.max_attempts,
                        at.to_rfc3339()
                    ),
                ),
                RetryDecision::GiveUp => (
                    Transition::Failed,
                    LogLevel::Error,
                    format!("{message}; giving up after {attempts} attempt(s)"),
                ),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
