//! One bounded dispatch cycle per external trigger.
//!
//! A cycle selects due `Scheduled` actions and stale `Running` ones,
//! partitions them by owner, and runs each partition as its own task under a
//! shared deadline. Unfinished work stays in the store for the next cycle.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{Config, DispatchConfig, RetryConfig};
use crate::error::{EngineError, Result};
use crate::paths;
use crate::platform::{CredentialResolver, PlatformApi};

use super::action::{Action, NewAction};
use super::db::{with_store, ActionDb};
use super::retry::RetryPolicy;
use super::runner::{CycleReport, Runner, Transition};
use super::sweeper::{SweepReport, Sweeper};

/// Extra time granted to partition tasks past the cycle budget before they
/// are aborted. Covers the final store write after a step returns.
const ABORT_GRACE: Duration = Duration::from_secs(2);

pub struct Orchestrator {
    db: Arc<ActionDb>,
    runner: Arc<Runner>,
    sweeper: Arc<Sweeper>,
    dispatch: DispatchConfig,
    retry: RetryConfig,
}

impl Orchestrator {
    pub fn new(
        db: Arc<ActionDb>,
        platform: Arc<dyn PlatformApi>,
        credentials: Arc<dyn CredentialResolver>,
        config: &Config,
    ) -> Self {
        let runner = Runner::new(
            db.clone(),
            platform,
            credentials,
            RetryPolicy::from_config(&config.retry),
            config.dispatch.stale_after(),
        );
        Self {
            sweeper: Arc::new(Sweeper::new(db.clone(), config.retention.clone())),
            db,
            runner: Arc::new(runner),
            dispatch: config.dispatch.clone(),
            retry: config.retry.clone(),
        }
    }

    /// Open the action store under `root` and build an orchestrator around it.
    pub fn open(
        root: &Path,
        platform: Arc<dyn PlatformApi>,
        credentials: Arc<dyn CredentialResolver>,
        config: &Config,
    ) -> Result<Self> {
        let db = Arc::new(ActionDb::open(&paths::action_db_path(root))?);
        Ok(Self::new(db, platform, credentials, config))
    }

    pub fn db(&self) -> &Arc<ActionDb> {
        &self.db
    }

    /// Create a `Scheduled` action. `retry_until` defaults to the configured
    /// retry window from now.
    pub fn submit(&self, req: NewAction) -> Result<Action> {
        self.submit_at(req, Utc::now())
    }

    pub fn submit_at(&self, mut req: NewAction, now: DateTime<Utc>) -> Result<Action> {
        req.validate()?;
        if req.retry_until.is_none() {
            req.retry_until = Some(now + self.retry.default_window());
        }
        let action = Action::new(req, now);
        self.db.insert(&action)?;
        info!(
            action_id = %action.id,
            owner = %action.owner,
            operation = %action.operation,
            "action scheduled"
        );
        Ok(action)
    }

    /// Cancel a `Scheduled` action; `false` when it is in any other state.
    pub fn cancel(&self, id: Uuid) -> Result<bool> {
        self.db.cancel(id, Utc::now())
    }

    pub async fn run_cycle(&self) -> Result<CycleReport> {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run one dispatch cycle with `now` as its logical time.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let deadline = Instant::now() + self.dispatch.cycle_budget();
        let max_attempts = self.runner.policy().max_attempts;
        let batch = self.dispatch.batch_size;

        let stale_before = now - self.dispatch.stale_after();
        let (due, stale) = with_store(&self.db, move |db| {
            Ok((
                db.select_due(now, max_attempts, batch)?,
                db.select_stale(stale_before, max_attempts, batch)?,
            ))
        })
        .await?;

        let mut seen = HashSet::new();
        let mut selected: Vec<Action> = due
            .into_iter()
            .chain(stale)
            .filter(|a| seen.insert(a.id))
            .collect();
        selected.sort_by_key(|a| a.created_at);

        let mut partitions: BTreeMap<String, Vec<Uuid>> = BTreeMap::new();
        for action in &selected {
            partitions
                .entry(action.owner.clone())
                .or_default()
                .push(action.id);
        }

        let mut report = CycleReport {
            selected: selected.len(),
            ..Default::default()
        };

        let mut tasks = JoinSet::new();
        for (owner, ids) in partitions {
            let runner = self.runner.clone();
            tasks.spawn(async move {
                let part = runner.run_partition(&owner, &ids, now, deadline).await;
                (owner, ids.len(), part)
            });
        }

        let mut parts = Vec::new();
        let drained = timeout_at(deadline + ABORT_GRACE, async {
            while let Some(res) = tasks.join_next().await {
                match res {
                    Ok(part) => parts.push(part),
                    Err(e) => error!(error = %e, "partition task failed"),
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("cycle budget exceeded, aborting remaining partitions");
            tasks.abort_all();
        }

        let mut accounted = 0;
        for (owner, total, part) in &parts {
            if part.errors > 0 {
                warn!(owner = %owner, errors = part.errors, "partition finished with errors");
            }
            report.merge(part);
            accounted += total;
        }
        // Aborted or panicked partitions leave their actions for recovery.
        report.handed_off += report.selected.saturating_sub(accounted);

        report.sweep = self.sweep_logged(now).await;

        info!(
            selected = report.selected,
            advanced = report.advanced,
            polled = report.polled,
            degraded = report.degraded,
            succeeded = report.succeeded,
            failed = report.failed,
            rescheduled = report.rescheduled,
            handed_off = report.handed_off,
            errors = report.errors,
            "dispatch cycle complete"
        );
        Ok(report)
    }

    /// Advance a single action by one step now, ignoring `scheduled_for`.
    pub async fn run_now(&self, id: Uuid) -> Result<Transition> {
        self.run_now_at(id, Utc::now()).await
    }

    pub async fn run_now_at(&self, id: Uuid, now: DateTime<Utc>) -> Result<Transition> {
        // Surface unknown ids as errors rather than a silent skip.
        with_store(&self.db, move |db| db.get(id)).await?;
        let deadline = Instant::now() + self.dispatch.cycle_budget();
        self.runner.advance(id, now, deadline, true).await
    }

    pub fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        self.sweeper.sweep(now)
    }

    async fn sweep_logged(&self, now: DateTime<Utc>) -> Option<SweepReport> {
        let sweeper = self.sweeper.clone();
        let result = tokio::task::spawn_blocking(move || sweeper.sweep(now))
            .await
            .map_err(|e| EngineError::Db(format!("store task failed: {e}")))
            .and_then(|r| r);
        match result {
            Ok(r) => Some(r),
            Err(e) => {
                error!(error = %e, "retention sweep failed");
                None
            }
        }
    }
}
