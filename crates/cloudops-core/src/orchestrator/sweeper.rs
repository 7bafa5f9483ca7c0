//! Retention sweeping for terminal actions and old log entries.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::RetentionConfig;
use crate::error::{EngineError, Result};

use super::db::ActionDb;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub actions_deleted: usize,
    pub logs_deleted: usize,
}

pub struct Sweeper {
    db: Arc<ActionDb>,
    retention: RetentionConfig,
}

impl Sweeper {
    pub fn new(db: Arc<ActionDb>, retention: RetentionConfig) -> Self {
        Self { db, retention }
    }

    /// Delete terminal actions completed more than `action_days` ago (with
    /// their logs), then log entries older than `log_days`.
    ///
    /// Both deletions are attempted; the first error is returned after the
    /// second has run. Reporting the error is the caller's job.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let actions = cutoff(now, self.retention.action_age(), "retention.action_days")
            .and_then(|before| self.db.delete_terminal_before(before));
        let logs = cutoff(now, self.retention.log_age(), "retention.log_days")
            .and_then(|before| self.db.delete_logs_before(before));

        let report = SweepReport {
            actions_deleted: actions?,
            logs_deleted: logs?,
        };
        debug!(
            actions = report.actions_deleted,
            logs = report.logs_deleted,
            "retention sweep"
        );
        Ok(report)
    }
}

fn cutoff(now: DateTime<Utc>, age: Duration, field: &str) -> Result<DateTime<Utc>> {
    now.checked_sub_signed(age).ok_or_else(|| {
        EngineError::InvalidConfig(format!(
            "{field} reaches past the earliest representable timestamp"
        ))
    })
}
