//! Action data model for the orchestration engine.
//!
//! An `Action` is one requested lifecycle operation against a platform
//! environment plus its persisted execution position. The Runner is the only
//! writer once the action exists; everything it needs to resume after a
//! restart lives on the record itself.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};

// ---------------------------------------------------------------------------
// OperationType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Start,
    Stop,
    Restart,
    Deploy,
    Transport,
}

impl OperationType {
    pub const ALL: [OperationType; 5] = [
        OperationType::Start,
        OperationType::Stop,
        OperationType::Restart,
        OperationType::Deploy,
        OperationType::Transport,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Deploy => "deploy",
            Self::Transport => "transport",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == s)
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// Every named step across all operation machines. Which steps are legal for
/// a given operation is decided by `machine::Machine`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    CallStart,
    WaitRunning,
    CallStop,
    WaitStopped,
    CreatePackage,
    WaitPackageBuild,
    TransportPackage,
    StopEnvironment,
    WaitEnvironmentStopped,
    CreateBackup,
    WaitBackupComplete,
    StartEnvironment,
    WaitEnvironmentRunning,
    RetrieveSourcePackage,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CallStart => "call_start",
            Self::WaitRunning => "wait_running",
            Self::CallStop => "call_stop",
            Self::WaitStopped => "wait_stopped",
            Self::CreatePackage => "create_package",
            Self::WaitPackageBuild => "wait_package_build",
            Self::TransportPackage => "transport_package",
            Self::StopEnvironment => "stop_environment",
            Self::WaitEnvironmentStopped => "wait_environment_stopped",
            Self::CreateBackup => "create_backup",
            Self::WaitBackupComplete => "wait_backup_complete",
            Self::StartEnvironment => "start_environment",
            Self::WaitEnvironmentRunning => "wait_environment_running",
            Self::RetrieveSourcePackage => "retrieve_source_package",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ActionStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of an action.
///
/// Transitions: `Scheduled → Running → Succeeded | Failed`, `Running →
/// Scheduled` on a retryable failure, and `Scheduled → Canceled` by an
/// external request. Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl ActionStatus {
    pub const ALL: [ActionStatus; 5] = [
        Self::Scheduled,
        Self::Running,
        Self::Succeeded,
        Self::Failed,
        Self::Canceled,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Target / payload / step data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionTarget {
    pub application_id: String,
    pub environment: String,
}

/// Operation parameters supplied by the creator. Never mutated by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_environment: Option<String>,
    /// Overrides `target.environment` as the transport destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Intermediate results carried between steps (package id, backup id, ...).
pub type StepData = BTreeMap<String, String>;

pub mod data_keys {
    pub const PACKAGE_ID: &str = "package_id";
    pub const BACKUP_ID: &str = "backup_id";
    pub const BACKUP: &str = "backup";
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: Uuid,
    /// Owning principal (tenant or user); dispatch partitions on it.
    pub owner: String,
    pub target: ActionTarget,
    pub credential_ref: String,
    pub operation: OperationType,
    pub status: ActionStatus,
    #[serde(default)]
    pub current_step: Option<Step>,
    #[serde(default)]
    pub step_data: StepData,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload: ActionPayload,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Creation request for an action; everything the engine does not own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAction {
    pub owner: String,
    pub application_id: String,
    pub environment: String,
    pub credential_ref: String,
    pub operation: OperationType,
    #[serde(default)]
    pub payload: ActionPayload,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_until: Option<DateTime<Utc>>,
}

impl NewAction {
    /// Reject requests the engine could never run to completion.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("owner", &self.owner),
            ("application_id", &self.application_id),
            ("environment", &self.environment),
            ("credential_ref", &self.credential_ref),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(EngineError::InvalidAction(format!("{field} must not be empty")));
            }
        }
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        match self.operation {
            OperationType::Deploy if !present(&self.payload.branch) => Err(
                EngineError::InvalidAction("deploy requires payload.branch".into()),
            ),
            OperationType::Transport if !present(&self.payload.source_environment) => Err(
                EngineError::InvalidAction("transport requires payload.source_environment".into()),
            ),
            _ => Ok(()),
        }
    }
}

impl Action {
    /// Build a `Scheduled` action created at `now`.
    pub fn new(req: NewAction, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: req.owner,
            target: ActionTarget {
                application_id: req.application_id,
                environment: req.environment,
            },
            credential_ref: req.credential_ref,
            operation: req.operation,
            status: ActionStatus::Scheduled,
            current_step: None,
            step_data: StepData::new(),
            scheduled_for: req.scheduled_for,
            retry_until: req.retry_until,
            attempt_count: 0,
            last_heartbeat: None,
            payload: req.payload,
            created_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Advance the heartbeat without ever moving it backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        let beat = match self.last_heartbeat {
            Some(prev) if prev > now => prev,
            _ => now,
        };
        self.last_heartbeat = Some(beat);
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    /// Move to a terminal status, stamping `completed_at`.
    pub fn finish(&mut self, status: ActionStatus, now: DateTime<Utc>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        self.retry_until.is_some_and(|deadline| now >= deadline)
    }
}

// ---------------------------------------------------------------------------
// ActionLogEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Append-only audit record of one observation about an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub id: Uuid,
    pub action_id: Uuid,
    pub level: LogLevel,
    #[serde(default)]
    pub step: Option<Step>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl ActionLogEntry {
    pub fn new(
        action_id: Uuid,
        level: LogLevel,
        step: Option<Step>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            action_id,
            level,
            step,
            message: message.into(),
            created_at: now,
        }
    }
}
