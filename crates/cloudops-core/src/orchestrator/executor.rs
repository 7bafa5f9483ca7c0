//! Step executor: performs exactly one unit of work for one step.
//!
//! Every step is safe to re-invoke after a lost write. Calls that cause side
//! effects first look at the platform (`call_start` does nothing on an
//! environment that is already starting, `transport_package` does nothing
//! when the package is already deployed) or reuse identifiers persisted in
//! `step_data` (`create_package`, `create_backup`).

use crate::platform::{
    Credential, EnvironmentState, PackageRequest, PackageStatus, PlatformApi, PlatformError,
    SnapshotStatus,
};

use super::action::{data_keys, Action, Step, StepData};

/// What one step invocation observed.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step's work is done; the machine decides what follows.
    Done(StepData),
    /// Still waiting on the platform; run the same step next cycle.
    Poll(String),
    /// An optional sub-operation failed; take the machine's fallback edge.
    Degraded { reason: String, data: StepData },
    Fatal(String),
    Retryable(String),
}

impl StepOutcome {
    fn done() -> Self {
        Self::Done(StepData::new())
    }

    fn done_with(key: &str, value: impl Into<String>) -> Self {
        let mut data = StepData::new();
        data.insert(key.to_string(), value.into());
        Self::Done(data)
    }

    fn skip_backup(reason: String) -> Self {
        let mut data = StepData::new();
        data.insert(data_keys::BACKUP.to_string(), "skipped".to_string());
        Self::Degraded { reason, data }
    }
}

enum StepError {
    Platform(PlatformError),
    Fatal(String),
}

impl From<PlatformError> for StepError {
    fn from(e: PlatformError) -> Self {
        Self::Platform(e)
    }
}

type StepResult = std::result::Result<StepOutcome, StepError>;

/// Run `step` for `action` against `platform`.
pub async fn execute(
    platform: &dyn PlatformApi,
    cred: &Credential,
    action: &Action,
    step: Step,
) -> StepOutcome {
    let ctx = Ctx {
        platform,
        cred,
        action,
    };
    let result = match step {
        Step::CallStart | Step::StartEnvironment => ctx.request_start().await,
        Step::CallStop | Step::StopEnvironment => ctx.request_stop().await,
        Step::WaitRunning | Step::WaitEnvironmentRunning => {
            ctx.await_state(EnvironmentState::Running).await
        }
        Step::WaitStopped | Step::WaitEnvironmentStopped => {
            ctx.await_state(EnvironmentState::Stopped).await
        }
        Step::CreatePackage => ctx.create_package().await,
        Step::WaitPackageBuild => ctx.await_package().await,
        Step::TransportPackage => ctx.transport_package().await,
        Step::RetrieveSourcePackage => ctx.retrieve_source_package().await,
        Step::CreateBackup => Ok(ctx.create_backup().await),
        Step::WaitBackupComplete => Ok(ctx.await_backup().await),
    };
    match result {
        Ok(outcome) => outcome,
        Err(StepError::Fatal(msg)) => StepOutcome::Fatal(format!("{step}: {msg}")),
        Err(StepError::Platform(e)) if e.is_fatal() => StepOutcome::Fatal(format!("{step}: {e}")),
        Err(StepError::Platform(e)) => StepOutcome::Retryable(format!("{step}: {e}")),
    }
}

/// Outcome for a polling step whose retry window has elapsed: backup waits
/// are skipped, everything else fails.
pub fn window_elapsed(step: Step, detail: &str) -> StepOutcome {
    match step {
        Step::CreateBackup | Step::WaitBackupComplete => {
            StepOutcome::skip_backup(format!("retry window elapsed: {detail}"))
        }
        _ => StepOutcome::Fatal(format!("{step}: retry window elapsed: {detail}")),
    }
}

struct Ctx<'a> {
    platform: &'a dyn PlatformApi,
    cred: &'a Credential,
    action: &'a Action,
}

impl Ctx<'_> {
    fn app(&self) -> &str {
        &self.action.target.application_id
    }

    fn env(&self) -> &str {
        &self.action.target.environment
    }

    fn data(&self, key: &str) -> Option<&str> {
        self.action.step_data.get(key).map(String::as_str)
    }

    fn package_id(&self) -> std::result::Result<&str, StepError> {
        self.data(data_keys::PACKAGE_ID)
            .ok_or_else(|| StepError::Fatal("no package_id recorded by an earlier step".into()))
    }

    async fn request_start(&self) -> StepResult {
        let state = self
            .platform
            .environment_state(self.cred, self.app(), self.env())
            .await?;
        if !matches!(
            state,
            EnvironmentState::Running | EnvironmentState::Starting
        ) {
            self.platform
                .start_environment(self.cred, self.app(), self.env())
                .await?;
        }
        Ok(StepOutcome::done())
    }

    async fn request_stop(&self) -> StepResult {
        let state = self
            .platform
            .environment_state(self.cred, self.app(), self.env())
            .await?;
        if !matches!(
            state,
            EnvironmentState::Stopped | EnvironmentState::Stopping
        ) {
            self.platform
                .stop_environment(self.cred, self.app(), self.env())
                .await?;
        }
        Ok(StepOutcome::done())
    }

    async fn await_state(&self, target: EnvironmentState) -> StepResult {
        let state = self
            .platform
            .environment_state(self.cred, self.app(), self.env())
            .await?;
        let outcome = match (target, state) {
            (t, s) if t == s => StepOutcome::done(),
            (EnvironmentState::Running, EnvironmentState::Starting)
            | (EnvironmentState::Stopped, EnvironmentState::Stopping)
            | (_, EnvironmentState::Unknown) => {
                StepOutcome::Poll(format!("environment is {}", state_name(state)))
            }
            // Settled in the opposite state: the request was lost or undone.
            _ => StepOutcome::Retryable(format!(
                "environment is {} while waiting for {}",
                state_name(state),
                state_name(target)
            )),
        };
        Ok(outcome)
    }

    async fn create_package(&self) -> StepResult {
        if self.data(data_keys::PACKAGE_ID).is_some() {
            return Ok(StepOutcome::done());
        }
        let payload = &self.action.payload;
        let branch = payload
            .branch
            .clone()
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| StepError::Fatal("malformed payload: deploy requires a branch".into()))?;
        let request = PackageRequest {
            branch,
            revision: payload.revision.clone(),
            version: payload.version.clone(),
            comment: payload.comment.clone(),
        };
        let id = self
            .platform
            .create_package(self.cred, self.app(), &request)
            .await?;
        Ok(StepOutcome::done_with(data_keys::PACKAGE_ID, id))
    }

    async fn await_package(&self) -> StepResult {
        let package_id = self.package_id()?;
        let status = self
            .platform
            .package_status(self.cred, self.app(), package_id)
            .await?;
        match status {
            PackageStatus::Ready => Ok(StepOutcome::done()),
            PackageStatus::Failed => Err(StepError::Fatal(format!(
                "package {package_id} failed to build"
            ))),
            PackageStatus::Building | PackageStatus::Unknown => {
                Ok(StepOutcome::Poll(format!("package {package_id} is building")))
            }
        }
    }

    async fn transport_package(&self) -> StepResult {
        let package_id = self.package_id()?;
        let destination = self
            .action
            .payload
            .target_environment
            .as_deref()
            .unwrap_or(self.env());
        let deployed = self
            .platform
            .deployed_package(self.cred, self.app(), destination)
            .await?;
        if deployed.as_deref() != Some(package_id) {
            self.platform
                .transport_package(self.cred, self.app(), package_id, destination)
                .await?;
        }
        Ok(StepOutcome::done())
    }

    async fn retrieve_source_package(&self) -> StepResult {
        let source = self
            .action
            .payload
            .source_environment
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| {
                StepError::Fatal("malformed payload: transport requires a source_environment".into())
            })?;
        let deployed = self
            .platform
            .deployed_package(self.cred, self.app(), source)
            .await?;
        match deployed {
            Some(id) => Ok(StepOutcome::done_with(data_keys::PACKAGE_ID, id)),
            None => Err(StepError::Fatal(format!(
                "no package is deployed on source environment {source}"
            ))),
        }
    }

    async fn create_backup(&self) -> StepOutcome {
        if self.data(data_keys::BACKUP_ID).is_some() {
            return StepOutcome::done();
        }
        match self
            .platform
            .create_snapshot(
                self.cred,
                self.app(),
                self.env(),
                self.action.payload.comment.as_deref(),
            )
            .await
        {
            Ok(id) => StepOutcome::done_with(data_keys::BACKUP_ID, id),
            Err(e) => StepOutcome::skip_backup(format!("backup creation failed: {e}")),
        }
    }

    async fn await_backup(&self) -> StepOutcome {
        let Some(backup_id) = self.data(data_keys::BACKUP_ID) else {
            return StepOutcome::skip_backup("no backup was created".into());
        };
        match self
            .platform
            .snapshot_status(self.cred, self.app(), self.env(), backup_id)
            .await
        {
            Ok(SnapshotStatus::Complete) => StepOutcome::done(),
            Ok(SnapshotStatus::Pending | SnapshotStatus::Unknown) => {
                StepOutcome::Poll(format!("backup {backup_id} in progress"))
            }
            Ok(SnapshotStatus::Failed) => {
                StepOutcome::skip_backup(format!("backup {backup_id} failed"))
            }
            Err(e) => StepOutcome::skip_backup(format!("backup {backup_id} status unavailable: {e}")),
        }
    }
}

fn state_name(state: EnvironmentState) -> &'static str {
    match state {
        EnvironmentState::Running => "running",
        EnvironmentState::Starting => "starting",
        EnvironmentState::Stopped => "stopped",
        EnvironmentState::Stopping => "stopping",
        EnvironmentState::Unknown => "in an unknown state",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::action::{ActionPayload, NewAction, OperationType};
    use crate::platform::{InMemoryPlatform, PlatformCall};
    use chrono::Utc;

    fn cred() -> Credential {
        Credential::new("t")
    }

    fn action(op: OperationType, payload: ActionPayload) -> Action {
        Action::new(
            NewAction {
                owner: "o".into(),
                application_id: "shop".into(),
                environment: "prod".into(),
                credential_ref: "shop".into(),
                operation: op,
                payload,
                scheduled_for: None,
                retry_until: None,
            },
            Utc::now(),
        )
    }

    fn platform(state: EnvironmentState) -> InMemoryPlatform {
        InMemoryPlatform::new().with_environment("shop", "prod", state)
    }

    #[tokio::test]
    async fn call_start_twice_issues_one_start() {
        let p = platform(EnvironmentState::Stopped);
        let a = action(OperationType::Start, ActionPayload::default());
        let first = execute(&p, &cred(), &a, Step::CallStart).await;
        let second = execute(&p, &cred(), &a, Step::CallStart).await;
        assert_eq!(first, StepOutcome::Done(StepData::new()));
        assert_eq!(second, first);
        assert_eq!(p.calls(PlatformCall::StartEnvironment), 1);
    }

    #[tokio::test]
    async fn call_stop_on_missing_environment_is_fatal() {
        let p = InMemoryPlatform::new();
        let a = action(OperationType::Stop, ActionPayload::default());
        let out = execute(&p, &cred(), &a, Step::CallStop).await;
        assert!(matches!(out, StepOutcome::Fatal(ref m) if m.starts_with("call_stop")), "{out:?}");
    }

    #[tokio::test]
    async fn polling_without_change_stays_put() {
        let p = platform(EnvironmentState::Stopped);
        p.set_transition_polls(5);
        let a = action(OperationType::Start, ActionPayload::default());
        execute(&p, &cred(), &a, Step::CallStart).await;
        let first = execute(&p, &cred(), &a, Step::WaitRunning).await;
        let second = execute(&p, &cred(), &a, Step::WaitRunning).await;
        assert!(matches!(first, StepOutcome::Poll(_)));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn waiting_on_opposite_settled_state_is_retryable() {
        let p = platform(EnvironmentState::Stopped);
        let a = action(OperationType::Start, ActionPayload::default());
        let out = execute(&p, &cred(), &a, Step::WaitRunning).await;
        assert!(matches!(out, StepOutcome::Retryable(_)), "{out:?}");
    }

    #[tokio::test]
    async fn transient_failure_is_retryable() {
        let p = platform(EnvironmentState::Running);
        p.fail_next(
            PlatformCall::EnvironmentState,
            PlatformError::Status {
                status: 502,
                body: "bad gateway".into(),
            },
        );
        let a = action(OperationType::Stop, ActionPayload::default());
        let out = execute(&p, &cred(), &a, Step::CallStop).await;
        assert!(matches!(out, StepOutcome::Retryable(_)));
        assert_eq!(p.calls(PlatformCall::StopEnvironment), 0);
    }

    #[tokio::test]
    async fn create_package_requires_branch() {
        let p = platform(EnvironmentState::Running);
        let a = action(OperationType::Deploy, ActionPayload::default());
        let out = execute(&p, &cred(), &a, Step::CreatePackage).await;
        assert!(matches!(out, StepOutcome::Fatal(ref m) if m.contains("branch")));
        assert_eq!(p.calls(PlatformCall::CreatePackage), 0);
    }

    #[tokio::test]
    async fn create_package_reuses_recorded_id() {
        let p = platform(EnvironmentState::Running);
        let mut a = action(
            OperationType::Deploy,
            ActionPayload {
                branch: Some("main".into()),
                ..Default::default()
            },
        );
        let out = execute(&p, &cred(), &a, Step::CreatePackage).await;
        let StepOutcome::Done(data) = out else {
            panic!("expected Done, got {out:?}");
        };
        assert!(data.contains_key(data_keys::PACKAGE_ID));
        a.step_data.extend(data);
        execute(&p, &cred(), &a, Step::CreatePackage).await;
        assert_eq!(p.calls(PlatformCall::CreatePackage), 1);
    }

    #[tokio::test]
    async fn failed_build_is_fatal() {
        let p = platform(EnvironmentState::Running);
        p.set_build_polls(0);
        p.set_build_result(PackageStatus::Failed);
        let mut a = action(OperationType::Deploy, ActionPayload::default());
        let id = p
            .create_package(&cred(), "shop", &PackageRequest::default())
            .await
            .unwrap();
        a.step_data.insert(data_keys::PACKAGE_ID.into(), id);
        let out = execute(&p, &cred(), &a, Step::WaitPackageBuild).await;
        assert!(matches!(out, StepOutcome::Fatal(_)), "{out:?}");
    }

    #[tokio::test]
    async fn transport_skips_when_already_deployed() {
        let p = platform(EnvironmentState::Running);
        p.set_deployed("shop", "prod", "pkg-7");
        let mut a = action(OperationType::Transport, ActionPayload::default());
        a.step_data
            .insert(data_keys::PACKAGE_ID.into(), "pkg-7".into());
        let out = execute(&p, &cred(), &a, Step::TransportPackage).await;
        assert_eq!(out, StepOutcome::Done(StepData::new()));
        assert_eq!(p.calls(PlatformCall::TransportPackage), 0);
    }

    #[tokio::test]
    async fn retrieve_source_package_records_id() {
        let p = platform(EnvironmentState::Running)
            .with_environment("shop", "staging", EnvironmentState::Running);
        p.set_deployed("shop", "staging", "pkg-3");
        let a = action(
            OperationType::Transport,
            ActionPayload {
                source_environment: Some("staging".into()),
                ..Default::default()
            },
        );
        let out = execute(&p, &cred(), &a, Step::RetrieveSourcePackage).await;
        let StepOutcome::Done(data) = out else {
            panic!("expected Done, got {out:?}");
        };
        assert_eq!(data.get(data_keys::PACKAGE_ID).unwrap(), "pkg-3");
    }

    #[tokio::test]
    async fn retrieve_without_source_is_fatal() {
        let p = platform(EnvironmentState::Running);
        let a = action(OperationType::Transport, ActionPayload::default());
        let out = execute(&p, &cred(), &a, Step::RetrieveSourcePackage).await;
        assert!(matches!(out, StepOutcome::Fatal(ref m) if m.contains("source_environment")));
    }

    #[tokio::test]
    async fn backup_failures_degrade_even_when_fatal() {
        let p = platform(EnvironmentState::Stopped);
        p.fail_next(
            PlatformCall::CreateSnapshot,
            PlatformError::Unauthorized("no snapshot scope".into()),
        );
        let a = action(OperationType::Deploy, ActionPayload::default());
        let out = execute(&p, &cred(), &a, Step::CreateBackup).await;
        let StepOutcome::Degraded { reason, data } = out else {
            panic!("expected Degraded, got {out:?}");
        };
        assert!(reason.contains("backup creation failed"));
        assert_eq!(data.get(data_keys::BACKUP).unwrap(), "skipped");
    }

    #[test]
    fn elapsed_window_skips_backup_but_fails_other_polls() {
        assert!(matches!(
            window_elapsed(Step::WaitBackupComplete, "pending"),
            StepOutcome::Degraded { .. }
        ));
        assert!(matches!(
            window_elapsed(Step::WaitRunning, "starting"),
            StepOutcome::Fatal(_)
        ));
    }

    #[tokio::test]
    async fn backup_wait_polls_then_completes() {
        let p = platform(EnvironmentState::Stopped);
        let mut a = action(OperationType::Deploy, ActionPayload::default());
        let StepOutcome::Done(data) = execute(&p, &cred(), &a, Step::CreateBackup).await else {
            panic!("backup creation should succeed");
        };
        a.step_data.extend(data);
        assert!(matches!(
            execute(&p, &cred(), &a, Step::WaitBackupComplete).await,
            StepOutcome::Poll(_)
        ));
        assert_eq!(
            execute(&p, &cred(), &a, Step::WaitBackupComplete).await,
            StepOutcome::Done(StepData::new())
        );
    }
}
