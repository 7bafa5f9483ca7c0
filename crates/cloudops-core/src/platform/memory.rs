//! In-memory platform simulation.
//!
//! Environments move through `Starting`/`Stopping` for a configurable number
//! of status reads before settling, packages and snapshots likewise, and any
//! call can be scripted to fail or to stall on a per-environment delay. Call
//! counters make duplicate side effects observable.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    Credential, EnvironmentState, PackageRequest, PackageStatus, PlatformApi, PlatformError,
    PlatformResult, SnapshotStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformCall {
    EnvironmentState,
    StartEnvironment,
    StopEnvironment,
    DeployedPackage,
    CreatePackage,
    PackageStatus,
    TransportPackage,
    CreateSnapshot,
    SnapshotStatus,
}

#[derive(Debug)]
struct Env {
    state: EnvironmentState,
    settle_in: u32,
    deployed: Option<String>,
}

#[derive(Debug)]
struct Pending<S> {
    status: S,
    remaining: u32,
}

#[derive(Debug)]
struct Inner {
    envs: HashMap<(String, String), Env>,
    packages: HashMap<String, Pending<PackageStatus>>,
    snapshots: HashMap<String, Pending<SnapshotStatus>>,
    failures: HashMap<PlatformCall, VecDeque<PlatformError>>,
    calls: HashMap<PlatformCall, usize>,
    delays: HashMap<(String, String), Duration>,
    transition_polls: u32,
    build_polls: u32,
    snapshot_polls: u32,
    build_result: PackageStatus,
    snapshot_result: SnapshotStatus,
    next_id: u64,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            envs: HashMap::new(),
            packages: HashMap::new(),
            snapshots: HashMap::new(),
            failures: HashMap::new(),
            calls: HashMap::new(),
            delays: HashMap::new(),
            transition_polls: 1,
            build_polls: 1,
            snapshot_polls: 1,
            build_result: PackageStatus::Ready,
            snapshot_result: SnapshotStatus::Complete,
            next_id: 0,
        }
    }
}

impl Inner {
    /// Count the call and pop a scripted failure, if any.
    fn enter(&mut self, call: PlatformCall) -> PlatformResult<()> {
        *self.calls.entry(call).or_insert(0) += 1;
        match self.failures.get_mut(&call).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn env(&mut self, app: &str, env: &str) -> PlatformResult<&mut Env> {
        self.envs
            .get_mut(&(app.to_string(), env.to_string()))
            .ok_or_else(|| PlatformError::NotFound(format!("environment {app}/{env}")))
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPlatform {
    inner: Mutex<Inner>,
}

impl InMemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_environment(self, app: &str, env: &str, state: EnvironmentState) -> Self {
        self.add_environment(app, env, state);
        self
    }

    pub fn add_environment(&self, app: &str, env: &str, state: EnvironmentState) {
        let settle_in = self.lock().transition_polls;
        self.lock().envs.insert(
            (app.to_string(), env.to_string()),
            Env {
                state,
                settle_in,
                deployed: None,
            },
        );
    }

    /// Status reads that still report `Starting`/`Stopping` after a start or
    /// stop call.
    pub fn set_transition_polls(&self, polls: u32) {
        self.lock().transition_polls = polls;
    }

    /// Status reads that report `Building` before a package settles.
    pub fn set_build_polls(&self, polls: u32) {
        self.lock().build_polls = polls;
    }

    pub fn set_snapshot_polls(&self, polls: u32) {
        self.lock().snapshot_polls = polls;
    }

    pub fn set_build_result(&self, status: PackageStatus) {
        self.lock().build_result = status;
    }

    pub fn set_snapshot_result(&self, status: SnapshotStatus) {
        self.lock().snapshot_result = status;
    }

    pub fn set_deployed(&self, app: &str, env: &str, package_id: &str) {
        let mut inner = self.lock();
        if let Ok(e) = inner.env(app, env) {
            e.deployed = Some(package_id.to_string());
        }
        inner.packages.insert(
            package_id.to_string(),
            Pending {
                status: PackageStatus::Ready,
                remaining: 0,
            },
        );
    }

    /// Make the next call of kind `call` fail with `err`.
    pub fn fail_next(&self, call: PlatformCall, err: PlatformError) {
        self.fail_times(call, err, 1);
    }

    pub fn fail_times(&self, call: PlatformCall, err: PlatformError, times: usize) {
        let mut inner = self.lock();
        let queue = inner.failures.entry(call).or_default();
        for _ in 0..times {
            queue.push_back(err.clone());
        }
    }

    /// Every call touching `app`/`env` sleeps for `delay` before answering.
    /// `Duration::ZERO` removes the delay.
    pub fn set_delay(&self, app: &str, env: &str, delay: Duration) {
        let key = (app.to_string(), env.to_string());
        let mut inner = self.lock();
        if delay.is_zero() {
            inner.delays.remove(&key);
        } else {
            inner.delays.insert(key, delay);
        }
    }

    async fn stall(&self, app: &str, env: &str) {
        let delay = self
            .lock()
            .delays
            .get(&(app.to_string(), env.to_string()))
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn calls(&self, call: PlatformCall) -> usize {
        self.lock().calls.get(&call).copied().unwrap_or(0)
    }

    /// Current state without counting a call or advancing a transition.
    pub fn peek_state(&self, app: &str, env: &str) -> Option<EnvironmentState> {
        self.lock()
            .envs
            .get(&(app.to_string(), env.to_string()))
            .map(|e| e.state)
    }

    pub fn peek_deployed(&self, app: &str, env: &str) -> Option<String> {
        self.lock()
            .envs
            .get(&(app.to_string(), env.to_string()))
            .and_then(|e| e.deployed.clone())
    }
}

fn settle(state: EnvironmentState) -> EnvironmentState {
    match state {
        EnvironmentState::Starting => EnvironmentState::Running,
        EnvironmentState::Stopping => EnvironmentState::Stopped,
        other => other,
    }
}

#[async_trait]
impl PlatformApi for InMemoryPlatform {
    async fn environment_state(
        &self,
        _cred: &Credential,
        app: &str,
        env: &str,
    ) -> PlatformResult<EnvironmentState> {
        self.stall(app, env).await;
        let mut inner = self.lock();
        inner.enter(PlatformCall::EnvironmentState)?;
        let e = inner.env(app, env)?;
        if matches!(
            e.state,
            EnvironmentState::Starting | EnvironmentState::Stopping
        ) {
            if e.settle_in == 0 {
                e.state = settle(e.state);
            } else {
                e.settle_in -= 1;
            }
        }
        Ok(e.state)
    }

    async fn start_environment(
        &self,
        _cred: &Credential,
        app: &str,
        env: &str,
    ) -> PlatformResult<()> {
        self.stall(app, env).await;
        let mut inner = self.lock();
        inner.enter(PlatformCall::StartEnvironment)?;
        let polls = inner.transition_polls;
        let e = inner.env(app, env)?;
        if !matches!(
            e.state,
            EnvironmentState::Running | EnvironmentState::Starting
        ) {
            e.state = if polls == 0 {
                EnvironmentState::Running
            } else {
                EnvironmentState::Starting
            };
            e.settle_in = polls;
        }
        Ok(())
    }

    async fn stop_environment(
        &self,
        _cred: &Credential,
        app: &str,
        env: &str,
    ) -> PlatformResult<()> {
        self.stall(app, env).await;
        let mut inner = self.lock();
        inner.enter(PlatformCall::StopEnvironment)?;
        let polls = inner.transition_polls;
        let e = inner.env(app, env)?;
        if !matches!(
            e.state,
            EnvironmentState::Stopped | EnvironmentState::Stopping
        ) {
            e.state = if polls == 0 {
                EnvironmentState::Stopped
            } else {
                EnvironmentState::Stopping
            };
            e.settle_in = polls;
        }
        Ok(())
    }

    async fn deployed_package(
        &self,
        _cred: &Credential,
        app: &str,
        env: &str,
    ) -> PlatformResult<Option<String>> {
        self.stall(app, env).await;
        let mut inner = self.lock();
        inner.enter(PlatformCall::DeployedPackage)?;
        Ok(inner.env(app, env)?.deployed.clone())
    }

    async fn create_package(
        &self,
        _cred: &Credential,
        _app: &str,
        _request: &PackageRequest,
    ) -> PlatformResult<String> {
        let mut inner = self.lock();
        inner.enter(PlatformCall::CreatePackage)?;
        let id = inner.next_id("pkg");
        let pending = if inner.build_polls == 0 {
            Pending {
                status: inner.build_result,
                remaining: 0,
            }
        } else {
            Pending {
                status: PackageStatus::Building,
                remaining: inner.build_polls,
            }
        };
        inner.packages.insert(id.clone(), pending);
        Ok(id)
    }

    async fn package_status(
        &self,
        _cred: &Credential,
        _app: &str,
        package_id: &str,
    ) -> PlatformResult<PackageStatus> {
        let mut inner = self.lock();
        inner.enter(PlatformCall::PackageStatus)?;
        let result = inner.build_result;
        let pkg = inner
            .packages
            .get_mut(package_id)
            .ok_or_else(|| PlatformError::NotFound(format!("package {package_id}")))?;
        if pkg.status == PackageStatus::Building {
            if pkg.remaining == 0 {
                pkg.status = result;
            } else {
                pkg.remaining -= 1;
            }
        }
        Ok(pkg.status)
    }

    async fn transport_package(
        &self,
        _cred: &Credential,
        app: &str,
        package_id: &str,
        env: &str,
    ) -> PlatformResult<()> {
        self.stall(app, env).await;
        let mut inner = self.lock();
        inner.enter(PlatformCall::TransportPackage)?;
        match inner.packages.get(package_id).map(|p| p.status) {
            None => return Err(PlatformError::NotFound(format!("package {package_id}"))),
            Some(PackageStatus::Ready) => {}
            Some(_) => {
                return Err(PlatformError::Status {
                    status: 409,
                    body: format!("package {package_id} is not ready"),
                })
            }
        }
        inner.env(app, env)?.deployed = Some(package_id.to_string());
        Ok(())
    }

    async fn create_snapshot(
        &self,
        _cred: &Credential,
        app: &str,
        env: &str,
        _comment: Option<&str>,
    ) -> PlatformResult<String> {
        self.stall(app, env).await;
        let mut inner = self.lock();
        inner.enter(PlatformCall::CreateSnapshot)?;
        inner.env(app, env)?;
        let id = inner.next_id("snap");
        let pending = if inner.snapshot_polls == 0 {
            Pending {
                status: inner.snapshot_result,
                remaining: 0,
            }
        } else {
            Pending {
                status: SnapshotStatus::Pending,
                remaining: inner.snapshot_polls,
            }
        };
        inner.snapshots.insert(id.clone(), pending);
        Ok(id)
    }

    async fn snapshot_status(
        &self,
        _cred: &Credential,
        app: &str,
        env: &str,
        snapshot_id: &str,
    ) -> PlatformResult<SnapshotStatus> {
        self.stall(app, env).await;
        let mut inner = self.lock();
        inner.enter(PlatformCall::SnapshotStatus)?;
        let result = inner.snapshot_result;
        let snap = inner
            .snapshots
            .get_mut(snapshot_id)
            .ok_or_else(|| PlatformError::NotFound(format!("snapshot {snapshot_id}")))?;
        if snap.status == SnapshotStatus::Pending {
            if snap.remaining == 0 {
                snap.status = result;
            } else {
                snap.remaining -= 1;
            }
        }
        Ok(snap.status)
    }
}
