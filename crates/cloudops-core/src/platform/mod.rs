//! Outbound interface to the lifecycle-management platform.
//!
//! `PlatformApi` is the seam the step executor talks through. `HttpPlatform`
//! is the production implementation; `InMemoryPlatform` simulates a platform
//! for tests and local runs.

pub mod credentials;
pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use credentials::{Credential, CredentialResolver, EnvCredentials, StaticCredentials};
pub use http::HttpPlatform;
pub use memory::{InMemoryPlatform, PlatformCall};

// ---------------------------------------------------------------------------
// PlatformError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("platform returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected platform response: {0}")]
    Decode(String),
}

impl PlatformError {
    /// Not-found and unauthorized never heal by retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Unauthorized(_))
    }

    /// Classify a non-2xx response.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            404 => Self::NotFound(body),
            401 | 403 => Self::Unauthorized(body),
            _ => Self::Status { status, body },
        }
    }
}

// ---------------------------------------------------------------------------
// Platform resource states
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentState {
    Running,
    Starting,
    Stopped,
    Stopping,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageStatus {
    Building,
    Ready,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Pending,
    Complete,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRequest {
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

// ---------------------------------------------------------------------------
// PlatformApi
// ---------------------------------------------------------------------------

pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// Calls the engine makes against the lifecycle-management platform. Every
/// call carries the credential resolved for the action it serves.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    async fn environment_state(
        &self,
        cred: &Credential,
        app: &str,
        env: &str,
    ) -> PlatformResult<EnvironmentState>;

    async fn start_environment(&self, cred: &Credential, app: &str, env: &str)
        -> PlatformResult<()>;

    async fn stop_environment(&self, cred: &Credential, app: &str, env: &str)
        -> PlatformResult<()>;

    /// Package currently deployed on `env`, if any.
    async fn deployed_package(
        &self,
        cred: &Credential,
        app: &str,
        env: &str,
    ) -> PlatformResult<Option<String>>;

    async fn create_package(
        &self,
        cred: &Credential,
        app: &str,
        request: &PackageRequest,
    ) -> PlatformResult<String>;

    async fn package_status(
        &self,
        cred: &Credential,
        app: &str,
        package_id: &str,
    ) -> PlatformResult<PackageStatus>;

    async fn transport_package(
        &self,
        cred: &Credential,
        app: &str,
        package_id: &str,
        env: &str,
    ) -> PlatformResult<()>;

    async fn create_snapshot(
        &self,
        cred: &Credential,
        app: &str,
        env: &str,
        comment: Option<&str>,
    ) -> PlatformResult<String>;

    async fn snapshot_status(
        &self,
        cred: &Credential,
        app: &str,
        env: &str,
        snapshot_id: &str,
    ) -> PlatformResult<SnapshotStatus>;
}
