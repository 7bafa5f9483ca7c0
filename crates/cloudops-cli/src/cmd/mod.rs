pub mod action;
pub mod config;
pub mod init;
pub mod serve;
pub mod sweep;
pub mod tick;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use cloudops_core::config::Config;
use cloudops_core::orchestrator::Orchestrator;
use cloudops_core::platform::{EnvCredentials, HttpPlatform};

/// Build an orchestrator for the workspace at `root` with the HTTP platform
/// client and credentials from the environment.
pub fn open_orchestrator(root: &Path) -> anyhow::Result<Orchestrator> {
    let config = Config::load(root).context("failed to load config")?;
    if config.has_errors() {
        anyhow::bail!("config has errors; run `cloudops config validate`");
    }
    let platform = HttpPlatform::from_config(&config.platform)?;
    let orch = Orchestrator::open(root, Arc::new(platform), Arc::new(EnvCredentials), &config)
        .context("failed to open action store")?;
    Ok(orch)
}
