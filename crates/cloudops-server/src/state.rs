use std::path::PathBuf;
use std::sync::Arc;

use cloudops_core::config::{Config, WarnLevel};
use cloudops_core::orchestrator::Orchestrator;
use cloudops_core::platform::{EnvCredentials, HttpPlatform};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub root: PathBuf,
    pub config: Arc<Config>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(root: PathBuf, config: Config, orchestrator: Orchestrator) -> Self {
        Self {
            root,
            config: Arc::new(config),
            orchestrator: Arc::new(orchestrator),
        }
    }

    /// Load `.cloudops/config.yaml` under `root` and wire the production
    /// platform client and environment credentials.
    pub fn open(root: PathBuf) -> anyhow::Result<Self> {
        let config = Config::load(&root)?;
        if config.has_errors() {
            let problems: Vec<String> = config
                .validate()
                .into_iter()
                .filter(|w| w.level == WarnLevel::Error)
                .map(|w| w.message)
                .collect();
            anyhow::bail!("invalid configuration: {}", problems.join("; "));
        }
        let platform = HttpPlatform::from_config(&config.platform)?;
        let orchestrator =
            Orchestrator::open(&root, Arc::new(platform), Arc::new(EnvCredentials), &config)?;
        Ok(Self::new(root, config, orchestrator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_uses_defaults_without_config_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = AppState::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(state.root, dir.path());
        assert_eq!(state.config.dispatch.tick_interval_secs, 60);
        assert!(cloudops_core::paths::action_db_path(dir.path()).exists());
    }

    #[test]
    fn open_rejects_invalid_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.dispatch.stale_after_secs = 10;
        config.save(dir.path()).unwrap();
        let err = AppState::open(dir.path().to_path_buf()).err().unwrap();
        assert!(err.to_string().contains("invalid configuration"));
    }
}
