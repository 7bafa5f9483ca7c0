use crate::error::Result;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Bounds
// ---------------------------------------------------------------------------

/// Largest accepted value for the `*_secs` dispatch and platform timings.
pub const MAX_TIMING_SECS: u64 = 24 * 60 * 60;

/// Largest accepted `retry.default_window_hours` (ten years).
pub const MAX_WINDOW_HOURS: u64 = 10 * 365 * 24;

/// Largest accepted retention period, in days.
pub const MAX_RETENTION_DAYS: u32 = 100 * 365;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// PlatformConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:8080/v1".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl PlatformConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.min(MAX_TIMING_SECS))
    }
}

// ---------------------------------------------------------------------------
// DispatchConfig
// ---------------------------------------------------------------------------

/// Cycle timing. `stale_after` must exceed `cycle_budget`, otherwise an
/// action still being worked on could be reclaimed by an overlapping cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_cycle_budget")]
    pub cycle_budget_secs: u64,
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_tick_interval() -> u64 {
    60
}

fn default_cycle_budget() -> u64 {
    45
}

fn default_stale_after() -> u64 {
    50
}

fn default_batch_size() -> usize {
    50
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            cycle_budget_secs: default_cycle_budget(),
            stale_after_secs: default_stale_after(),
            batch_size: default_batch_size(),
        }
    }
}

impl DispatchConfig {
    // Accessors clamp to the validated range so an unchecked config can
    // never overflow instant or timestamp arithmetic.

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.clamp(1, MAX_TIMING_SECS))
    }

    pub fn cycle_budget(&self) -> Duration {
        Duration::from_secs(self.cycle_budget_secs.min(MAX_TIMING_SECS))
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs.min(MAX_TIMING_SECS) as i64)
    }
}

// ---------------------------------------------------------------------------
// RetryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,
    /// Applied as `retry_until = created_at + window` when the creator did
    /// not supply a deadline.
    #[serde(default = "default_window_hours")]
    pub default_window_hours: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base() -> u64 {
    30
}

fn default_backoff_multiplier() -> u32 {
    2
}

fn default_backoff_max() -> u64 {
    1800
}

fn default_window_hours() -> u64 {
    24
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_max_secs: default_backoff_max(),
            default_window_hours: default_window_hours(),
        }
    }
}

impl RetryConfig {
    pub fn default_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.default_window_hours.min(MAX_WINDOW_HOURS) as i64)
    }
}

// ---------------------------------------------------------------------------
// RetentionConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_action_days")]
    pub action_days: u32,
    #[serde(default = "default_log_days")]
    pub log_days: u32,
}

fn default_action_days() -> u32 {
    30
}

fn default_log_days() -> u32 {
    90
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            action_days: default_action_days(),
            log_days: default_log_days(),
        }
    }
}

// Ages are not clamped; the sweeper rejects a cutoff that falls outside the
// representable time range.
impl RetentionConfig {
    pub fn action_age(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.action_days))
    }

    pub fn log_age(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.log_days))
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

impl Config {
    /// Load `.cloudops/config.yaml`, falling back to defaults when absent.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut error = |message: String| {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message,
            })
        };

        let d = &self.dispatch;
        for (field, value) in [
            ("platform.request_timeout_secs", self.platform.request_timeout_secs),
            ("dispatch.tick_interval_secs", d.tick_interval_secs),
            ("dispatch.cycle_budget_secs", d.cycle_budget_secs),
            ("dispatch.stale_after_secs", d.stale_after_secs),
        ] {
            if value > MAX_TIMING_SECS {
                error(format!("{field} ({value}) exceeds the maximum of {MAX_TIMING_SECS}"));
            }
        }
        if self.retry.default_window_hours > MAX_WINDOW_HOURS {
            error(format!(
                "retry.default_window_hours ({}) exceeds the maximum of {MAX_WINDOW_HOURS}",
                self.retry.default_window_hours
            ));
        }
        for (field, value) in [
            ("retention.action_days", self.retention.action_days),
            ("retention.log_days", self.retention.log_days),
        ] {
            if value > MAX_RETENTION_DAYS {
                error(format!("{field} ({value}) exceeds the maximum of {MAX_RETENTION_DAYS}"));
            }
        }
        if d.stale_after_secs <= d.cycle_budget_secs {
            error(format!(
                "dispatch.stale_after_secs ({}) must be greater than dispatch.cycle_budget_secs ({})",
                d.stale_after_secs, d.cycle_budget_secs
            ));
        }
        if d.cycle_budget_secs >= d.tick_interval_secs {
            error(format!(
                "dispatch.cycle_budget_secs ({}) must be shorter than dispatch.tick_interval_secs ({})",
                d.cycle_budget_secs, d.tick_interval_secs
            ));
        }
        if d.batch_size == 0 {
            error("dispatch.batch_size must be at least 1".to_string());
        }
        if self.retry.max_attempts == 0 {
            error("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.backoff_multiplier == 0 {
            error("retry.backoff_multiplier must be at least 1".to_string());
        }
        if let Err(e) = reqwest::Url::parse(&self.platform.base_url) {
            error(format!(
                "platform.base_url '{}' is not a valid URL: {e}",
                self.platform.base_url
            ));
        }

        if d.stale_after_secs >= d.tick_interval_secs {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "dispatch.stale_after_secs ({}) is not below dispatch.tick_interval_secs ({}); \
                     parked actions will only advance every other cycle",
                    d.stale_after_secs, d.tick_interval_secs
                ),
            });
        }
        if self.retention.log_days < self.retention.action_days {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "retention.log_days ({}) is shorter than retention.action_days ({}); \
                     retained actions may lose their history",
                    self.retention.log_days, self.retention.action_days
                ),
            });
        }

        warnings
    }

    pub fn has_errors(&self) -> bool {
        self.validate().iter().any(|w| w.level == WarnLevel::Error)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
