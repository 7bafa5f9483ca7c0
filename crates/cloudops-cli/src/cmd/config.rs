use std::path::Path;

use anyhow::Context;
use clap::Subcommand;
use cloudops_core::config::{Config, WarnLevel};

use crate::output::{print_json, print_table};

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show the effective configuration (defaults applied)
    Show,

    /// Validate the config for common mistakes
    Validate,
}

pub fn run(root: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Show => show(root, json),
        ConfigSubcommand::Validate => validate(root, json),
    }
}

// ---------------------------------------------------------------------------
// show
// ---------------------------------------------------------------------------

fn show(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    if json {
        return print_json(&config);
    }
    let rows = vec![
        row("platform.base_url", &config.platform.base_url),
        row("platform.request_timeout_secs", config.platform.request_timeout_secs),
        row("dispatch.tick_interval_secs", config.dispatch.tick_interval_secs),
        row("dispatch.cycle_budget_secs", config.dispatch.cycle_budget_secs),
        row("dispatch.stale_after_secs", config.dispatch.stale_after_secs),
        row("dispatch.batch_size", config.dispatch.batch_size),
        row("retry.max_attempts", config.retry.max_attempts),
        row("retry.backoff_base_secs", config.retry.backoff_base_secs),
        row("retry.backoff_multiplier", config.retry.backoff_multiplier),
        row("retry.backoff_max_secs", config.retry.backoff_max_secs),
        row("retry.default_window_hours", config.retry.default_window_hours),
        row("retention.action_days", config.retention.action_days),
        row("retention.log_days", config.retention.log_days),
    ];
    print_table(&["KEY", "VALUE"], rows);
    Ok(())
}

fn row(key: &str, value: impl ToString) -> Vec<String> {
    vec![key.to_string(), value.to_string()]
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn validate(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let warnings = config.validate();

    if json {
        let value = serde_json::json!({
            "warnings": warnings,
        });
        print_json(&value)?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}
