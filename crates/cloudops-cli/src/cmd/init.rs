use std::path::Path;

use anyhow::Context;
use cloudops_core::config::Config;
use cloudops_core::orchestrator::ActionDb;
use cloudops_core::{io, paths};

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing cloudops in: {}", root.display());

    let dir = paths::cloudops_dir(root);
    io::ensure_dir(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    if paths::config_path(root).exists() {
        println!("  exists:  {}", paths::CONFIG_FILE);
    } else {
        Config::default()
            .save(root)
            .context("failed to write config.yaml")?;
        println!("  created: {}", paths::CONFIG_FILE);
    }

    let db_path = paths::action_db_path(root);
    if db_path.exists() {
        println!("  exists:  {}", paths::ACTION_DB_FILE);
    } else {
        ActionDb::open(&db_path).context("failed to create action store")?;
        println!("  created: {}", paths::ACTION_DB_FILE);
    }
    Ok(())
}
