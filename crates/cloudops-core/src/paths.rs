use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const CLOUDOPS_DIR: &str = ".cloudops";
pub const CONFIG_FILE: &str = ".cloudops/config.yaml";
pub const ACTION_DB_FILE: &str = ".cloudops/actions.redb";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn cloudops_dir(root: &Path) -> PathBuf {
    root.join(CLOUDOPS_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn action_db_path(root: &Path) -> PathBuf {
    root.join(ACTION_DB_FILE)
}
