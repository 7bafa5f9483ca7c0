use std::path::{Path, PathBuf};

use cloudops_core::paths::CLOUDOPS_DIR;

/// Resolve the workspace root.
///
/// Priority:
/// 1. `--root` flag / `CLOUDOPS_ROOT` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `.cloudops/`
/// 3. Fall back to `cwd`
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_marker(&cwd).unwrap_or(cwd)
}

fn find_marker(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(CLOUDOPS_DIR).is_dir())
        .map(Path::to_path_buf)
}
