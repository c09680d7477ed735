use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::BaseDirs;

/// File extension of cache containers.
pub const CONTAINER_EXTENSION: &str = "ccache";

pub fn cache_root() -> Result<PathBuf> {
    if let Ok(custom) = env::var("CODECACHE_DIR") {
        return Ok(PathBuf::from(custom));
    }

    let base_dirs = BaseDirs::new().context("failed to determine user directories")?;
    Ok(base_dirs.home_dir().join(".codecache"))
}

/// Default container location for an application named `app`.
pub fn container_path(root: &Path, app: &str) -> PathBuf {
    root.join(app).with_extension(CONTAINER_EXTENSION)
}
