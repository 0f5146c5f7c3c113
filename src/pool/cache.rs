//! Disk-cache directory recycling.
//!
//! Killed browsers hand their `--disk-cache-dir` directory back to the pool;
//! the next launch reuses it, so a fresh browser generation starts with a
//! warm HTTP cache. Cookies and storage live in the profile directory and
//! are never shared.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Prefix for cache directories created under the OS temp root.
pub(crate) const CACHE_DIR_PREFIX: &str = "crawlpool_disk_cache_";

/// Create a fresh, uniquely named cache directory.
pub(crate) fn create_cache_dir() -> Result<PathBuf> {
    let path = std::env::temp_dir().join(format!("{CACHE_DIR_PREFIX}{}", Uuid::new_v4()));
    // create_dir (not create_dir_all) fails if the path exists, guarding
    // against a uuid collision handing two browsers the same cache
    std::fs::create_dir(&path)
        .with_context(|| format!("failed to create cache directory {}", path.display()))?;
    debug!("created disk cache directory {}", path.display());
    Ok(path)
}

/// Build the Chrome argument pointing a browser at its cache directory.
pub(crate) fn disk_cache_arg(dir: &Path) -> String {
    format!("--disk-cache-dir={}", dir.display())
}

/// Recursively delete a cache directory, logging and swallowing failures.
pub(crate) fn remove_cache_dir(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        warn!("failed to remove cache directory {}: {e}", dir.display());
    }
}
