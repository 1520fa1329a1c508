//! Centralized path configuration for img.
//!
//! All state paths go through this module so the CLI and the library agree
//! on where blobs, the cache and named images live.

use std::path::{Path, PathBuf};

/// Environment variable overriding the state directory.
pub const STATE_DIR_ENV: &str = "IMG_STATE_DIR";

/// Get the img state directory.
///
/// Resolution order:
/// 1. `IMG_STATE_DIR` environment variable
/// 2. `~/.img`
/// 3. `.img` in the working directory when there is no home directory
pub fn state_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(STATE_DIR_ENV).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }

    dirs::home_dir().map(|h| h.join(".img")).unwrap_or_else(|| PathBuf::from(".img"))
}

/// Get the build cache metadata directory.
pub fn cache_dir(state: &Path) -> PathBuf {
    state.join("cache")
}

/// Get the directory for transient root filesystems.
pub fn scratch_dir(state: &Path) -> PathBuf {
    state.join("tmp")
}

/// Get the configuration file path.
pub fn config_path(state: &Path) -> PathBuf {
    state.join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_layout() {
        let state = Path::new("/var/tmp/img-state");
        assert_eq!(cache_dir(state), PathBuf::from("/var/tmp/img-state/cache"));
        assert_eq!(scratch_dir(state), PathBuf::from("/var/tmp/img-state/tmp"));
        assert_eq!(config_path(state), PathBuf::from("/var/tmp/img-state/config.json"));
    }
}
