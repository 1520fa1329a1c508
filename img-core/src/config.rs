//! Configuration management.

use crate::builder::cache::DEFAULT_CACHE_SIZE_LIMIT;
use crate::error::ConfigError;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Persistent configuration for img, stored as `<state>/config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upper bound on steps running at once within one platform.
    pub max_workers: usize,
    pub cache_size_limit_bytes: u64,
    /// Default `RUST_LOG` filter.
    pub log_level: String,
    /// Program (and leading arguments) used to run RUN steps as
    /// `<runner...> <rootfs> <argv...>`. Empty uses the built-in chroot.
    pub sandbox_runner: Vec<String>,
    pub state_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: default_workers(),
            cache_size_limit_bytes: DEFAULT_CACHE_SIZE_LIMIT,
            log_level: "info".to_string(),
            sandbox_runner: Vec::new(),
            state_dir: paths::state_dir().to_string_lossy().to_string(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

impl Config {
    /// Load configuration from `<state>/config.json`, falling back to defaults.
    ///
    /// `state_dir` in the result always names the directory it was loaded from.
    pub fn load(state: &Path) -> Result<Self, ConfigError> {
        let path = paths::config_path(state);
        let mut config = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str::<Config>(&content)
                .map_err(|source| ConfigError::Parse { path: path.clone(), source })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(source) => return Err(ConfigError::Io { path, source }),
        };

        config.state_dir = state.to_string_lossy().to_string();
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to disk.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = paths::config_path(&self.state_path());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io { path: parent.to_path_buf(), source })?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|source| ConfigError::Parse { path: path.clone(), source })?;
        std::fs::write(&path, content).map_err(|source| ConfigError::Io { path, source })
    }

    pub fn state_path(&self) -> PathBuf {
        PathBuf::from(&self.state_dir)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid { reason: "max_workers must be at least 1".to_string() });
        }
        if self.sandbox_runner.first().is_some_and(|p| p.is_empty()) {
            return Err(ConfigError::Invalid { reason: "sandbox_runner program is empty".to_string() });
        }
        Ok(())
    }
}
