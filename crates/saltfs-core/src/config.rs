use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Engine configuration (loaded from saltfs.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub storage: StorageConfig,
    pub sync: SyncConfig,
    /// Device identity recorded as manifest author (e.g. "alice@laptop")
    pub device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the clean and dirty stores
    pub workdir: PathBuf,
    /// Block granularity for flush/sync maps and cache accounting
    pub block_size: u64,
    /// Clean-store budget in bytes; the clean block count is bounded by
    /// max_cache_size / block_size
    pub max_cache_size: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from(".saltfs"),
            block_size: 64 * 1024,
            max_cache_size: 512 * 1024 * 1024,
        }
    }
}

impl StorageConfig {
    /// Maximum number of blocks the clean store may hold.
    pub fn block_limit(&self) -> u64 {
        (self.max_cache_size / self.block_size).max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Bound on merge-and-retry rounds after a concurrency error
    pub max_retries: u32,
    /// Base backoff between retry rounds; doubles per attempt
    pub backoff_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_ms: 100,
        }
    }
}

impl EngineConfig {
    /// Load a config file; missing sections fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.storage.block_size, 65536);
        assert!(cfg.storage.block_limit() > 0);
        assert_eq!(cfg.sync.max_retries, 5);
    }

    #[test]
    fn load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saltfs.toml");
        std::fs::write(
            &path,
            "device_id = \"alice@laptop\"\n[storage]\nblock_size = 4096\n",
        )
        .unwrap();

        let cfg = EngineConfig::load(&path).unwrap();
        assert_eq!(cfg.device_id, "alice@laptop");
        assert_eq!(cfg.storage.block_size, 4096);
        // Untouched sections keep defaults
        assert_eq!(cfg.sync.max_retries, 5);
    }

    #[test]
    fn load_missing_file_fails() {
        assert!(EngineConfig::load(Path::new("/nonexistent/saltfs.toml")).is_err());
    }
}
