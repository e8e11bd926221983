use crate::error::CacheError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    pub meta_dir: PathBuf,
    /// Extent boundaries are rounded to this many bytes; 0 disables it.
    pub alignment: u64,
    /// Delay before newly dirtied data becomes due for write-back.
    pub writeback_delay_secs: u64,
    /// Largest chunk read for a single write-back.
    pub max_writeback_bytes: u64,
    pub poll_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("/var/cache/pcache/data"),
            meta_dir: PathBuf::from("/var/cache/pcache/meta"),
            alignment: 4096,
            writeback_delay_secs: 30,
            max_writeback_bytes: 1 << 20,
            poll_interval_ms: 1000,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.alignment != 0 && !self.alignment.is_power_of_two() {
            return Err(CacheError::InvalidConfig(format!(
                "alignment {} is not a power of two",
                self.alignment
            )));
        }
        if self.max_writeback_bytes == 0 {
            return Err(CacheError::InvalidConfig(
                "max_writeback_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn writeback_delay(&self) -> Duration {
        Duration::from_secs(self.writeback_delay_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Create the data and metadata directories if missing.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.cache_dir, &self.meta_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CacheConfig> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let cfg: CacheConfig = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    cfg.validate()?;
    Ok(cfg)
}
