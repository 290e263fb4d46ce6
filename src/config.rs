//! Mount configuration

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default cap on cached shadow entries
pub const DEFAULT_ENTRY_CACHE_LIMIT: usize = 65536;

/// Default attribute TTL handed to the kernel (seconds)
pub const DEFAULT_ATTR_TTL_SECS: u64 = 1;

/// Configuration for one mount session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Root of the lower directory tree to stack on
    pub lower_root: PathBuf,

    /// Maximum number of shadow entries (positive and negative) kept in
    /// the per-session cache
    #[serde(default = "default_entry_cache_limit")]
    pub entry_cache_limit: usize,

    /// Attribute TTL for FUSE replies, in seconds
    #[serde(default = "default_attr_ttl_secs")]
    pub attr_ttl_secs: u64,
}

fn default_entry_cache_limit() -> usize {
    DEFAULT_ENTRY_CACHE_LIMIT
}

fn default_attr_ttl_secs() -> u64 {
    DEFAULT_ATTR_TTL_SECS
}

impl MountConfig {
    /// Create a configuration with defaults for the given lower root
    pub fn new(lower_root: PathBuf) -> Self {
        MountConfig {
            lower_root,
            entry_cache_limit: DEFAULT_ENTRY_CACHE_LIMIT,
            attr_ttl_secs: DEFAULT_ATTR_TTL_SECS,
        }
    }

    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = MountConfig::new(PathBuf::from("/srv/lower"));
        config.save(&path).unwrap();

        let loaded = MountConfig::load(&path).unwrap();
        assert_eq!(loaded.lower_root, PathBuf::from("/srv/lower"));
        assert_eq!(loaded.entry_cache_limit, DEFAULT_ENTRY_CACHE_LIMIT);
    }

    #[test]
    fn test_defaults_filled_in() {
        let parsed: MountConfig =
            serde_json::from_str(r#"{ "lower_root": "/data" }"#).unwrap();
        assert_eq!(parsed.entry_cache_limit, DEFAULT_ENTRY_CACHE_LIMIT);
        assert_eq!(parsed.attr_ttl_secs, DEFAULT_ATTR_TTL_SECS);
    }
}
