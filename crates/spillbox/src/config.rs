//! Configuration loading for a spillbox archive
//!
//! Settings are loaded from (in order of priority):
//! 1. Runtime environment variables (data directory only)
//! 2. JSON file (~/.config/spillbox/spillbox.json)
//! 3. Built-in defaults

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Config filename in the spillbox config directory
const CONFIG_FILE: &str = "spillbox.json";

/// Environment variable overriding the archive directory
const DATA_DIR_ENV: &str = "SPILLBOX_DATA_DIR";

/// Tunables for opening and maintaining an archive
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpillboxConfig {
    /// Archive directory; falls back to the platform data directory
    pub data_dir: Option<PathBuf>,
    /// Metadata database filename inside the archive directory
    pub db_file: String,
    /// Blob database filename inside the archive directory
    pub blobs_file: String,
    /// Seconds a tombstoned blob stays readable before GC may erase it
    pub gc_grace_secs: i64,
    /// Blobs examined per GC transaction
    pub gc_batch_size: usize,
    /// SQLite busy handler timeout
    pub busy_timeout_ms: u64,
    /// Write transactions replayed this many times on SQLITE_BUSY
    pub max_tx_retries: u32,
    /// Compress text body parts with zstd
    pub compress_bodies: bool,
    /// zstd level for body parts
    pub compression_level: i32,
    /// Body parts smaller than this are stored as-is
    pub compress_min_size: usize,
}

impl Default for SpillboxConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            db_file: "spillbox.sqlite".to_string(),
            blobs_file: "blobs.sqlite".to_string(),
            gc_grace_secs: 24 * 60 * 60,
            gc_batch_size: 256,
            busy_timeout_ms: 5000,
            max_tx_retries: 8,
            compress_bodies: true,
            compression_level: 3,
            compress_min_size: 512,
        }
    }
}

impl SpillboxConfig {
    /// Load the config file if present, then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut cfg = if config::config_exists(CONFIG_FILE) {
            config::load_json(CONFIG_FILE)?
        } else {
            Self::default()
        };

        if let Ok(dir) = std::env::var(DATA_DIR_ENV)
            && !dir.is_empty()
        {
            cfg.data_dir = Some(PathBuf::from(dir));
        }

        Ok(cfg)
    }

    /// Load settings from a specific JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        config::load_json_file(path)
    }

    /// Parse settings from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse spillbox config JSON")
    }

    /// The archive directory to open
    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => config::data_dir().context("Could not determine data directory"),
        }
    }

    pub fn gc_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.gc_grace_secs)
    }

    /// Write these settings to ~/.config/spillbox/spillbox.json
    pub fn save(&self) -> Result<PathBuf> {
        config::save_json(CONFIG_FILE, self)
    }

    /// Write these settings to a specific JSON file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        config::save_json_file(path, self)
    }

    /// Get the default config file path (~/.config/spillbox/spillbox.json)
    pub fn default_config_path() -> Option<PathBuf> {
        config::config_path(CONFIG_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "gc_grace_secs": 60, "compress_bodies": false }"#;

        let cfg = SpillboxConfig::from_json(json).unwrap();
        assert_eq!(cfg.gc_grace_secs, 60);
        assert!(!cfg.compress_bodies);
        assert_eq!(cfg.db_file, "spillbox.sqlite");
        assert_eq!(cfg.max_tx_retries, 8);
    }

    #[test]
    fn test_explicit_data_dir() {
        let json = r#"{ "data_dir": "/var/mail/spillbox" }"#;

        let cfg = SpillboxConfig::from_json(json).unwrap();
        assert_eq!(
            cfg.resolve_data_dir().unwrap(),
            PathBuf::from("/var/mail/spillbox")
        );
    }

    #[test]
    fn test_saved_file_loads_back() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("spillbox.json");
        let cfg = SpillboxConfig {
            gc_batch_size: 16,
            ..SpillboxConfig::default()
        };

        cfg.save_to(&path).unwrap();
        let loaded = SpillboxConfig::from_file(&path).unwrap();
        assert_eq!(loaded.gc_batch_size, 16);
        assert_eq!(loaded.gc_grace_secs, cfg.gc_grace_secs);
    }

    #[test]
    fn test_invalid_json() {
        assert!(SpillboxConfig::from_json(r#"{ "gc_grace_secs": "soon" }"#).is_err());
    }
}
