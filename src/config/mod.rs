//! Application configuration management

use std::env;
use std::path::PathBuf;

use anyhow::{ensure, Context, Result};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum concurrent downloads dispatched from the queue
    pub max_concurrent_downloads: usize,

    /// Root directory for per-download storage folders
    pub download_root: PathBuf,

    /// Enable DHT for peer discovery
    pub enable_dht: bool,
}

impl Config {
    pub fn new(max_concurrent_downloads: usize, download_root: PathBuf) -> Result<Self> {
        ensure!(
            max_concurrent_downloads >= 1,
            "max_concurrent_downloads must be at least 1"
        );

        Ok(Self {
            max_concurrent_downloads,
            download_root,
            enable_dht: true,
        })
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let max_concurrent_downloads = env::var("MAX_CONCURRENT_DOWNLOADS")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .context("Invalid MAX_CONCURRENT_DOWNLOADS")?;

        let download_root = env::var("DOWNLOADS_PATH")
            .unwrap_or_else(|_| "./data/downloads".to_string())
            .into();

        let enable_dht = env::var("ENABLE_DHT")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        let mut config = Self::new(max_concurrent_downloads, download_root)?;
        config.enable_dht = enable_dht;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_zero_concurrency() {
        assert!(Config::new(0, PathBuf::from("/tmp/downloads")).is_err());
    }

    #[test]
    fn test_accepts_minimum_concurrency() {
        let config = Config::new(1, PathBuf::from("/tmp/downloads")).unwrap();
        assert_eq!(config.max_concurrent_downloads, 1);
        assert!(config.enable_dht);
    }
}
