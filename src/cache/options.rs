//! Cache configuration

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};

/// Default maximum age of an unused cached file: 1 hour
const DEFAULT_MAX_AGE: Duration = Duration::from_secs(3600);

/// Default interval between cleaning passes: 1 minute
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Deserialize a duration given as whole seconds
fn deserialize_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}

/// Tunables for the cache and its cleaner
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheOptions {
    /// System cache directory, defaults to the platform cache dir
    pub cache_dir: Option<PathBuf>,
    /// Unused files older than this are evicted
    #[serde(deserialize_with = "deserialize_secs")]
    pub max_age: Duration,
    /// Eviction quota in bytes, 0 for no quota
    pub max_size: u64,
    /// Time between cleaning passes, zero disables the cleaner
    #[serde(deserialize_with = "deserialize_secs")]
    pub poll_interval: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            cache_dir: None,
            max_age: DEFAULT_MAX_AGE,
            max_size: 0,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl CacheOptions {
    /// Load options from the environment
    ///
    /// `CLOUDMOUNT_CACHE_CONFIG` names a JSON file to start from; the
    /// individual `CLOUDMOUNT_CACHE_*` variables override it.
    pub fn from_env() -> Result<Self> {
        let mut opts = match env::var_os("CLOUDMOUNT_CACHE_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };

        if let Some(dir) = env::var_os("CLOUDMOUNT_CACHE_DIR") {
            opts.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(secs) = env_u64("CLOUDMOUNT_CACHE_MAX_AGE")? {
            opts.max_age = Duration::from_secs(secs);
        }
        if let Some(bytes) = env_u64("CLOUDMOUNT_CACHE_MAX_SIZE")? {
            opts.max_size = bytes;
        }
        if let Some(secs) = env_u64("CLOUDMOUNT_CACHE_POLL_INTERVAL")? {
            opts.poll_interval = Duration::from_secs(secs);
        }

        Ok(opts)
    }

    /// Load options from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read cache config: {:?}", path))?;
        Self::from_json(&data).with_context(|| format!("Invalid cache config: {:?}", path))
    }

    /// Parse options from a JSON document; missing fields keep defaults
    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    /// The system cache directory to derive cache trees from
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("cloudmount")
        })
    }
}

/// Read an optional numeric environment variable
fn env_u64(key: &str) -> Result<Option<u64>> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .with_context(|| format!("{} must be a whole number, got {:?}", key, value)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = CacheOptions::default();
        assert_eq!(opts.max_age, Duration::from_secs(3600));
        assert_eq!(opts.max_size, 0);
        assert_eq!(opts.poll_interval, Duration::from_secs(60));
        assert!(opts.cache_dir().ends_with("cloudmount"));
    }

    #[test]
    fn test_from_json_partial() {
        let opts = CacheOptions::from_json(r#"{"maxSize": 1048576, "pollInterval": 0}"#).unwrap();
        assert_eq!(opts.max_size, 1048576);
        assert_eq!(opts.poll_interval, Duration::ZERO);
        assert_eq!(opts.max_age, DEFAULT_MAX_AGE);
        assert_eq!(opts.cache_dir, None);
    }

    #[test]
    fn test_from_json_full() {
        let json = r#"{
            "cacheDir": "/var/cache/cm",
            "maxAge": 120,
            "maxSize": 100,
            "pollInterval": 5
        }"#;
        let opts = CacheOptions::from_json(json).unwrap();
        assert_eq!(opts.cache_dir(), PathBuf::from("/var/cache/cm"));
        assert_eq!(opts.max_age, Duration::from_secs(120));
        assert_eq!(opts.max_size, 100);
        assert_eq!(opts.poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_from_json_rejects_negative() {
        assert!(CacheOptions::from_json(r#"{"maxAge": -1}"#).is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, r#"{"maxAge": 30}"#).unwrap();

        let opts = CacheOptions::from_file(&path).unwrap();
        assert_eq!(opts.max_age, Duration::from_secs(30));
        assert!(CacheOptions::from_file(&dir.path().join("missing.json")).is_err());
    }
}
