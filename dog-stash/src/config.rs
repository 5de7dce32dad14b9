use std::path::PathBuf;
use std::time::Duration;

use crate::{StashError, StashResult};

const MB: u64 = 1024 * 1024;
const DAY_SECS: u64 = 24 * 60 * 60;

/// Configuration for stash operations
#[derive(Debug, Clone)]
pub struct StashConfig {
    /// Ceiling for a single file
    pub max_file_bytes: u64,

    /// Ceiling for everything one account stores
    pub max_account_bytes: u64,

    /// Length of generated file identifiers
    pub short_id_length: usize,

    /// How long account summaries and listings stay cached
    pub cache_ttl: Duration,

    /// Files uploaded longer ago than this are expired
    pub retention: Duration,

    /// Prefix for public download references
    pub base_url: String,

    /// Root directory for the filesystem blob store
    pub storage_root: PathBuf,

    /// How many fresh identifiers to try before giving up on a collision
    pub id_attempts: u32,

    /// Resumable uploads one account may have open at once
    pub max_open_uploads: usize,
}

impl Default for StashConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: 10 * MB,
            max_account_bytes: 500 * MB,
            short_id_length: 8,
            cache_ttl: Duration::from_secs(300), // 5 minutes
            retention: Duration::from_secs(90 * 24 * 60 * 60),
            base_url: "http://localhost:8000".to_string(),
            storage_root: PathBuf::from("uploads"),
            id_attempts: 16,
            max_open_uploads: 8,
        }
    }
}

impl StashConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load overrides from the process environment.
    ///
    /// Recognised variables: `FILE_SIZE_LIMIT_MB`, `TOTAL_SIZE_LIMIT_MB`,
    /// `DEFAULT_SHORT_PATH_LENGTH`, `CACHE_TTL` (seconds), `RETENTION_DAYS`,
    /// `BASE_URL`, `BASE_FOLDER` and `MAX_OPEN_UPLOADS`. Anything unset keeps
    /// its default.
    pub fn from_env() -> StashResult<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Same as [`StashConfig::from_env`] but over an explicit set of pairs.
    pub fn from_vars<I, K, V>(vars: I) -> StashResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in vars {
            let key = key.as_ref();
            let value = value.as_ref().trim();
            match key {
                "FILE_SIZE_LIMIT_MB" => config.max_file_bytes = parse_scaled(key, value, MB)?,
                "TOTAL_SIZE_LIMIT_MB" => config.max_account_bytes = parse_scaled(key, value, MB)?,
                "DEFAULT_SHORT_PATH_LENGTH" => {
                    let length = parse_usize(key, value)?;
                    if length == 0 {
                        return Err(StashError::config(key, "must be at least 1"));
                    }
                    config.short_id_length = length;
                }
                "CACHE_TTL" => config.cache_ttl = Duration::from_secs(parse_u64(key, value)?),
                "RETENTION_DAYS" => {
                    config.retention = Duration::from_secs(parse_scaled(key, value, DAY_SECS)?)
                }
                "MAX_OPEN_UPLOADS" => config.max_open_uploads = parse_usize(key, value)?,
                "BASE_URL" => config.base_url = value.trim_end_matches('/').to_string(),
                "BASE_FOLDER" => config.storage_root = PathBuf::from(value),
                _ => {}
            }
        }
        Ok(config)
    }

    /// Set the per-file ceiling
    pub fn with_max_file_bytes(mut self, bytes: u64) -> Self {
        self.max_file_bytes = bytes;
        self
    }

    /// Set the per-account ceiling
    pub fn with_max_account_bytes(mut self, bytes: u64) -> Self {
        self.max_account_bytes = bytes;
        self
    }

    /// Set generated identifier length
    pub fn with_short_id_length(mut self, length: usize) -> Self {
        self.short_id_length = length.max(1);
        self
    }

    /// Set cache TTL
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Set the expiry retention window
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Set the public URL prefix
    pub fn with_base_url<S: Into<String>>(mut self, base_url: S) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set how many resumable uploads one account may hold open
    pub fn with_max_open_uploads(mut self, max: usize) -> Self {
        self.max_open_uploads = max;
        self
    }

    /// Set the filesystem storage root
    pub fn with_storage_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.storage_root = root.into();
        self
    }
}

fn parse_u64(key: &str, value: &str) -> StashResult<u64> {
    value
        .parse::<u64>()
        .map_err(|e| StashError::config(key, format!("{value:?} is not a number: {e}")))
}

fn parse_usize(key: &str, value: &str) -> StashResult<usize> {
    usize::try_from(parse_u64(key, value)?)
        .map_err(|_| StashError::config(key, format!("{value} is out of range")))
}

/// Parse a count of `unit`s into base units
fn parse_scaled(key: &str, value: &str, unit: u64) -> StashResult<u64> {
    parse_u64(key, value)?
        .checked_mul(unit)
        .ok_or_else(|| StashError::config(key, format!("{value} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment() {
        let config = StashConfig::default();
        assert_eq!(config.max_file_bytes, 10 * MB);
        assert_eq!(config.max_account_bytes, 500 * MB);
        assert_eq!(config.short_id_length, 8);
        assert_eq!(config.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.retention, Duration::from_secs(90 * 86_400));
        assert_eq!(config.max_open_uploads, 8);
    }

    #[test]
    fn reads_overrides_from_vars() {
        let config = StashConfig::from_vars([
            ("FILE_SIZE_LIMIT_MB", "2"),
            ("TOTAL_SIZE_LIMIT_MB", "20"),
            ("DEFAULT_SHORT_PATH_LENGTH", "12"),
            ("CACHE_TTL", "5"),
            ("RETENTION_DAYS", "30"),
            ("BASE_URL", "https://files.example.com/"),
            ("BASE_FOLDER", "/srv/stash"),
            ("MAX_OPEN_UPLOADS", "3"),
            ("UNRELATED", "ignored"),
        ])
        .unwrap();

        assert_eq!(config.max_file_bytes, 2 * MB);
        assert_eq!(config.max_account_bytes, 20 * MB);
        assert_eq!(config.short_id_length, 12);
        assert_eq!(config.cache_ttl, Duration::from_secs(5));
        assert_eq!(config.retention, Duration::from_secs(30 * 86_400));
        assert_eq!(config.base_url, "https://files.example.com");
        assert_eq!(config.storage_root, PathBuf::from("/srv/stash"));
        assert_eq!(config.max_open_uploads, 3);
    }

    #[test]
    fn rejects_garbage_numbers() {
        let err = StashConfig::from_vars([("FILE_SIZE_LIMIT_MB", "ten")]).unwrap_err();
        assert!(matches!(err, StashError::Config { ref key, .. } if key == "FILE_SIZE_LIMIT_MB"));

        let err = StashConfig::from_vars([("DEFAULT_SHORT_PATH_LENGTH", "0")]).unwrap_err();
        assert!(matches!(err, StashError::Config { .. }));
    }

    #[test]
    fn rejects_values_that_overflow_their_unit() {
        let max = u64::MAX.to_string();
        for key in ["FILE_SIZE_LIMIT_MB", "TOTAL_SIZE_LIMIT_MB", "RETENTION_DAYS"] {
            let err = StashConfig::from_vars([(key, max.as_str())]).unwrap_err();
            assert!(
                matches!(err, StashError::Config { key: ref k, .. } if k == key),
                "{key}: {err:?}"
            );
        }

        // largest whole count that still fits
        let fits = (u64::MAX / MB).to_string();
        let config = StashConfig::from_vars([("FILE_SIZE_LIMIT_MB", fits.as_str())]).unwrap();
        assert_eq!(config.max_file_bytes, (u64::MAX / MB) * MB);
    }
}
