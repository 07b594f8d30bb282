//! Configuration types for usenet-writer

use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

use crate::error::{Error, Result};

/// Segment cache and disk write behaviour
///
/// Groups the tunables of the article cache, the background flusher and the
/// segment writer. Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Memory limit of the article cache in megabytes (default: 200, 0 = disabled)
    #[serde(default = "default_article_cache_mb")]
    pub article_cache_mb: usize,

    /// Per-file write buffer in kilobytes (default: 1024, 0 = platform default)
    #[serde(default = "default_write_buffer_kb")]
    pub write_buffer_kb: usize,

    /// Write segments directly at their final offset into a pre-allocated file (default: true)
    #[serde(default = "default_true")]
    pub direct_write: bool,

    /// Keep undecoded articles as numbered files instead of joining them (default: false)
    #[serde(default)]
    pub raw_article: bool,

    /// Skip downloading files that already exist at the destination (default: true)
    #[serde(default = "default_true")]
    pub dupe_check: bool,

    /// Dry run: account for segments but never write them to disk (default: false)
    #[serde(default)]
    pub skip_write: bool,

    /// Persist a "cache not empty" marker so an unclean shutdown can be detected (default: true)
    #[serde(default = "default_true")]
    pub continue_partial: bool,

    /// Drain the cache after this much idle polling (default: 5 seconds)
    #[serde(default = "default_idle_flush_interval", with = "duration_serde")]
    pub idle_flush_interval: Duration,

    /// Period of the flusher's occupancy check in milliseconds (default: 5)
    #[serde(default = "default_flush_poll_interval_ms")]
    pub flush_poll_interval_ms: u64,

    /// How long a writer keeps retrying a refused allocation while a drain is running
    /// before falling back to disk (default: 60 seconds)
    #[serde(default = "default_flush_wait_timeout", with = "duration_serde")]
    pub flush_wait_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            article_cache_mb: default_article_cache_mb(),
            write_buffer_kb: default_write_buffer_kb(),
            direct_write: true,
            raw_article: false,
            dupe_check: true,
            skip_write: false,
            continue_partial: true,
            idle_flush_interval: default_idle_flush_interval(),
            flush_poll_interval_ms: default_flush_poll_interval_ms(),
            flush_wait_timeout: default_flush_wait_timeout(),
        }
    }
}

impl CacheConfig {
    /// Cache ceiling in bytes
    pub fn max_bytes(&self) -> usize {
        self.article_cache_mb.saturating_mul(1024 * 1024)
    }

    /// Flusher poll period
    pub fn flush_poll_interval(&self) -> Duration {
        Duration::from_millis(self.flush_poll_interval_ms.max(1))
    }

    /// Write buffer size for a writer whose record size is `record_size`
    ///
    /// Returns `None` when the platform default buffer should be used. A
    /// record size of 0 means "unknown" and yields the full configured buffer.
    pub fn write_buffer_for(&self, record_size: usize) -> Option<usize> {
        if self.write_buffer_kb == 0 {
            return None;
        }
        let configured = self.write_buffer_kb * 1024;
        if record_size > 0 && record_size < configured {
            Some(record_size)
        } else {
            Some(configured)
        }
    }
}

/// Directory layout
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Download directory (default: "./downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Directory for per-segment temp files (default: "./temp")
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Intermediate directory used while downloads are in progress (None = write to destination)
    #[serde(default)]
    pub inter_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            temp_dir: default_temp_dir(),
            inter_dir: None,
        }
    }
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Database path (default: "./usenet-writer.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Main configuration for the writer engine
///
/// Cache and path settings are flattened so the serialized form is a single
/// flat object; persistence settings stay nested.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Cache and writer settings
    #[serde(flatten)]
    pub cache: CacheConfig,

    /// Directory layout
    #[serde(flatten)]
    pub paths: PathsConfig,

    /// Data storage and state management
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Config {
    /// Temporary directory
    pub fn temp_dir(&self) -> &PathBuf {
        &self.paths.temp_dir
    }

    /// Apply option interdependencies
    ///
    /// Raw-article mode stores every article as its own file, so direct-write
    /// is switched off for it.
    #[must_use]
    pub fn effective(mut self) -> Self {
        if self.cache.raw_article {
            self.cache.direct_write = false;
        }
        self
    }

    /// Check the configuration
    ///
    /// Returns an error for settings the engine cannot run with and a list of
    /// human-readable warnings for settings that work but perform poorly.
    pub fn validate(&self) -> Result<Vec<String>> {
        if self.paths.temp_dir.as_os_str().is_empty() {
            return Err(Error::Config {
                message: "temporary directory must not be empty".to_string(),
                key: Some("temp_dir".to_string()),
            });
        }
        if self.paths.download_dir.as_os_str().is_empty() {
            return Err(Error::Config {
                message: "download directory must not be empty".to_string(),
                key: Some("download_dir".to_string()),
            });
        }

        let mut warnings = Vec::new();
        let cache_mb = self.cache.article_cache_mb;

        if cache_mb == 0 {
            warnings.push(
                "article cache is disabled; enabling it is recommended to reduce disk fragmentation"
                    .to_string(),
            );
        } else if self.cache.direct_write && cache_mb < 50 {
            warnings.push("an article cache of at least 50 MB is recommended".to_string());
        } else if !self.cache.direct_write && cache_mb < 200 {
            warnings.push(
                "a cache under 200 MB is likely too small to hold complete files, \
                 forcing writes to the temporary directory"
                    .to_string(),
            );
        }

        if !self.cache.direct_write && !self.cache.raw_article {
            warnings.push(
                "direct write is disabled; articles are written to the temporary directory \
                 first and copied to the destination later"
                    .to_string(),
            );
        }

        match self.cache.write_buffer_kb {
            0 => warnings.push(
                "write buffer is 0; the platform default buffer is often too small".to_string(),
            ),
            kb if kb < 1024 => warnings
                .push("write buffer is very low; at least 1024 KB is recommended".to_string()),
            kb if kb > 102_400 => warnings.push(
                "write buffer is very large (>100 MB); it is allocated per open file".to_string(),
            ),
            _ => {}
        }

        Ok(warnings)
    }
}

fn default_article_cache_mb() -> usize {
    200
}

fn default_write_buffer_kb() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

fn default_idle_flush_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_flush_poll_interval_ms() -> u64 {
    5
}

fn default_flush_wait_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("./temp")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./usenet-writer.db")
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
