//! Configuration types for the fetch engine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Concurrency ceiling used when a caller supplies none (or zero).
pub const DEFAULT_BATCH_SIZE: usize = 4;

/// Configuration for scheduling, transfers and caching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of work items in flight at once.
    pub batch_size: usize,
    /// Bytes received between two progress publications of one transfer.
    pub progress_batch_bytes: usize,
    /// Number of concurrent range requests per multi-part download.
    pub parts_per_file: usize,
    /// Deadline applied to guarded operations, in milliseconds.
    pub timeout_ms: u64,
    /// Whether a stopped transfer may return the bytes it already has.
    pub supports_partial_downloads: bool,
    /// Directory backing the persistent cache tier.
    pub cache_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            progress_batch_bytes: 64 * 1024,
            parts_per_file: 4,
            timeout_ms: 30_000,
            supports_partial_downloads: false,
            cache_dir: None,
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the concurrency ceiling.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the progress publication window in bytes.
    #[must_use]
    pub const fn with_progress_batch_bytes(mut self, bytes: usize) -> Self {
        self.progress_batch_bytes = bytes;
        self
    }

    /// Sets the number of parts per multi-part download.
    #[must_use]
    pub const fn with_parts_per_file(mut self, parts: usize) -> Self {
        self.parts_per_file = parts;
        self
    }

    /// Sets the guarded-operation deadline.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets whether stopped transfers may yield partial content.
    #[must_use]
    pub const fn with_partial_downloads(mut self, supported: bool) -> Self {
        self.supports_partial_downloads = supported;
        self
    }

    /// Sets the directory of the persistent cache tier.
    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Returns the effective concurrency ceiling, never zero.
    #[must_use]
    pub const fn effective_batch_size(&self) -> usize {
        if self.batch_size == 0 {
            DEFAULT_BATCH_SIZE
        } else {
            self.batch_size
        }
    }

    /// Returns the guarded-operation deadline.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Returns the cache directory, falling back to the user cache dir.
    #[must_use]
    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(default_cache_dir)
    }

    /// Returns the default location of the configuration file.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fetchpool")
            .join("config.toml")
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| Error::Config(e.to_string()))
    }

    /// Loads configuration from a TOML file, or defaults if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            log::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Saves the configuration atomically (write tmp + rename).
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let toml_str = toml::to_string(self).map_err(|e| Error::Config(e.to_string()))?;
        let tmp_path = path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, toml_str)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

/// Returns the default directory of the persistent cache tier.
#[must_use]
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fetchpool")
}
