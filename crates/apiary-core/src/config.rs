//! Config - 設定ファイル（TOML）
//!
//! # 例
//! ```toml
//! [storage]
//! path = "/var/lib/apiary"
//! flush_on_commit = true
//!
//! [claim]
//! bands = ["high", "medium", "low"]
//!
//! [lease]
//! timeout_ms = 60000
//! requeue_expired = true
//!
//! [retry]
//! max_attempts = 3
//! ```
//!
//! すべてのセクション・キーは省略可能（省略時はデフォルト値）。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{Priority, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiaryConfig {
    pub storage: StorageConfig,
    pub claim: ClaimConfig,
    pub lease: LeaseConfig,
    pub retry: RetryPolicy,
    pub watch: WatchConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// sled directory. None keeps everything in memory.
    pub path: Option<PathBuf>,
    pub tree: String,
    pub flush_on_commit: bool,
    /// Bound on lock waits in the in-memory backend.
    pub lock_timeout_ms: u64,
    /// Entries fetched per page by lazy scans.
    pub scan_page_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            tree: "tasks".to_string(),
            flush_on_commit: false,
            lock_timeout_ms: 5_000,
            scan_page_size: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimConfig {
    /// Bands in the order workers try them.
    pub bands: Vec<Priority>,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    /// Sweeps per `claim_next` before giving up on a contended pool.
    pub max_sweeps: u32,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            bands: Priority::ALL.to_vec(),
            backoff_base_ms: 10,
            backoff_max_ms: 1_000,
            backoff_multiplier: 2.0,
            max_sweeps: 8,
        }
    }
}

impl ClaimConfig {
    /// Backoff before the sweep that follows the `sweep`-th lost sweep (1-based),
    /// without jitter.
    pub fn backoff(&self, sweep: u32) -> Duration {
        let base = self.backoff_base_ms as f64;
        let exponent = sweep.saturating_sub(1).min(i32::MAX as u32) as i32;
        let ms = base * self.backoff_multiplier.powi(exponent);
        let max = self.backoff_max_ms as f64;
        if !ms.is_finite() || ms >= max {
            return Duration::from_millis(self.backoff_max_ms);
        }
        Duration::from_millis(ms.max(0.0) as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub timeout_ms: u64,
    pub reaper_interval_ms: u64,
    /// Put reaped tasks back into pending when the retry policy allows it.
    pub requeue_expired: bool,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 300_000,
            reaper_interval_ms: 5_000,
            requeue_expired: false,
        }
    }
}

impl LeaseConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Queue length per subscription before coalescing kicks in.
    pub mailbox_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1024,
        }
    }
}

impl ApiaryConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.storage.tree.is_empty() {
            return invalid("storage.tree must not be empty");
        }
        if self.storage.lock_timeout_ms == 0 {
            return invalid("storage.lock_timeout_ms must be positive");
        }
        if self.storage.scan_page_size == 0 {
            return invalid("storage.scan_page_size must be positive");
        }
        if self.claim.bands.is_empty() {
            return invalid("claim.bands must name at least one priority");
        }
        let mut seen = Vec::with_capacity(self.claim.bands.len());
        for band in &self.claim.bands {
            if seen.contains(band) {
                return Err(ConfigError::Invalid(format!(
                    "claim.bands lists {band} twice"
                )));
            }
            seen.push(*band);
        }
        if self.claim.max_sweeps == 0 {
            return invalid("claim.max_sweeps must be at least 1");
        }
        if self.claim.backoff_multiplier.is_nan() || self.claim.backoff_multiplier < 1.0 {
            return invalid("claim.backoff_multiplier must be >= 1.0");
        }
        if self.claim.backoff_base_ms > self.claim.backoff_max_ms {
            return invalid("claim.backoff_base_ms exceeds claim.backoff_max_ms");
        }
        if self.lease.timeout_ms == 0 {
            return invalid("lease.timeout_ms must be positive");
        }
        if self.lease.reaper_interval_ms == 0 {
            return invalid("lease.reaper_interval_ms must be positive");
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return invalid("retry.multiplier must be >= 1.0");
        }
        if self.watch.mailbox_capacity == 0 {
            return invalid("watch.mailbox_capacity must be positive");
        }
        Ok(())
    }
}
