//! Allocator configuration
//!
//! Loaded from TOML or built in code. Every field has a default, so an empty
//! document is a valid configuration:
//!
//! ```toml
//! max_attempts = 50          # omit to retry until success or cancellation
//! retry_backoff_ms = 5       # upper bound of the random sleep between attempts
//! fast_path_isolation = "read-uncommitted"
//! ```

use crate::core::store::IsolationLevel;
use crate::error::{PoolError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default upper bound of the jitter sleep between attempts
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AllocatorConfig {
    /// Attempts before giving up on a contended operation (None = unbounded)
    pub max_attempts: Option<u32>,

    /// Upper bound in milliseconds of the random sleep between attempts
    pub retry_backoff_ms: u64,

    /// Isolation level of the owner lookup done before the main transaction
    pub fast_path_isolation: IsolationLevel,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            max_attempts: None,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            fast_path_isolation: IsolationLevel::ReadUncommitted,
        }
    }
}

impl AllocatorConfig {
    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: AllocatorConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            PoolError::Config(format!("cannot read {:?}: {}", path.as_ref(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == Some(0) {
            return Err(PoolError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
