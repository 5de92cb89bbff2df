use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Largest batch-write call the store accepts.
pub const MAX_WRITE_CHUNK_SIZE: usize = 25;

/// Largest batch-get call the store accepts.
pub const MAX_GET_CHUNK_SIZE: usize = 100;

/// Bulk operation chunking and concurrency.
///
/// # Validation Rules
///
/// - `write_chunk_size` must be in `1..=25`
/// - `get_chunk_size` must be in `1..=100`
/// - `concurrency` must be >= 1; unbounded fan-out is never allowed
///
/// # Example
///
/// ```no_run
/// # use tessera_types::config::BatchConfig;
/// let config = BatchConfig::builder()
///     .concurrency(4)
///     .build()
///     .expect("valid batch config");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BatchConfig {
    /// Items per batch-write call.
    #[serde(default = "default_write_chunk_size")]
    pub write_chunk_size: usize,
    /// Keys per batch-get call.
    #[serde(default = "default_get_chunk_size")]
    pub get_chunk_size: usize,
    /// Chunks dispatched at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

#[bon::bon]
impl BatchConfig {
    /// Creates a new batch configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if a chunk size is outside the
    /// store's limits or `concurrency` is 0.
    #[builder]
    pub fn new(
        #[builder(default = default_write_chunk_size())] write_chunk_size: usize,
        #[builder(default = default_get_chunk_size())] get_chunk_size: usize,
        #[builder(default = default_concurrency())] concurrency: usize,
    ) -> Result<Self, ConfigError> {
        let config = Self { write_chunk_size, get_chunk_size, concurrency };
        config.validate()?;
        Ok(config)
    }
}

impl BatchConfig {
    /// Validates the configuration values.
    ///
    /// Call after deserialization to ensure values are within valid ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_WRITE_CHUNK_SIZE).contains(&self.write_chunk_size) {
            return Err(ConfigError::Validation {
                message: format!(
                    "write_chunk_size ({}) must be in 1..={MAX_WRITE_CHUNK_SIZE}",
                    self.write_chunk_size
                ),
            });
        }
        if !(1..=MAX_GET_CHUNK_SIZE).contains(&self.get_chunk_size) {
            return Err(ConfigError::Validation {
                message: format!(
                    "get_chunk_size ({}) must be in 1..={MAX_GET_CHUNK_SIZE}",
                    self.get_chunk_size
                ),
            });
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Validation {
                message: "concurrency must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            write_chunk_size: default_write_chunk_size(),
            get_chunk_size: default_get_chunk_size(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_write_chunk_size() -> usize {
    MAX_WRITE_CHUNK_SIZE
}

fn default_get_chunk_size() -> usize {
    MAX_GET_CHUNK_SIZE
}

fn default_concurrency() -> usize {
    1
}
