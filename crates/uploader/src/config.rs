//! Uploader configuration, loadable from JSON.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use mule_protocol::{Acl, MIN_PART_SIZE};
use mule_transfer::DEFAULT_CHUNK_SIZE;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Errors produced while loading or validating a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Every recognized option. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    /// Bytes per chunk; every chunk but the last must reach the backend minimum.
    pub chunk_size: u64,
    /// Largest accepted file in bytes; 0 means unlimited.
    pub max_file_size: u64,
    /// Chunk uploads kept in flight at once.
    pub num_workers: usize,
    /// Start uploading as soon as a file is accepted.
    pub auto_start: bool,
    pub retry_timeout_ms: u64,
    pub retry_limit: u32,
    /// Allowed extensions without the leading dot; empty accepts anything.
    pub accepted_extensions: Vec<String>,
    pub acl: Acl,

    pub bucket: String,
    /// Storage endpoint; defaults to `http://{bucket}.s3.amazonaws.com`.
    pub host: Option<String>,
    pub access_key: String,
    /// Content type sent when the file has no MIME type of its own.
    pub content_type: String,
    /// Fixed object key.
    pub key: Option<String>,
    /// Key prefix; a random suffix is appended per selected file.
    pub base_key: Option<String>,

    /// Base URL of the signing service.
    pub signing_base_url: String,
    /// Forwarded verbatim on every signing-service call.
    pub extra_params: BTreeMap<String, String>,

    pub watchdog_interval_ms: u64,
    pub stall_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_file_size: 0,
            num_workers: 4,
            auto_start: true,
            retry_timeout_ms: 1000,
            retry_limit: 5,
            accepted_extensions: Vec::new(),
            acl: Acl::default(),
            bucket: String::new(),
            host: None,
            access_key: String::new(),
            content_type: "application/octet-stream".into(),
            key: None,
            base_key: None,
            signing_base_url: "/upload-backend".into(),
            extra_params: BTreeMap::new(),
            watchdog_interval_ms: 4000,
            stall_timeout_ms: 15_000,
            poll_interval_ms: 1000,
        }
    }
}

impl UploaderConfig {
    /// Parses a configuration from JSON.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Loads a configuration from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    /// Checks the values that would make an upload impossible.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be greater than zero".into()));
        }
        if self.num_workers == 0 {
            return Err(ConfigError::Invalid("num_workers must be greater than zero".into()));
        }
        if self.retry_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "retry_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.watchdog_interval_ms == 0 || self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "watchdog and poll intervals must be greater than zero".into(),
            ));
        }
        if self.host.as_deref().is_none_or(str::is_empty) && self.bucket.is_empty() {
            return Err(ConfigError::Invalid("either host or bucket is required".into()));
        }
        if self.chunk_size < MIN_PART_SIZE {
            warn!(
                chunk_size = self.chunk_size,
                minimum = MIN_PART_SIZE,
                "chunk size is below the backend minimum part size; multi-chunk uploads will be rejected"
            );
        }
        Ok(())
    }

    /// Storage endpoint without a trailing slash.
    pub fn host(&self) -> String {
        match self.host.as_deref() {
            Some(host) if !host.is_empty() => host.trim_end_matches('/').to_string(),
            _ => format!("http://{}.s3.amazonaws.com", self.bucket),
        }
    }

    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
