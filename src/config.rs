// Client configuration
// Endpoints, access root, signing and chunking defaults

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::oauth1::SignatureMethod;
use crate::types::DropboxError;

/// Default chunk size for chunked uploads (4 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Hard ceiling imposed by the API on a single chunk (150 MiB)
pub const MAX_CHUNK_SIZE: usize = 157_286_400;

/// Root level for file paths
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessRoot {
    /// App folder access (preferred)
    #[default]
    Sandbox,
    /// Full account access
    Dropbox,
}

impl AccessRoot {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessRoot::Sandbox => "sandbox",
            AccessRoot::Dropbox => "dropbox",
        }
    }
}

impl fmt::Display for AccessRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessRoot {
    type Err = DropboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sandbox" => Ok(AccessRoot::Sandbox),
            "dropbox" => Ok(AccessRoot::Dropbox),
            other => Err(DropboxError::InvalidConfig(format!(
                "Expected a root of either 'dropbox' or 'sandbox', got '{}'",
                other
            ))),
        }
    }
}

/// Retry behavior for transient failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Additional attempts after the first one (default: 3)
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds (default: 1000)
    pub base_delay_ms: u64,
    /// Factor applied to the delay after every retry (default: 2)
    pub backoff_multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            backoff_multiplier: 2,
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Metadata/RPC endpoint
    pub api_url: String,
    /// File content endpoint
    pub content_url: String,
    /// Web endpoint (authorization page)
    pub web_url: String,
    pub root: AccessRoot,
    pub signature_method: SignatureMethod,
    /// Chunk size used by chunked uploads, in bytes
    pub chunk_size: usize,
    pub retry: RetryConfig,
    /// HTTP timeout in seconds (0 = no timeout)
    pub timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.dropbox.com/1/".to_string(),
            content_url: "https://api-content.dropbox.com/1/".to_string(),
            web_url: "https://www.dropbox.com/1/".to_string(),
            root: AccessRoot::default(),
            signature_method: SignatureMethod::HmacSha1,
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetryConfig::default(),
            timeout_secs: 30,
        }
    }
}

impl ClientConfig {
    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DropboxError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: ClientConfig = serde_json::from_str(&content)
            .map_err(|e| DropboxError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        tracing::debug!("Loaded client config from {:?}", path);
        Ok(config)
    }

    /// Validate endpoint URLs, chunk size and retry settings
    pub fn validate(&self) -> Result<(), DropboxError> {
        for (name, value) in [
            ("api_url", &self.api_url),
            ("content_url", &self.content_url),
            ("web_url", &self.web_url),
        ] {
            let url = url::Url::parse(value)
                .map_err(|e| DropboxError::InvalidConfig(format!("{} '{}': {}", name, value, e)))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(DropboxError::InvalidConfig(format!(
                    "{} must be an http(s) URL, got '{}'",
                    name, value
                )));
            }
            if !value.ends_with('/') {
                return Err(DropboxError::InvalidConfig(format!(
                    "{} must end with '/', got '{}'",
                    name, value
                )));
            }
        }

        validate_chunk_size(self.chunk_size)?;

        if self.retry.backoff_multiplier == 0 {
            return Err(DropboxError::InvalidConfig(
                "backoff_multiplier must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Replace the chunk size, rejecting values outside (0, 150 MiB]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Result<Self, DropboxError> {
        validate_chunk_size(chunk_size)?;
        self.chunk_size = chunk_size;
        Ok(self)
    }
}

pub(crate) fn validate_chunk_size(chunk_size: usize) -> Result<(), DropboxError> {
    if chunk_size == 0 {
        return Err(DropboxError::InvalidConfig(
            "Chunk size must be greater than zero".to_string(),
        ));
    }
    if chunk_size > MAX_CHUNK_SIZE {
        return Err(DropboxError::InvalidConfig(format!(
            "Chunk size must not exceed {} bytes, got {}",
            MAX_CHUNK_SIZE, chunk_size
        )));
    }
    Ok(())
}
