//! Shared types for the Dropbox client
//!
//! This module contains the error taxonomy, the normalized HTTP response
//! envelope, file metadata and the chunked upload session cursor.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Maximum number of body bytes quoted in error messages
const ERROR_BODY_LIMIT: usize = 200;

/// Client error type
///
/// Every member belongs to exactly one class: transient (retried by
/// [`crate::http_retry::RetryExecutor`]) or fatal (propagated unchanged).
#[derive(Error, Debug)]
pub enum DropboxError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Retry later: {0}")]
    RetryLater(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Offset disagreement ({reason}): us={client}, server={server}")]
    OffsetDisagreement {
        client: u64,
        server: u64,
        reason: &'static str,
    },

    #[error("Upload session expired: {0}")]
    SessionExpired(String),

    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unexpected HTTP status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl DropboxError {
    /// Check if this error is transient and the operation may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DropboxError::Transport(_)
                | DropboxError::ServerError { .. }
                | DropboxError::RetryLater(_)
                | DropboxError::RateLimited(_)
        )
    }

    /// Check if the server broke the documented chunked upload contract
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            DropboxError::ProtocolViolation(_)
                | DropboxError::OffsetDisagreement { .. }
                | DropboxError::UnexpectedStatus { .. }
        )
    }
}

impl From<reqwest::Error> for DropboxError {
    fn from(err: reqwest::Error) -> Self {
        DropboxError::Transport(err.to_string())
    }
}

/// Response body, structured when the server sent JSON
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(serde_json::Value),
    Raw(Bytes),
    /// Body was written to a caller-supplied sink
    Streamed { bytes_written: u64 },
}

impl ResponseBody {
    /// Build a body from raw bytes, parsing JSON when possible
    pub fn from_bytes(bytes: Bytes) -> Self {
        match serde_json::from_slice::<serde_json::Value>(&bytes) {
            Ok(value) if !value.is_null() => ResponseBody::Json(value),
            _ => ResponseBody::Raw(bytes),
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            ResponseBody::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Short human-readable excerpt for error messages
    pub fn excerpt(&self) -> String {
        let text = match self {
            ResponseBody::Json(value) => value.to_string(),
            ResponseBody::Raw(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            ResponseBody::Streamed { bytes_written } => {
                return format!("<{} bytes streamed>", bytes_written)
            }
        };
        if text.len() > ERROR_BODY_LIMIT {
            let mut end = ERROR_BODY_LIMIT;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &text[..end])
        } else {
            text
        }
    }
}

/// Normalized `{status, headers, body}` triple produced per request
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    pub status: u16,
    /// Header names are lower-cased
    pub headers: HashMap<String, String>,
    pub body: ResponseBody,
}

impl ResponseEnvelope {
    pub fn new(status: u16, headers: HashMap<String, String>, body: ResponseBody) -> Self {
        Self { status, headers, body }
    }

    pub fn json(status: u16, value: serde_json::Value) -> Self {
        Self::new(status, HashMap::new(), ResponseBody::Json(value))
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Server-supplied error message, if the body carries one
    pub fn error_message(&self) -> Option<String> {
        match self.body.as_json()?.get("error")? {
            serde_json::Value::String(message) => Some(message.clone()),
            serde_json::Value::Object(map) => map.values().next().map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            other => Some(other.to_string()),
        }
    }
}

/// Server-side state of a chunked upload: the opaque upload id and the
/// number of bytes durably accepted so far.
///
/// Callers that want to survive a process restart persist this value and
/// hand it back to [`crate::chunked::ChunkedUploadEngine::resume_chunked_upload`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    pub upload_id: String,
    pub offset: u64,
}

impl fmt::Display for UploadSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "upload_id={} offset={}", self.upload_id, self.offset)
    }
}

/// Failure of a whole chunked upload, with the last known session so the
/// caller can resume instead of starting from zero.
#[derive(Debug, Error)]
#[error("Chunked upload failed: {kind}")]
pub struct ChunkedUploadError {
    #[source]
    pub kind: DropboxError,
    /// `None` when the failure happened before the server assigned an upload id
    pub session: Option<UploadSession>,
}

impl ChunkedUploadError {
    pub fn new(kind: DropboxError, session: Option<UploadSession>) -> Self {
        Self { kind, session }
    }

    pub fn kind(&self) -> &DropboxError {
        &self.kind
    }
}

/// File metadata returned by the commit call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub path: String,
    /// Size in bytes
    #[serde(default)]
    pub bytes: u64,
    /// Human-readable size (e.g. "10 MB")
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default)]
    pub rev: Option<String>,
    #[serde(default)]
    pub revision: Option<u64>,
    /// RFC 2822 timestamp
    #[serde(default)]
    pub modified: Option<String>,
    #[serde(default)]
    pub client_mtime: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub thumb_exists: bool,
    #[serde(default)]
    pub icon: Option<String>,
}

impl FileMetadata {
    /// Parse the server modification time
    pub fn modified_at(&self) -> Option<chrono::DateTime<chrono::FixedOffset>> {
        self.modified
            .as_deref()
            .and_then(|m| chrono::DateTime::parse_from_rfc2822(m).ok())
    }

    /// Base name of the file
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(DropboxError::Transport("reset".into()).is_retryable());
        assert!(DropboxError::ServerError { status: 500, message: String::new() }.is_retryable());
        assert!(DropboxError::RetryLater("busy".into()).is_retryable());
        assert!(DropboxError::RateLimited("slow down".into()).is_retryable());

        assert!(!DropboxError::ProtocolViolation("x".into()).is_retryable());
        assert!(!DropboxError::SessionExpired("x".into()).is_retryable());
        assert!(!DropboxError::AuthError("x".into()).is_retryable());
        assert!(!DropboxError::BadRequest("x".into()).is_retryable());
        assert!(!DropboxError::OffsetDisagreement { client: 1, server: 0, reason: "behind" }.is_retryable());
    }

    #[test]
    fn test_protocol_violation_group() {
        assert!(DropboxError::UnexpectedStatus { status: 418, body: String::new() }.is_protocol_violation());
        assert!(DropboxError::OffsetDisagreement { client: 1, server: 9, reason: "ahead" }.is_protocol_violation());
        assert!(!DropboxError::SessionExpired("gone".into()).is_protocol_violation());
    }

    #[test]
    fn test_body_from_bytes() {
        let body = ResponseBody::from_bytes(Bytes::from_static(br#"{"offset": 4}"#));
        assert_eq!(body.as_json().unwrap()["offset"], 4);

        let raw = ResponseBody::from_bytes(Bytes::from_static(b"not json"));
        assert_eq!(raw, ResponseBody::Raw(Bytes::from_static(b"not json")));
    }

    #[test]
    fn test_error_message_shapes() {
        let flat = ResponseEnvelope::json(400, serde_json::json!({"error": "bad offset"}));
        assert_eq!(flat.error_message().as_deref(), Some("bad offset"));

        let nested = ResponseEnvelope::json(400, serde_json::json!({"error": {"path": "not found"}}));
        assert_eq!(nested.error_message().as_deref(), Some("not found"));
    }

    #[test]
    fn test_excerpt_truncates() {
        let long = ResponseBody::Raw(Bytes::from(vec![b'a'; 500]));
        let excerpt = long.excerpt();
        assert!(excerpt.ends_with("..."));
        assert_eq!(excerpt.len(), ERROR_BODY_LIMIT + 3);
    }

    #[test]
    fn test_metadata_deserialize() {
        let json = r#"{
            "size": "10 MB", "rev": "1f33043551", "thumb_exists": false, "bytes": 10485760,
            "modified": "Tue, 19 Jul 2011 21:55:38 +0000", "path": "/backups/big.bin",
            "is_dir": false, "icon": "page_white", "root": "app_folder",
            "mime_type": "application/octet-stream", "revision": 496342
        }"#;
        let meta: FileMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.bytes, 10 * 1024 * 1024);
        assert_eq!(meta.name(), "big.bin");
        assert!(meta.modified_at().is_some());
    }
}
