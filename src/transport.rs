//! HTTP transport
//!
//! [`Transport`] executes exactly one signed HTTP request and returns a
//! normalized [`ResponseEnvelope`]. Request bodies and response sinks are
//! passed explicitly with each call; the transport keeps no per-call state.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::types::{DropboxError, ResponseBody, ResponseEnvelope};

/// HTTP methods used by the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request body source
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    /// `application/x-www-form-urlencoded` fields
    Form(BTreeMap<String, String>),
    /// Bounded in-memory data (e.g. one upload chunk)
    Bytes(Bytes),
    /// File-backed data streamed from disk; the length is read at send time
    File { path: PathBuf },
}

/// One HTTP request, already signed
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: HttpMethod,
    pub url: String,
    pub body: RequestBody,
}

impl TransportRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>, body: RequestBody) -> Self {
        Self {
            method,
            url: url.into(),
            body,
        }
    }
}

/// Executes one HTTP request
///
/// Connection and I/O failures are reported as [`DropboxError::Transport`];
/// every HTTP status (including 4xx/5xx) comes back as a response envelope.
/// When `sink` is given the response body is streamed into it instead of
/// being buffered.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: TransportRequest,
        sink: Option<&mut (dyn AsyncWrite + Unpin + Send)>,
    ) -> Result<ResponseEnvelope, DropboxError>;
}

/// [`Transport`] backed by reqwest
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a transport with the given timeout (`None` = no timeout)
    pub fn new(timeout: Option<Duration>) -> Result<Self, DropboxError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| DropboxError::InvalidConfig(format!("HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        request: TransportRequest,
        sink: Option<&mut (dyn AsyncWrite + Unpin + Send)>,
    ) -> Result<ResponseEnvelope, DropboxError> {
        use futures_util::StreamExt;
        use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};

        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
        };

        let builder = self.client.request(method, &request.url);
        let builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Form(fields) => {
                let encoded = fields
                    .iter()
                    .map(|(k, v)| format!("{}={}", crate::oauth1::percent_encode(k), crate::oauth1::percent_encode(v)))
                    .collect::<Vec<_>>()
                    .join("&");
                builder
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(encoded)
            }
            RequestBody::Bytes(bytes) => builder
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(bytes),
            RequestBody::File { path } => {
                // Stream file content without loading it into memory
                let file = tokio::fs::File::open(&path).await?;
                let len = file.metadata().await?.len();
                let stream = tokio_util::io::ReaderStream::new(file);
                builder
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .header(CONTENT_LENGTH, len.to_string())
                    .body(reqwest::Body::wrap_stream(stream))
            }
        };

        let response = builder
            .send()
            .await
            .map_err(|e| DropboxError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        debug!("{} {} -> {}", request.method, request.url.split('?').next().unwrap_or(""), status);

        let body = match sink {
            // Errors still come back as JSON; only stream successful bodies
            Some(sink) if (200..300).contains(&status) => {
                let mut stream = response.bytes_stream();
                let mut written = 0u64;
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| DropboxError::Transport(e.to_string()))?;
                    sink.write_all(&chunk)
                        .await
                        .map_err(|e| DropboxError::Transport(format!("Writing response body: {}", e)))?;
                    written += chunk.len() as u64;
                }
                sink.flush()
                    .await
                    .map_err(|e| DropboxError::Transport(format!("Flushing response body: {}", e)))?;
                ResponseBody::Streamed { bytes_written: written }
            }
            _ => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| DropboxError::Transport(e.to_string()))?;
                ResponseBody::from_bytes(bytes)
            }
        };

        Ok(ResponseEnvelope::new(status, headers, body))
    }
}
