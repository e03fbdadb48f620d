//! Dropbox API client core
//!
//! OAuth 1.0 request signing, a pluggable HTTP transport, retry with
//! exponential backoff and a resumable chunked upload engine.
//!
//! ```no_run
//! use std::sync::Arc;
//! use dbxchunk::{ChunkedUploadEngine, ClientConfig, Credentials, DropboxClient, OAuthToken, StaticTokenProvider};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let credentials = Credentials::consumer("app-key", "app-secret")
//!     .with_token(OAuthToken::access("token", "token-secret"));
//! let client = DropboxClient::with_reqwest(
//!     ClientConfig::default(),
//!     Arc::new(StaticTokenProvider::new(credentials)),
//! )?;
//!
//! let engine = ChunkedUploadEngine::new(client)
//!     .with_progress(|done, total| println!("{done}/{total}"));
//! match engine.chunked_upload("backup.tar", None, "/backups", true, None).await {
//!     Ok(metadata) => println!("stored {} ({} bytes)", metadata.path, metadata.bytes),
//!     // Keep the session around to resume later
//!     Err(e) => eprintln!("{} (session: {:?})", e, e.session),
//! }
//! # Ok(())
//! # }
//! ```

pub mod chunked;
pub mod client;
pub mod config;
pub mod credentials;
pub mod http_retry;
pub mod oauth1;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use chunked::{ChunkOutcome, ChunkedUploadEngine, FinishOutcome, ProgressCallback};
pub use client::DropboxClient;
pub use config::{AccessRoot, ClientConfig, RetryConfig};
pub use credentials::{Credentials, MemoryTokenStore, OAuthToken, StaticTokenProvider, TokenKind, TokenProvider, TokenStore};
pub use http_retry::{RetryExecutor, Retryable};
pub use oauth1::{ParamValue, SignatureMethod, SignedRequest, Signer};
pub use transport::{HttpMethod, ReqwestTransport, RequestBody, Transport, TransportRequest};
pub use types::{ChunkedUploadError, DropboxError, FileMetadata, ResponseBody, ResponseEnvelope, UploadSession};
