//! Resumable chunked uploads
//!
//! A local file is sent as a sequence of chunks appended to one server-side
//! upload session, then committed to its destination path. Chunks go out
//! strictly in order: every append depends on the offset the server confirmed
//! for the previous one.
//!
//! When the server disagrees with our offset it answers with its own. Such a
//! correction is only trusted when it points inside the chunk just sent; the
//! bytes the server already holds are then trimmed off and the rest is sent
//! again. Anything else is fatal and surfaces with the last known session so
//! the caller can decide whether to resume.

use bytes::Bytes;
use std::io::SeekFrom;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use crate::client::{encode_path, normalise_path, unexpected_status, DropboxClient};
use crate::config::validate_chunk_size;
use crate::http_retry::RetryExecutor;
use crate::oauth1::ParamValue;
use crate::transport::{HttpMethod, RequestBody};
use crate::types::{ChunkedUploadError, DropboxError, FileMetadata, ResponseEnvelope, UploadSession};

const CHUNKED_UPLOAD_CALL: &str = "chunked_upload";
const COMMIT_CALL: &str = "commit_chunked_upload";

/// Progress callback: `(bytes_uploaded, total_bytes)`
pub type ProgressCallback = Box<dyn Fn(u64, u64) + Send + Sync>;

/// Result of appending one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// The whole chunk was stored; `offset` is the new session offset
    Accepted { offset: u64 },
    /// The server already held part of the chunk and now sits at `offset`,
    /// somewhere after the offset we sent and no further than its end
    Corrected { offset: u64 },
    /// The server does not know the upload id (anymore)
    SessionExpired,
}

/// Result of committing a session
#[derive(Debug, Clone, PartialEq)]
pub enum FinishOutcome {
    Committed(FileMetadata),
    SessionExpired,
}

/// Drives chunked uploads through a [`DropboxClient`]
pub struct ChunkedUploadEngine {
    client: DropboxClient,
    retry: RetryExecutor,
    max_retries: u32,
    chunk_size: usize,
    on_progress: Option<ProgressCallback>,
}

impl ChunkedUploadEngine {
    /// Chunk size and retry policy are taken from the client configuration
    pub fn new(client: DropboxClient) -> Self {
        let retry = RetryExecutor::new(&client.config().retry);
        let max_retries = client.config().retry.max_retries;
        let chunk_size = client.config().chunk_size;
        Self {
            client,
            retry,
            max_retries,
            chunk_size,
            on_progress: None,
        }
    }

    pub fn with_progress(mut self, on_progress: impl Fn(u64, u64) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Box::new(on_progress));
        self
    }

    /// Open a new session with its first chunk.
    ///
    /// The server must report exactly the chunk length as the new offset;
    /// any other value is a protocol violation and is not retried.
    pub async fn start_upload(&self, chunk: Bytes) -> Result<UploadSession, DropboxError> {
        let len = chunk.len() as u64;
        let session = self
            .retry
            .run_with_retry(self.max_retries, || self.start_once(chunk.clone()))
            .await?;

        if session.offset != len {
            warn!(
                "Session {} started at offset {} after a {} byte chunk",
                session.upload_id, session.offset, len
            );
            return Err(DropboxError::ProtocolViolation(format!(
                "Server reported offset {} after the first chunk of {} bytes",
                session.offset, len
            )));
        }

        info!("Started upload session {}", session);
        Ok(session)
    }

    /// Append `chunk` at `offset` to an existing session
    pub async fn continue_upload(
        &self,
        upload_id: &str,
        offset: u64,
        chunk: Bytes,
    ) -> Result<ChunkOutcome, DropboxError> {
        let len = chunk.len() as u64;
        let response = self
            .retry
            .run_with_retry(self.max_retries, || self.append_once(upload_id, offset, chunk.clone()))
            .await?;

        match response.status {
            404 => {
                warn!("Upload session {} is unknown to the server", upload_id);
                Ok(ChunkOutcome::SessionExpired)
            }
            400 => {
                let Some(correction) = parse_session(&response) else {
                    return Err(unexpected_status(&response));
                };
                validate_correction(upload_id, offset, len, &correction)?;
                debug!(
                    "Server already holds {} of {} bytes sent at offset {}",
                    correction.offset - offset,
                    len,
                    offset
                );
                Ok(ChunkOutcome::Corrected {
                    offset: correction.offset,
                })
            }
            _ => {
                let session = parse_session(&response).ok_or_else(|| {
                    DropboxError::ProtocolViolation(format!(
                        "Malformed chunk response: {}",
                        response.body.excerpt()
                    ))
                })?;
                if session.upload_id != upload_id {
                    return Err(DropboxError::ProtocolViolation(format!(
                        "Chunk for {} accepted under upload id {}",
                        upload_id, session.upload_id
                    )));
                }
                if session.offset != offset + len {
                    return Err(DropboxError::ProtocolViolation(format!(
                        "Server reported offset {} after appending {} bytes at {}",
                        session.offset, len, offset
                    )));
                }
                Ok(ChunkOutcome::Accepted {
                    offset: session.offset,
                })
            }
        }
    }

    /// Commit a session to `path` (relative to the configured root)
    pub async fn finish_upload(
        &self,
        upload_id: &str,
        path: &str,
        overwrite: bool,
    ) -> Result<FinishOutcome, DropboxError> {
        let call = format!("{}/{}/{}", COMMIT_CALL, self.client.root(), encode_path(path));
        let response = self
            .retry
            .run_with_retry(self.max_retries, || self.commit_once(&call, upload_id, overwrite))
            .await?;

        if response.status == 404 {
            warn!("Commit of {} failed, session unknown to the server", upload_id);
            return Ok(FinishOutcome::SessionExpired);
        }

        let json = response.body.as_json().ok_or_else(|| {
            DropboxError::Parse(format!("Commit response is not JSON: {}", response.body.excerpt()))
        })?;
        let metadata: FileMetadata = serde_json::from_value(json.clone())
            .map_err(|e| DropboxError::Parse(format!("Commit metadata: {}", e)))?;

        info!("Committed upload {} to {} ({} bytes)", upload_id, metadata.path, metadata.bytes);
        Ok(FinishOutcome::Committed(metadata))
    }

    /// Upload a local file to `destination_dir`, named `destination_name`
    /// or after the local file. `chunk_size` overrides the configured size.
    pub async fn chunked_upload(
        &self,
        file_path: impl AsRef<Path>,
        destination_name: Option<&str>,
        destination_dir: &str,
        overwrite: bool,
        chunk_size: Option<usize>,
    ) -> Result<FileMetadata, ChunkedUploadError> {
        let file_path = file_path.as_ref();
        let chunk_size = self.effective_chunk_size(chunk_size).map_err(before_session)?;
        let destination =
            destination_path(file_path, destination_name, destination_dir).map_err(before_session)?;

        let mut file = tokio::fs::File::open(file_path)
            .await
            .map_err(|e| before_session(e.into()))?;
        let total = file
            .metadata()
            .await
            .map_err(|e| before_session(e.into()))?
            .len();
        info!("Uploading {:?} ({} bytes) to {} in chunks of {}", file_path, total, destination, chunk_size);

        let first = read_chunk(&mut file, chunk_size)
            .await
            .map_err(|e| before_session(e.into()))?;
        let session = self.start_upload(first).await.map_err(before_session)?;
        self.report_progress(session.offset, total);

        self.upload_remaining(&mut file, session, total, &destination, overwrite, chunk_size)
            .await
    }

    /// Continue an interrupted upload from a saved session
    #[allow(clippy::too_many_arguments)]
    pub async fn resume_chunked_upload(
        &self,
        file_path: impl AsRef<Path>,
        destination_name: Option<&str>,
        destination_dir: &str,
        overwrite: bool,
        chunk_size: Option<usize>,
        session: UploadSession,
    ) -> Result<FileMetadata, ChunkedUploadError> {
        let file_path = file_path.as_ref();
        let fail = |kind: DropboxError| ChunkedUploadError::new(kind, Some(session.clone()));

        let chunk_size = self.effective_chunk_size(chunk_size).map_err(fail)?;
        let destination =
            destination_path(file_path, destination_name, destination_dir).map_err(fail)?;

        let mut file = tokio::fs::File::open(file_path)
            .await
            .map_err(|e| fail(e.into()))?;
        let total = file.metadata().await.map_err(|e| fail(e.into()))?.len();
        if session.offset > total {
            return Err(fail(DropboxError::InvalidConfig(format!(
                "Session offset {} is beyond the end of {:?} ({} bytes)",
                session.offset, file_path, total
            ))));
        }
        file.seek(SeekFrom::Start(session.offset))
            .await
            .map_err(|e| fail(e.into()))?;
        info!("Resuming {} for {:?} ({} bytes)", session, file_path, total);

        self.upload_remaining(&mut file, session, total, &destination, overwrite, chunk_size)
            .await
    }

    async fn upload_remaining<R: AsyncRead + Unpin>(
        &self,
        reader: &mut R,
        mut session: UploadSession,
        total: u64,
        destination: &str,
        overwrite: bool,
        chunk_size: usize,
    ) -> Result<FileMetadata, ChunkedUploadError> {
        loop {
            let chunk = match read_chunk(reader, chunk_size).await {
                Ok(chunk) => chunk,
                Err(e) => return Err(ChunkedUploadError::new(e.into(), Some(session))),
            };
            if chunk.is_empty() {
                break;
            }
            if let Err(e) = self.send_chunk(&mut session, chunk).await {
                warn!("Chunked upload stopped at {}: {}", session, e);
                return Err(ChunkedUploadError::new(e, Some(session)));
            }
            self.report_progress(session.offset, total);
        }

        match self.finish_upload(&session.upload_id, destination, overwrite).await {
            Ok(FinishOutcome::Committed(metadata)) => Ok(metadata),
            Ok(FinishOutcome::SessionExpired) => Err(ChunkedUploadError::new(
                DropboxError::SessionExpired(format!(
                    "Commit failed, upload {} unknown to the server",
                    session.upload_id
                )),
                Some(session),
            )),
            Err(e) => Err(ChunkedUploadError::new(e, Some(session))),
        }
    }

    /// Send one chunk, following corrections until all of it is stored
    async fn send_chunk(&self, session: &mut UploadSession, mut chunk: Bytes) -> Result<(), DropboxError> {
        while !chunk.is_empty() {
            match self
                .continue_upload(&session.upload_id, session.offset, chunk.clone())
                .await?
            {
                ChunkOutcome::Accepted { offset } => {
                    session.offset = offset;
                    return Ok(());
                }
                ChunkOutcome::Corrected { offset } => {
                    let stored = (offset - session.offset) as usize;
                    chunk = chunk.slice(stored..);
                    session.offset = offset;
                }
                ChunkOutcome::SessionExpired => {
                    return Err(DropboxError::SessionExpired(format!(
                        "Upload {} unknown to the server",
                        session.upload_id
                    )));
                }
            }
        }
        Ok(())
    }

    async fn start_once(&self, chunk: Bytes) -> Result<UploadSession, DropboxError> {
        let response = self.put_chunk(Vec::new(), chunk).await?;
        if !response.is_success() {
            return Err(unexpected_status(&response));
        }
        parse_session(&response).ok_or_else(|| {
            DropboxError::ProtocolViolation(format!(
                "Malformed session start response: {}",
                response.body.excerpt()
            ))
        })
    }

    /// 400 and 404 carry meaning for appends; they are interpreted by the caller
    async fn append_once(
        &self,
        upload_id: &str,
        offset: u64,
        chunk: Bytes,
    ) -> Result<ResponseEnvelope, DropboxError> {
        let params = vec![
            ("upload_id", ParamValue::from(upload_id)),
            ("offset", ParamValue::from(offset)),
        ];
        let response = self.put_chunk(params, chunk).await?;
        match response.status {
            200..=299 | 400 | 404 => Ok(response),
            _ => Err(unexpected_status(&response)),
        }
    }

    async fn commit_once(
        &self,
        call: &str,
        upload_id: &str,
        overwrite: bool,
    ) -> Result<ResponseEnvelope, DropboxError> {
        let params = vec![
            ("upload_id", ParamValue::from(upload_id)),
            ("overwrite", ParamValue::from(overwrite)),
        ];
        let content_url = &self.client.config().content_url;
        let response = self
            .client
            .fetch(HttpMethod::Post, content_url, call, params, RequestBody::Empty)
            .await?;
        if response.is_success() || response.status == 404 {
            return Ok(response);
        }

        Err(match unexpected_status(&response) {
            err if err.is_retryable() => err,
            DropboxError::AuthError(message) => DropboxError::AuthError(message),
            _ => DropboxError::UnexpectedStatus {
                status: response.status,
                body: response.body.excerpt(),
            },
        })
    }

    async fn put_chunk(
        &self,
        params: Vec<(&'static str, ParamValue)>,
        chunk: Bytes,
    ) -> Result<ResponseEnvelope, DropboxError> {
        let content_url = &self.client.config().content_url;
        self.client
            .fetch(HttpMethod::Put, content_url, CHUNKED_UPLOAD_CALL, params, RequestBody::Bytes(chunk))
            .await
    }

    fn effective_chunk_size(&self, chunk_size: Option<usize>) -> Result<usize, DropboxError> {
        let chunk_size = chunk_size.unwrap_or(self.chunk_size);
        validate_chunk_size(chunk_size)?;
        Ok(chunk_size)
    }

    fn report_progress(&self, done: u64, total: u64) {
        if let Some(ref progress) = self.on_progress {
            progress(done, total);
        }
    }
}

fn before_session(kind: DropboxError) -> ChunkedUploadError {
    ChunkedUploadError::new(kind, None)
}

fn parse_session(response: &ResponseEnvelope) -> Option<UploadSession> {
    let json = response.body.as_json()?;
    serde_json::from_value(json.clone()).ok()
}

/// A correction is trusted only when it lands inside the chunk just sent
fn validate_correction(
    upload_id: &str,
    offset: u64,
    len: u64,
    correction: &UploadSession,
) -> Result<(), DropboxError> {
    if correction.upload_id != upload_id {
        return Err(DropboxError::ProtocolViolation(format!(
            "Offset correction for upload id {} while sending {}",
            correction.upload_id, upload_id
        )));
    }
    if correction.offset == offset {
        return Err(DropboxError::ProtocolViolation(format!(
            "Server rejected offset {} and reported the same offset back",
            offset
        )));
    }
    if correction.offset < offset {
        warn!("Server lost data: at {} while we sent {}", correction.offset, offset);
        return Err(DropboxError::OffsetDisagreement {
            client: offset,
            server: correction.offset,
            reason: "server is behind",
        });
    }
    if correction.offset > offset + len {
        warn!("Server at {} is past the chunk {}..{}", correction.offset, offset, offset + len);
        return Err(DropboxError::OffsetDisagreement {
            client: offset,
            server: correction.offset,
            reason: "server is ahead by more than one chunk",
        });
    }
    Ok(())
}

/// Remote path for the upload: `dir/name`, normalised
fn destination_path(
    file_path: &Path,
    destination_name: Option<&str>,
    destination_dir: &str,
) -> Result<String, DropboxError> {
    let name = match destination_name {
        Some(name) => name.to_string(),
        None => file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                DropboxError::InvalidConfig(format!("Cannot derive a file name from {:?}", file_path))
            })?,
    };
    if normalise_path(&name).is_empty() {
        return Err(DropboxError::InvalidConfig("Destination name is empty".to_string()));
    }
    Ok(normalise_path(&format!(
        "{}/{}",
        destination_dir.trim_end_matches('/'),
        name
    )))
}

/// Read up to `chunk_size` bytes; a short chunk means the source is exhausted
async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, chunk_size: usize) -> std::io::Result<Bytes> {
    let mut buf = Vec::with_capacity(chunk_size);
    reader.take(chunk_size as u64).read_to_end(&mut buf).await?;
    Ok(Bytes::from(buf))
}
