//! In-process transports used by the unit tests

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::transport::{HttpMethod, RequestBody, Transport, TransportRequest};
use crate::types::{DropboxError, ResponseBody, ResponseEnvelope};

/// Records every request and answers from a queue of canned responses
#[derive(Default)]
pub struct RecordingTransport {
    requests: Mutex<Vec<TransportRequest>>,
    responses: Mutex<VecDeque<Result<ResponseEnvelope, DropboxError>>>,
}

impl RecordingTransport {
    pub fn push(&self, response: Result<ResponseEnvelope, DropboxError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(
        &self,
        request: TransportRequest,
        sink: Option<&mut (dyn AsyncWrite + Unpin + Send)>,
    ) -> Result<ResponseEnvelope, DropboxError> {
        self.requests.lock().unwrap().push(request);
        let next = self.responses.lock().unwrap().pop_front();
        let mut response = next.unwrap_or_else(|| Ok(ResponseEnvelope::json(200, serde_json::json!({}))))?;

        let streamed = match (&response.body, sink) {
            (ResponseBody::Raw(bytes), Some(sink)) if response.is_success() => {
                sink.write_all(bytes).await?;
                Some(bytes.len() as u64)
            }
            _ => None,
        };
        if let Some(bytes_written) = streamed {
            response.body = ResponseBody::Streamed { bytes_written };
        }
        Ok(response)
    }
}

/// What the simulated server does with one chunk request
#[derive(Debug, Clone)]
pub enum Fault {
    /// Connection drops before anything is stored
    Transient,
    /// Only the first `n` bytes are stored; the reply is an offset correction
    PartialWrite(usize),
    /// The whole chunk is stored but the reply never arrives
    ApplyThenDrop,
    /// Answer with this response without touching any session
    Reply(ResponseEnvelope),
}

/// One chunk request as seen by the simulated server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutCall {
    pub upload_id: Option<String>,
    pub offset: Option<u64>,
    pub len: usize,
    /// Bytes the server had accepted for this session when the request arrived
    pub accepted_before: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitCall {
    pub upload_id: String,
    pub root: String,
    pub path: String,
    pub overwrite: bool,
    pub size: u64,
}

type FaultHook = Box<dyn FnMut(usize, &PutCall) -> Option<Fault> + Send>;

#[derive(Default)]
struct ServerState {
    next_id: u32,
    sessions: HashMap<String, Vec<u8>>,
    files: HashMap<String, Vec<u8>>,
    puts: Vec<PutCall>,
    commits: Vec<CommitCall>,
    commit_attempts: usize,
    commit_failures: VecDeque<u16>,
}

/// Chunked upload server living in memory
///
/// Follows the `chunked_upload` / `commit_chunked_upload` contract: a wrong
/// offset yields a 400 with the server offset, an unknown id yields a 404.
/// A fault hook sees every chunk request (with its index) before it is served.
#[derive(Default)]
pub struct SimulatedServer {
    state: Mutex<ServerState>,
    hook: Mutex<Option<FaultHook>>,
}

impl SimulatedServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(hook: impl FnMut(usize, &PutCall) -> Option<Fault> + Send + 'static) -> Self {
        let server = Self::default();
        *server.hook.lock().unwrap() = Some(Box::new(hook));
        server
    }

    /// Answer the next commits with these statuses before committing for real
    pub fn fail_commits(&self, statuses: &[u16]) {
        self.state.lock().unwrap().commit_failures.extend(statuses.iter().copied());
    }

    /// Forget a session, as the server does after ~24h of inactivity
    pub fn expire(&self, upload_id: &str) {
        self.state.lock().unwrap().sessions.remove(upload_id);
    }

    /// Pre-seed a session, e.g. one left behind by an interrupted process
    pub fn seed_session(&self, upload_id: &str, data: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .sessions
            .insert(upload_id.to_string(), data.to_vec());
    }

    pub fn puts(&self) -> Vec<PutCall> {
        self.state.lock().unwrap().puts.clone()
    }

    pub fn commits(&self) -> Vec<CommitCall> {
        self.state.lock().unwrap().commits.clone()
    }

    /// Commit requests received, failed ones included
    pub fn commit_attempts(&self) -> usize {
        self.state.lock().unwrap().commit_attempts
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    pub fn session_len(&self, upload_id: &str) -> Option<u64> {
        self.state
            .lock()
            .unwrap()
            .sessions
            .get(upload_id)
            .map(|data| data.len() as u64)
    }

    fn handle_put(
        &self,
        query: &HashMap<String, String>,
        body: RequestBody,
    ) -> Result<ResponseEnvelope, DropboxError> {
        let data = match body {
            RequestBody::Bytes(data) => data,
            RequestBody::Empty => Bytes::new(),
            other => return Err(DropboxError::Parse(format!("unsupported chunk body {:?}", other))),
        };

        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let upload_id = query.get("upload_id").cloned();
        let accepted_before = upload_id
            .as_ref()
            .and_then(|id| state.sessions.get(id))
            .map(|s| s.len() as u64)
            .unwrap_or(0);
        let call = PutCall {
            upload_id,
            offset: query.get("offset").and_then(|o| o.parse().ok()),
            len: data.len(),
            accepted_before,
        };
        let index = state.puts.len();
        state.puts.push(call.clone());

        let fault = self.hook.lock().unwrap().as_mut().and_then(|hook| hook(index, &call));
        match &fault {
            Some(Fault::Transient) => {
                return Err(DropboxError::Transport("connection reset by peer".to_string()))
            }
            Some(Fault::Reply(response)) => return Ok(response.clone()),
            _ => {}
        }

        let Some(upload_id) = call.upload_id else {
            state.next_id += 1;
            let upload_id = format!("sim-{}", state.next_id);
            state.sessions.insert(upload_id.clone(), data.to_vec());
            if matches!(fault, Some(Fault::ApplyThenDrop)) {
                return Err(DropboxError::Transport("operation timed out".to_string()));
            }
            return Ok(session_reply(200, &upload_id, data.len() as u64));
        };

        let Some(stored) = state.sessions.get_mut(&upload_id) else {
            return Ok(ResponseEnvelope::json(
                404,
                serde_json::json!({"error": "The requested upload_id was not found"}),
            ));
        };
        let stored_len = stored.len() as u64;
        if call.offset != Some(stored_len) {
            return Ok(session_reply(400, &upload_id, stored_len));
        }

        match fault {
            Some(Fault::PartialWrite(n)) => {
                stored.extend_from_slice(&data[..n.min(data.len())]);
                Ok(session_reply(400, &upload_id, stored.len() as u64))
            }
            Some(Fault::ApplyThenDrop) => {
                stored.extend_from_slice(&data);
                Err(DropboxError::Transport("operation timed out".to_string()))
            }
            _ => {
                stored.extend_from_slice(&data);
                Ok(session_reply(200, &upload_id, stored.len() as u64))
            }
        }
    }

    fn handle_commit(&self, target: &str, fields: BTreeMap<String, String>) -> ResponseEnvelope {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        state.commit_attempts += 1;

        if let Some(status) = state.commit_failures.pop_front() {
            return ResponseEnvelope::json(status, serde_json::json!({"error": "Internal Server Error"}));
        }

        let upload_id = fields.get("upload_id").cloned().unwrap_or_default();
        let Some(data) = state.sessions.remove(&upload_id) else {
            return ResponseEnvelope::json(
                404,
                serde_json::json!({"error": "The requested upload_id was not found"}),
            );
        };

        let target = urlencoding::decode(target)
            .map(|t| t.into_owned())
            .unwrap_or_else(|_| target.to_string());
        let (root, path) = target.split_once('/').unwrap_or((target.as_str(), ""));
        let size = data.len() as u64;
        state.commits.push(CommitCall {
            upload_id,
            root: root.to_string(),
            path: path.to_string(),
            overwrite: fields.get("overwrite").map(String::as_str) == Some("1"),
            size,
        });
        state.files.insert(path.to_string(), data);

        ResponseEnvelope::json(
            200,
            serde_json::json!({
                "size": format!("{} bytes", size),
                "rev": format!("{:x}", state.commits.len()),
                "thumb_exists": false,
                "bytes": size,
                "modified": "Tue, 19 Jul 2011 21:55:38 +0000",
                "path": format!("/{}", path),
                "is_dir": false,
                "icon": "page_white",
                "root": if root == "sandbox" { "app_folder" } else { "dropbox" },
                "mime_type": "application/octet-stream",
                "revision": state.commits.len()
            }),
        )
    }
}

fn session_reply(status: u16, upload_id: &str, offset: u64) -> ResponseEnvelope {
    ResponseEnvelope::json(
        status,
        serde_json::json!({
            "upload_id": upload_id,
            "offset": offset,
            "expires": "Tue, 19 Jul 2011 21:55:38 +0000"
        }),
    )
}

#[async_trait]
impl Transport for SimulatedServer {
    async fn send(
        &self,
        request: TransportRequest,
        _sink: Option<&mut (dyn AsyncWrite + Unpin + Send)>,
    ) -> Result<ResponseEnvelope, DropboxError> {
        let url = url::Url::parse(&request.url)
            .map_err(|e| DropboxError::Transport(format!("bad URL {}: {}", request.url, e)))?;
        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
        let path = url.path().to_string();

        match request.method {
            HttpMethod::Put if path.ends_with("/chunked_upload") => self.handle_put(&query, request.body),
            HttpMethod::Post => match path.split_once("/commit_chunked_upload/") {
                Some((_, target)) => {
                    let fields = match request.body {
                        RequestBody::Form(fields) => fields,
                        _ => query.into_iter().collect(),
                    };
                    Ok(self.handle_commit(target, fields))
                }
                None => Ok(ResponseEnvelope::json(404, serde_json::json!({"error": "Unknown endpoint"}))),
            },
            _ => Ok(ResponseEnvelope::json(404, serde_json::json!({"error": "Unknown endpoint"}))),
        }
    }
}
