//! Dropbox API client
//!
//! [`DropboxClient`] ties the pieces together: it asks the token provider for
//! the current credentials, signs the call, hands it to the transport and
//! returns the raw response envelope. Interpreting status codes is left to
//! the caller, which knows what a 400 or a 404 means for its endpoint.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWrite;
use tracing::debug;

use crate::config::{AccessRoot, ClientConfig};
use crate::credentials::TokenProvider;
use crate::oauth1::{percent_encode, ParamValue, Signer};
use crate::transport::{HttpMethod, ReqwestTransport, RequestBody, Transport, TransportRequest};
use crate::types::{DropboxError, ResponseEnvelope};

/// Signed access to the Dropbox API
#[derive(Clone)]
pub struct DropboxClient {
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn TokenProvider>,
    config: ClientConfig,
    signer: Signer,
}

impl fmt::Debug for DropboxClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DropboxClient")
            .field("config", &self.config)
            .field("signer", &self.signer)
            .finish_non_exhaustive()
    }
}

impl DropboxClient {
    /// Create a client with an explicit transport
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self, DropboxError> {
        config.validate()?;
        let signer = Signer::new(config.signature_method);
        Ok(Self {
            transport,
            tokens,
            config,
            signer,
        })
    }

    /// Create a client backed by [`ReqwestTransport`]
    pub fn with_reqwest(
        config: ClientConfig,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self, DropboxError> {
        let timeout = (config.timeout_secs > 0).then(|| Duration::from_secs(config.timeout_secs));
        let transport = Arc::new(ReqwestTransport::new(timeout)?);
        Self::new(config, transport, tokens)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn root(&self) -> AccessRoot {
        self.config.root
    }

    /// Sign and send one API call.
    ///
    /// POST calls without an explicit body send the signed parameters as
    /// form fields to the bare endpoint. Every other call carries the
    /// parameters in the query string next to the given body.
    pub async fn fetch<K, I>(
        &self,
        method: HttpMethod,
        base_url: &str,
        call: &str,
        params: I,
        body: RequestBody,
    ) -> Result<ResponseEnvelope, DropboxError>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, ParamValue)>,
    {
        let request = self.build_request(method, base_url, call, params, body).await?;
        self.transport.send(request, None).await
    }

    /// Like [`fetch`](Self::fetch) for GET calls whose body is streamed into `sink`
    pub async fn fetch_into<K, I>(
        &self,
        base_url: &str,
        call: &str,
        params: I,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<ResponseEnvelope, DropboxError>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, ParamValue)>,
    {
        let request = self
            .build_request(HttpMethod::Get, base_url, call, params, RequestBody::Empty)
            .await?;
        self.transport.send(request, Some(sink)).await
    }

    async fn build_request<K, I>(
        &self,
        method: HttpMethod,
        base_url: &str,
        call: &str,
        params: I,
        body: RequestBody,
    ) -> Result<TransportRequest, DropboxError>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, ParamValue)>,
    {
        let credentials = self.tokens.current_credentials().await?;
        let signed = self.signer.sign(method, base_url, call, params, &credentials);

        let request = match (method, body) {
            (HttpMethod::Post, RequestBody::Empty) => TransportRequest::new(
                method,
                signed.endpoint.clone(),
                RequestBody::Form(signed.form_fields().clone()),
            ),
            (_, body) => TransportRequest::new(method, signed.url(), body),
        };
        debug!("{} {} ({} params)", method, signed.endpoint, signed.params.len());
        Ok(request)
    }
}

/// Map a non-2xx response without endpoint-specific meaning to an error
pub fn unexpected_status(response: &ResponseEnvelope) -> DropboxError {
    let message = response
        .error_message()
        .unwrap_or_else(|| response.body.excerpt());
    match response.status {
        400 => DropboxError::BadRequest(message),
        401 => DropboxError::AuthError(message),
        429 => DropboxError::RateLimited(message),
        503 => DropboxError::RetryLater(message),
        status @ (500 | 502 | 504) => DropboxError::ServerError { status, message },
        status => DropboxError::UnexpectedStatus {
            status,
            body: message,
        },
    }
}

/// Collapse slash runs and strip leading/trailing slashes
pub fn normalise_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Percent-encode a path for use in a URL, keeping `/` separators literal
pub fn encode_path(path: &str) -> String {
    normalise_path(path)
        .split('/')
        .map(percent_encode)
        .collect::<Vec<_>>()
        .join("/")
}
