//! OAuth 1.0 request signing (RFC 5849)
//!
//! Builds the canonical signature base string and a signed request for any
//! method/endpoint/parameter combination. Supports `HMAC-SHA1` and
//! `PLAINTEXT`. Also hosts the three-legged handshake helpers (request
//! token, authorize URL, access token), which go through [`DropboxClient`].

use base64::Engine;
use hmac::{Hmac, Mac};
use rand::Rng;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

use crate::client::{unexpected_status, DropboxClient};
use crate::credentials::{Credentials, OAuthToken, TokenStore};
use crate::transport::{HttpMethod, RequestBody};
use crate::types::{DropboxError, ResponseBody};

type HmacSha1 = Hmac<Sha1>;

const OAUTH_VERSION: &str = "1.0";

/// Signature method, selectable at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureMethod {
    #[serde(rename = "HMAC-SHA1")]
    HmacSha1,
    #[serde(rename = "PLAINTEXT")]
    Plaintext,
}

impl SignatureMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureMethod::HmacSha1 => "HMAC-SHA1",
            SignatureMethod::Plaintext => "PLAINTEXT",
        }
    }
}

impl fmt::Display for SignatureMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignatureMethod {
    type Err = DropboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HMAC-SHA1" => Ok(SignatureMethod::HmacSha1),
            "PLAINTEXT" => Ok(SignatureMethod::Plaintext),
            other => Err(DropboxError::InvalidConfig(format!(
                "Unsupported signature method '{}', expected HMAC-SHA1 or PLAINTEXT",
                other
            ))),
        }
    }
}

/// A request parameter value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Text(String),
    /// File data; only the declared filename is ever signed
    FileContent { path: PathBuf, filename: String },
    /// Dropped before signing
    Null,
}

impl ParamValue {
    /// Parse a raw value, recognizing the `@path[;filename=name]` file sentinel
    pub fn parse(raw: &str) -> Self {
        let Some(rest) = raw.strip_prefix('@') else {
            return ParamValue::Text(raw.to_string());
        };
        match rest.split_once(";filename=") {
            Some((path, filename)) => ParamValue::FileContent {
                path: PathBuf::from(path),
                filename: filename.to_string(),
            },
            None => {
                let filename = Path::new(rest)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| rest.to_string());
                ParamValue::FileContent {
                    path: PathBuf::from(rest),
                    filename,
                }
            }
        }
    }

    /// Value that enters the signature base string
    fn signing_value(&self) -> Option<&str> {
        match self {
            ParamValue::Text(value) => Some(value),
            ParamValue::FileContent { filename, .. } => Some(filename),
            ParamValue::Null => None,
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Text(value)
    }
}

impl From<&String> for ParamValue {
    fn from(value: &String) -> Self {
        ParamValue::Text(value.clone())
    }
}

impl From<u64> for ParamValue {
    fn from(value: u64) -> Self {
        ParamValue::Text(value.to_string())
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Text(if value { "1" } else { "0" }.to_string())
    }
}

impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(ParamValue::Null)
    }
}

/// A signed request descriptor: one instance per call attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    pub method: HttpMethod,
    /// Base URL + endpoint path, without query
    pub endpoint: String,
    /// Every signed parameter plus `oauth_signature`, sorted by key
    pub params: BTreeMap<String, String>,
    pub signature: String,
}

impl SignedRequest {
    /// Percent-encoded `k=v&...` query string
    pub fn query_string(&self) -> String {
        self.params
            .iter()
            .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Final URL with all parameters in the query string
    pub fn url(&self) -> String {
        format!("{}?{}", self.endpoint, self.query_string())
    }

    /// The same parameters, for use as POST form fields
    pub fn form_fields(&self) -> &BTreeMap<String, String> {
        &self.params
    }
}

/// OAuth 1.0 request signer
#[derive(Debug, Clone, Copy)]
pub struct Signer {
    method: SignatureMethod,
}

impl Signer {
    pub fn new(method: SignatureMethod) -> Self {
        Self { method }
    }

    /// Sign a request with a fresh timestamp and nonce
    pub fn sign<K, I>(
        &self,
        http_method: HttpMethod,
        base_url: &str,
        call: &str,
        params: I,
        creds: &Credentials,
    ) -> SignedRequest
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, ParamValue)>,
    {
        self.sign_at(
            http_method,
            base_url,
            call,
            params,
            creds,
            &generate_timestamp(),
            &generate_nonce(),
        )
    }

    /// Sign with an explicit timestamp and nonce (only used for `HMAC-SHA1`)
    #[allow(clippy::too_many_arguments)]
    pub fn sign_at<K, I>(
        &self,
        http_method: HttpMethod,
        base_url: &str,
        call: &str,
        params: I,
        creds: &Credentials,
        timestamp: &str,
        nonce: &str,
    ) -> SignedRequest
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, ParamValue)>,
    {
        // 1. Standard parameters
        let mut merged: BTreeMap<String, ParamValue> = BTreeMap::new();
        merged.insert("oauth_consumer_key".into(), creds.consumer_key.as_str().into());
        merged.insert("oauth_token".into(), creds.token().into());
        merged.insert("oauth_signature_method".into(), self.method.as_str().into());
        merged.insert("oauth_version".into(), OAUTH_VERSION.into());
        if self.method == SignatureMethod::HmacSha1 {
            merged.insert("oauth_timestamp".into(), timestamp.into());
            merged.insert("oauth_nonce".into(), nonce.into());
        }

        // 2. Caller parameters override standard ones; BTreeMap keeps them sorted by key
        for (key, value) in params {
            merged.insert(key.into(), value);
        }
        let mut signed: BTreeMap<String, String> = merged
            .iter()
            .filter_map(|(k, v)| v.signing_value().map(|v| (k.clone(), v.to_string())))
            .collect();

        // 3. Base string and signature
        let endpoint = format!("{}{}", base_url, call);
        let base = signature_base_string(http_method.as_str(), &endpoint, &signed);
        let signature = compute_signature(
            self.method,
            &base,
            creds.consumer_secret.expose_secret(),
            creds.token_secret(),
        );

        debug!("Signed {} {} ({})", http_method, endpoint, self.method);

        signed.insert("oauth_signature".into(), signature.clone());
        SignedRequest {
            method: http_method,
            endpoint,
            params: signed,
            signature,
        }
    }
}

/// RFC 3986 percent-encoding (uppercase hex, unreserved chars only)
pub fn percent_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len() * 2);
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}

/// `METHOD&encode(url)&encode(sorted k=v pairs)`
pub fn signature_base_string(method: &str, url: &str, params: &BTreeMap<String, String>) -> String {
    let param_string = params
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    format!(
        "{}&{}&{}",
        method.to_uppercase(),
        percent_encode(url),
        percent_encode(&param_string)
    )
}

/// Compute the signature for a base string. The key is `consumer_secret&token_secret`.
pub fn compute_signature(
    method: SignatureMethod,
    base_string: &str,
    consumer_secret: &str,
    token_secret: &str,
) -> String {
    let key = format!("{}&{}", consumer_secret, token_secret);
    match method {
        SignatureMethod::Plaintext => key,
        SignatureMethod::HmacSha1 => {
            let mut mac = HmacSha1::new_from_slice(key.as_bytes())
                .expect("HMAC accepts any key length");
            mac.update(base_string.as_bytes());
            base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
        }
    }
}

/// Generate a random nonce (32 alphanumeric chars)
pub fn generate_nonce() -> String {
    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| {
            let idx: u8 = rng.gen_range(0..36);
            if idx < 10 {
                (b'0' + idx) as char
            } else {
                (b'a' + idx - 10) as char
            }
        })
        .collect()
}

/// Current Unix timestamp as string
pub fn generate_timestamp() -> String {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        .to_string()
}

// ============ Authorization handshake ============

const REQUEST_TOKEN_CALL: &str = "oauth/request_token";
const AUTHORIZE_CALL: &str = "oauth/authorize";
const ACCESS_TOKEN_CALL: &str = "oauth/access_token";

/// Step 1: obtain a request token and record it in the store.
///
/// The client must sign with the same store, so the request is made with
/// consumer credentials only.
pub async fn obtain_request_token(
    client: &DropboxClient,
    store: &dyn TokenStore,
) -> Result<OAuthToken, DropboxError> {
    let api_url = client.config().api_url.clone();
    let response = client
        .fetch(HttpMethod::Post, &api_url, REQUEST_TOKEN_CALL, Vec::<(String, ParamValue)>::new(), RequestBody::Empty)
        .await?;
    if !response.is_success() {
        return Err(unexpected_status(&response));
    }

    let (token, secret) = parse_token_response(&response.body)?;
    let token = OAuthToken::request(token, secret);
    store.store_token(token.clone()).await?;
    info!("Obtained OAuth request token");
    Ok(token)
}

/// Step 2: URL the user visits to authorize the request token
pub fn authorize_url(web_url: &str, request_token: &str, callback: Option<&str>) -> String {
    let mut url = format!(
        "{}{}?oauth_token={}",
        web_url,
        AUTHORIZE_CALL,
        percent_encode(request_token)
    );
    if let Some(callback) = callback {
        url.push_str("&oauth_callback=");
        url.push_str(&percent_encode(callback));
    }
    url
}

/// Step 3: exchange the authorized request token for an access token
pub async fn obtain_access_token(
    client: &DropboxClient,
    store: &dyn TokenStore,
) -> Result<OAuthToken, DropboxError> {
    let api_url = client.config().api_url.clone();
    let response = client
        .fetch(HttpMethod::Post, &api_url, ACCESS_TOKEN_CALL, Vec::<(String, ParamValue)>::new(), RequestBody::Empty)
        .await?;
    if !response.is_success() {
        return Err(unexpected_status(&response));
    }

    let (token, secret) = parse_token_response(&response.body)?;
    let token = OAuthToken::access(token, secret);
    store.store_token(token.clone()).await?;
    info!("Obtained OAuth access token");
    Ok(token)
}

/// Parse an `oauth_token=xxx&oauth_token_secret=yyy` response body
fn parse_token_response(body: &ResponseBody) -> Result<(String, String), DropboxError> {
    let text = match body {
        ResponseBody::Raw(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        ResponseBody::Json(value) => {
            // Some servers answer with JSON instead of a form body
            let field = |name: &str| value.get(name).and_then(|v| v.as_str()).map(str::to_string);
            return match (field("oauth_token"), field("oauth_token_secret")) {
                (Some(token), Some(secret)) => Ok((token, secret)),
                _ => Err(DropboxError::Parse("Missing oauth_token in response".to_string())),
            };
        }
        ResponseBody::Streamed { .. } => {
            return Err(DropboxError::Parse("Token response was streamed".to_string()))
        }
    };

    let pairs: HashMap<String, String> = text
        .trim()
        .split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let v = urlencoding::decode(v).map(|v| v.into_owned()).unwrap_or_else(|_| v.to_string());
            Some((k.to_string(), v))
        })
        .collect();

    let token = pairs
        .get("oauth_token")
        .ok_or_else(|| DropboxError::Parse("Missing oauth_token in response".to_string()))?
        .clone();
    let secret = pairs
        .get("oauth_token_secret")
        .ok_or_else(|| DropboxError::Parse("Missing oauth_token_secret in response".to_string()))?
        .clone();

    Ok((token, secret))
}
