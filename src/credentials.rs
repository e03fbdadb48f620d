//! OAuth 1.0 credentials and token providers
//!
//! The signer never reads tokens from a global cache: every call asks an
//! injected [`TokenProvider`] for the credentials that are active right now.
//! Persistence (files, databases, keyrings) is left to implementors.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::RwLock;
use tracing::info;

use crate::types::DropboxError;

/// Stage of the OAuth flow a token belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Short-lived, only used during the authorization handshake
    Request,
    /// Long-lived, used for all API calls
    Access,
}

/// Token + token secret pair
#[derive(Debug, Clone)]
pub struct OAuthToken {
    pub kind: TokenKind,
    pub token: String,
    pub secret: SecretString,
}

impl OAuthToken {
    pub fn request(token: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            kind: TokenKind::Request,
            token: token.into(),
            secret: SecretString::from(secret.into()),
        }
    }

    pub fn access(token: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            kind: TokenKind::Access,
            token: token.into(),
            secret: SecretString::from(secret.into()),
        }
    }
}

/// Consumer credentials plus the currently active token, if any
#[derive(Debug, Clone)]
pub struct Credentials {
    pub consumer_key: String,
    pub consumer_secret: SecretString,
    pub token: Option<OAuthToken>,
}

impl Credentials {
    /// Consumer-only credentials (before the handshake started)
    pub fn consumer(consumer_key: impl Into<String>, consumer_secret: impl Into<String>) -> Self {
        Self {
            consumer_key: consumer_key.into(),
            consumer_secret: SecretString::from(consumer_secret.into()),
            token: None,
        }
    }

    pub fn with_token(mut self, token: OAuthToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_ref().map(|t| t.token.as_str())
    }

    /// Token secret, empty when no token is active
    pub fn token_secret(&self) -> &str {
        self.token
            .as_ref()
            .map(|t| t.secret.expose_secret())
            .unwrap_or("")
    }

    pub fn token_kind(&self) -> Option<TokenKind> {
        self.token.as_ref().map(|t| t.kind)
    }
}

/// Source of the credentials used to sign each request
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn current_credentials(&self) -> Result<Credentials, DropboxError>;
}

/// A token provider that can also record tokens obtained during the handshake
#[async_trait]
pub trait TokenStore: TokenProvider {
    async fn store_token(&self, token: OAuthToken) -> Result<(), DropboxError>;
}

/// Fixed credentials, e.g. an access token loaded by the application
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    credentials: Credentials,
}

impl StaticTokenProvider {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn current_credentials(&self) -> Result<Credentials, DropboxError> {
        Ok(self.credentials.clone())
    }
}

#[derive(Debug, Default)]
struct TokenSlots {
    request: Option<OAuthToken>,
    access: Option<OAuthToken>,
}

/// In-memory token store
///
/// The access token wins over the request token; once an access token has
/// been stored the request slot is cleared and can no longer be filled.
#[derive(Debug)]
pub struct MemoryTokenStore {
    consumer_key: String,
    consumer_secret: SecretString,
    slots: RwLock<TokenSlots>,
}

impl MemoryTokenStore {
    pub fn new(consumer_key: impl Into<String>, consumer_secret: impl Into<String>) -> Self {
        Self {
            consumer_key: consumer_key.into(),
            consumer_secret: SecretString::from(consumer_secret.into()),
            slots: RwLock::new(TokenSlots::default()),
        }
    }

    /// Forget every token (e.g. after the server rejected the access token)
    pub async fn clear(&self) {
        let mut slots = self.slots.write().await;
        *slots = TokenSlots::default();
    }

    pub async fn has_access_token(&self) -> bool {
        self.slots.read().await.access.is_some()
    }
}

#[async_trait]
impl TokenProvider for MemoryTokenStore {
    async fn current_credentials(&self) -> Result<Credentials, DropboxError> {
        let slots = self.slots.read().await;
        let token = slots.access.clone().or_else(|| slots.request.clone());
        Ok(Credentials {
            consumer_key: self.consumer_key.clone(),
            consumer_secret: self.consumer_secret.clone(),
            token,
        })
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn store_token(&self, token: OAuthToken) -> Result<(), DropboxError> {
        let mut slots = self.slots.write().await;
        match token.kind {
            TokenKind::Request => {
                if slots.access.is_some() {
                    return Err(DropboxError::AuthError(
                        "An access token is already active; request tokens are no longer accepted"
                            .to_string(),
                    ));
                }
                slots.request = Some(token);
            }
            TokenKind::Access => {
                slots.request = None;
                slots.access = Some(token);
                info!("Access token stored");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_starts_without_token() {
        let store = MemoryTokenStore::new("key", "secret");
        let creds = store.current_credentials().await.unwrap();
        assert_eq!(creds.consumer_key, "key");
        assert!(creds.token().is_none());
        assert_eq!(creds.token_secret(), "");
    }

    #[tokio::test]
    async fn test_access_token_supersedes_request_token() {
        let store = MemoryTokenStore::new("key", "secret");
        store.store_token(OAuthToken::request("rt", "rts")).await.unwrap();
        assert_eq!(store.current_credentials().await.unwrap().token_kind(), Some(TokenKind::Request));

        store.store_token(OAuthToken::access("at", "ats")).await.unwrap();
        let creds = store.current_credentials().await.unwrap();
        assert_eq!(creds.token(), Some("at"));
        assert_eq!(creds.token_secret(), "ats");
        assert_eq!(creds.token_kind(), Some(TokenKind::Access));

        let err = store.store_token(OAuthToken::request("rt2", "rts2")).await.unwrap_err();
        assert!(matches!(err, DropboxError::AuthError(_)));
        assert_eq!(store.current_credentials().await.unwrap().token(), Some("at"));
    }

    #[tokio::test]
    async fn test_clear_resets_store() {
        let store = MemoryTokenStore::new("key", "secret");
        store.store_token(OAuthToken::access("at", "ats")).await.unwrap();
        assert!(store.has_access_token().await);
        store.clear().await;
        assert!(!store.has_access_token().await);
        store.store_token(OAuthToken::request("rt", "rts")).await.unwrap();
    }
}
