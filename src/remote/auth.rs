//! Credential providers.
//!
//! The client never knows how credentials are obtained. It asks a
//! [`TokenCache`] for the current credential; the cache asks its
//! [`TokenProvider`] at most once until a 401 forces a refresh.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use reqwest::RequestBuilder;
use serde::Deserialize;
use tokio::sync::Mutex;

use super::RemoteError;
use super::client::DEFAULT_TIMEOUT;

/// A credential ready to attach to a request.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Basic { username: String, password: String },
    Bearer(String),
}

impl Credential {
    /// Attach this credential to a request.
    #[must_use]
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Self::Basic { username, password } => request.basic_auth(username, Some(password)),
            Self::Bearer(token) => request.bearer_auth(token),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::Bearer(_) => f.debug_tuple("Bearer").field(&"<redacted>").finish(),
        }
    }
}

/// Source of credentials.
pub trait TokenProvider: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Obtain a fresh credential.
    fn acquire(&self) -> impl Future<Output = Result<Credential, RemoteError>> + Send;
}

/// OAuth grant used against the token endpoint.
#[derive(Clone, PartialEq, Eq)]
pub enum OAuthGrant {
    Password { username: String, password: String },
    ClientCredentials,
}

impl fmt::Debug for OAuthGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .finish_non_exhaustive(),
            Self::ClientCredentials => f.write_str("ClientCredentials"),
        }
    }
}

/// OAuth token endpoint client (`/oauth_token.do` by default).
pub struct OAuthProvider {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    grant: OAuthGrant,
    /// The token request runs under the cache lock, so it must not hang.
    timeout: Duration,
}

impl fmt::Debug for OAuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthProvider")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("grant", &self.grant)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl OAuthProvider {
    /// Provider for the instance's standard token endpoint.
    #[must_use]
    pub fn new(
        instance_url: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        grant: OAuthGrant,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            token_url: format!("{}/oauth_token.do", instance_url.trim_end_matches('/')),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            grant,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Per-request timeout for the token endpoint.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the token endpoint.
    #[must_use]
    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }

    async fn request_token(&self) -> Result<Credential, RemoteError> {
        let mut form: Vec<(&str, &str)> = vec![
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ];
        match &self.grant {
            OAuthGrant::Password { username, password } => {
                form.push(("grant_type", "password"));
                form.push(("username", username));
                form.push(("password", password));
            }
            OAuthGrant::ClientCredentials => form.push(("grant_type", "client_credentials")),
        }

        let response = self
            .http
            .post(&self.token_url)
            .timeout(self.timeout)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RemoteError::Auth(format!(
                        "token request timed out after {}s",
                        self.timeout.as_secs_f64()
                    ))
                } else {
                    RemoteError::Auth(format!("token request failed: {e}"))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Auth(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Auth(format!("failed to parse token response: {e}")))?;

        tracing::debug!(expires_in = ?token.expires_in, "Acquired OAuth access token");
        Ok(Credential::Bearer(token.access_token))
    }
}

/// The configured way of authenticating.
#[derive(Debug)]
pub enum AuthProvider {
    /// Fixed basic-auth or bearer credential.
    Static(Credential),
    OAuth(OAuthProvider),
}

impl TokenProvider for AuthProvider {
    fn name(&self) -> &'static str {
        match self {
            Self::Static(Credential::Basic { .. }) => "basic",
            Self::Static(Credential::Bearer(_)) => "token",
            Self::OAuth(_) => "oauth",
        }
    }

    async fn acquire(&self) -> Result<Credential, RemoteError> {
        match self {
            Self::Static(credential) => Ok(credential.clone()),
            Self::OAuth(provider) => provider.request_token().await,
        }
    }
}

/// Run-scoped credential cache with single-acquisition semantics.
///
/// Concurrent callers queue on the lock, so the provider is never asked
/// twice for the same credential.
pub struct TokenCache<P> {
    provider: P,
    slot: Mutex<Option<Credential>>,
    acquisitions: AtomicUsize,
}

impl<P: fmt::Debug> fmt::Debug for TokenCache<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("provider", &self.provider)
            .field("acquisitions", &self.acquisitions.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<P: TokenProvider> TokenCache<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            slot: Mutex::new(None),
            acquisitions: AtomicUsize::new(0),
        }
    }

    /// The cached credential, acquiring one on first use.
    ///
    /// # Errors
    ///
    /// Returns `RemoteError::Auth` if the provider fails.
    pub async fn current(&self) -> Result<Credential, RemoteError> {
        let mut slot = self.slot.lock().await;
        if let Some(credential) = slot.as_ref() {
            return Ok(credential.clone());
        }
        let credential = self.acquire_locked().await?;
        *slot = Some(credential.clone());
        Ok(credential)
    }

    /// Replace a rejected credential.
    ///
    /// If another caller already refreshed since `stale` was handed out, the
    /// newer credential is returned without asking the provider again.
    ///
    /// # Errors
    ///
    /// Returns `RemoteError::Auth` if the provider fails.
    pub async fn refresh(&self, stale: &Credential) -> Result<Credential, RemoteError> {
        let mut slot = self.slot.lock().await;
        if let Some(credential) = slot.as_ref().filter(|c| *c != stale) {
            return Ok(credential.clone());
        }
        *slot = None;
        tracing::info!(provider = self.provider.name(), "Credential rejected, re-acquiring");
        let credential = self.acquire_locked().await?;
        *slot = Some(credential.clone());
        Ok(credential)
    }

    /// How many times the provider has been asked.
    #[must_use]
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::Relaxed)
    }

    async fn acquire_locked(&self) -> Result<Credential, RemoteError> {
        let credential = self.provider.acquire().await?;
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(provider = self.provider.name(), "Acquired credential");
        Ok(credential)
    }
}
