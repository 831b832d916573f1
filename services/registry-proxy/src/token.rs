//! Scoped bearer tokens and the token manager which acquires and caches them.

use std::fmt;
use std::time::Duration;

use http::header::{self, InvalidHeaderValue};
use http::{HeaderValue, StatusCode, Uri};
use http_body_util::BodyExt as _;
use hyperdriver::Body;
use serde::Deserialize;
use thiserror::Error;
use token_store::TokenStore;
use tower::ServiceExt as _;
use zeroize::Zeroize;

use crate::route::Scope;
use crate::upstream::UpstreamService;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Lifetime assumed for every token; the token service does not always send `expires_in`.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(300);

/// An opaque bearer credential for a single scope.
///
/// The value never appears in debug output and is zeroed on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    /// Wrap a raw token value.
    pub fn new<S: Into<String>>(value: S) -> Self {
        Token(value.into())
    }

    /// Expose the underlying token value.
    pub fn revealed(&self) -> &str {
        &self.0
    }

    /// The `Authorization` header value for this token, marked sensitive.
    pub fn bearer(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        let mut header = HeaderValue::try_from(format!("Bearer {}", self.0))?;
        header.set_sensitive(true);
        Ok(header)
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        self.0.zeroize()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(****)")
    }
}

/// Errors acquiring a token from the token service.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The token service could not be reached.
    #[error("Auth request failed: {0}")]
    Request(#[source] hyperdriver::client::Error),

    /// The token service answered with a non-success status.
    #[error("Failed to get auth token: {}", .0.canonical_reason().unwrap_or("Unknown Status"))]
    Status(StatusCode),

    /// The response body could not be read.
    #[error("Reading auth response: {0}")]
    Body(#[source] BoxError),

    /// The response body was not a token payload.
    #[error("Malformed auth response: {0}")]
    Payload(#[from] serde_json::Error),

    /// The token cannot be sent in an `Authorization` header.
    #[error("Auth token is not a valid header value")]
    InvalidToken,

    /// The token service URL could not be built.
    #[error("Invalid auth endpoint: {0}")]
    Endpoint(#[source] http::Error),

    /// The token service query could not be encoded.
    #[error("Encoding auth query: {0}")]
    Query(#[from] serde_urlencoded::ser::Error),
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

/// Acquires scoped pull tokens and caches them in a [`TokenStore`].
///
/// Requests to the token service are unauthenticated. There is no retry at
/// this layer; callers decide when to force a refresh.
#[derive(Debug, Clone)]
pub struct TokenManager {
    store: TokenStore,
    client: UpstreamService,
    endpoint: Uri,
    service: String,
    ttl: Duration,
}

impl TokenManager {
    /// Create a token manager for the token service at `endpoint`,
    /// requesting tokens for `service`.
    pub fn new<S: Into<String>>(
        store: TokenStore,
        client: UpstreamService,
        endpoint: Uri,
        service: S,
    ) -> Self {
        Self {
            store,
            client,
            endpoint,
            service: service.into(),
            ttl: DEFAULT_TOKEN_TTL,
        }
    }

    /// Set the lifetime used when caching tokens.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// The lifetime used when caching tokens.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Get a token for `scope`.
    ///
    /// Unless `force_refresh` is set, a cached token is returned without any
    /// network call. Otherwise a new token is fetched and cached.
    #[tracing::instrument(skip(self, scope), fields(scope = %scope))]
    pub async fn acquire(&self, scope: &Scope, force_refresh: bool) -> Result<Token, AuthError> {
        if !force_refresh {
            if let Some(token) = self.cached(scope).await {
                tracing::debug!("Using cached token");
                return Ok(token);
            }
        }

        tracing::debug!(forced = force_refresh, "Fetching token from {}", self.endpoint);
        let token = self.fetch(scope).await?;

        if let Err(error) = self
            .store
            .put(scope.as_str(), token.revealed(), self.ttl)
            .await
        {
            tracing::warn!(%error, "Failed to cache token");
        }

        Ok(token)
    }

    async fn cached(&self, scope: &Scope) -> Option<Token> {
        match self.store.get(scope.as_str()).await {
            Ok(Some(value)) => {
                let token = Token::new(value);
                if token.bearer().is_ok() {
                    Some(token)
                } else {
                    tracing::warn!("Ignoring cached token which is not a valid header value");
                    None
                }
            }
            Ok(None) => None,
            Err(error) => {
                tracing::warn!(%error, "Token cache lookup failed");
                None
            }
        }
    }

    fn token_uri(&self, scope: &Scope) -> Result<Uri, AuthError> {
        let query = serde_urlencoded::to_string([
            ("service", self.service.as_str()),
            ("scope", scope.as_str()),
        ])?;

        let endpoint = self.endpoint.to_string();
        let separator = if self.endpoint.query().is_some() { '&' } else { '?' };

        format!("{endpoint}{separator}{query}")
            .parse()
            .map_err(|err: http::uri::InvalidUri| AuthError::Endpoint(err.into()))
    }

    async fn fetch(&self, scope: &Scope) -> Result<Token, AuthError> {
        let req = http::Request::get(self.token_uri(scope)?)
            .header(header::ACCEPT, "application/json")
            .body(Body::empty())
            .map_err(AuthError::Endpoint)?;

        let resp = self
            .client
            .clone()
            .oneshot(req)
            .await
            .map_err(AuthError::Request)?;

        if !resp.status().is_success() {
            tracing::debug!(status = %resp.status(), "Token service rejected request");
            return Err(AuthError::Status(resp.status()));
        }

        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|err| AuthError::Body(err.into()))?
            .to_bytes();

        let payload: TokenResponse = serde_json::from_slice(&body)?;
        let token = Token::new(payload.token);
        token.bearer().map_err(|_| AuthError::InvalidToken)?;
        Ok(token)
    }
}
