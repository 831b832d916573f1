//! The forwarding engine: authenticated upstream requests with a single
//! refresh-and-resend on `401` and a single redirect hop.

use bytes::Bytes;
use http::header::{self, HeaderMap};
use http::{Method, StatusCode, Uri};
use hyperdriver::Body;
use thiserror::Error;
use tower::ServiceExt as _;
use url::Url;

use crate::route::Scope;
use crate::token::{AuthError, Token, TokenManager};
use crate::upstream::{Request, Response, UpstreamService, strip_hop_by_hop};

/// Errors raised while forwarding a request upstream.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// A token could not be acquired.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// A redirect response carried no `Location` header.
    #[error("Redirect location not found")]
    RedirectLocationMissing,

    /// A redirect `Location` could not be turned into a URL.
    #[error("Invalid redirect location: {0}")]
    RedirectLocationInvalid(String),

    /// The upstream could not be reached.
    #[error("Upstream request failed: {0}")]
    Upstream(#[source] hyperdriver::client::Error),

    /// The upstream request could not be built.
    #[error("Building upstream request: {0}")]
    Request(#[from] http::Error),
}

#[derive(Debug)]
enum Payload {
    Buffered(Bytes),
    Streaming(Option<Body>),
}

/// The parts of an inbound request which are relayed upstream.
///
/// A buffered body can be sent any number of times, so the request can be
/// resent after a token refresh. A streaming body is sent once.
#[derive(Debug)]
pub struct UpstreamRequest {
    method: Method,
    headers: HeaderMap,
    payload: Payload,
}

impl UpstreamRequest {
    /// Capture the method, headers and buffered body of an inbound request.
    ///
    /// `Host` and hop-by-hop headers are dropped.
    pub fn new(method: Method, headers: HeaderMap, body: Bytes) -> Self {
        Self::with_payload(method, headers, Payload::Buffered(body))
    }

    /// Capture an inbound request whose body is streamed upstream on the first attempt.
    pub fn streaming(method: Method, headers: HeaderMap, body: Body) -> Self {
        Self::with_payload(method, headers, Payload::Streaming(Some(body)))
    }

    fn with_payload(method: Method, mut headers: HeaderMap, payload: Payload) -> Self {
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);

        Self {
            method,
            headers,
            payload,
        }
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The headers which will be sent upstream.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable access to the headers which will be sent upstream.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Whether the body can be sent again after it has been sent once.
    pub fn is_replayable(&self) -> bool {
        matches!(self.payload, Payload::Buffered(_))
    }

    fn body(&mut self) -> Body {
        match &mut self.payload {
            Payload::Buffered(body) if body.is_empty() => Body::empty(),
            Payload::Buffered(body) => Body::from(body.clone()),
            Payload::Streaming(body) => body.take().unwrap_or_default(),
        }
    }

    fn authorized(&mut self, uri: &Uri, token: &Token) -> Result<Request, ForwardError> {
        let mut headers = self.headers.clone();
        headers.insert(
            header::AUTHORIZATION,
            token
                .bearer()
                .map_err(|_| ForwardError::Auth(AuthError::InvalidToken))?,
        );

        let mut req = http::Request::builder()
            .method(self.method.clone())
            .uri(uri.clone())
            .body(self.body())?;
        *req.headers_mut() = headers;
        Ok(req)
    }

    fn redirected(&self, location: Uri) -> Result<Request, ForwardError> {
        let method = if self.method == Method::HEAD {
            Method::HEAD
        } else {
            Method::GET
        };

        let mut builder = http::Request::builder().method(method).uri(location);
        if let Some(range) = self.headers.get(header::RANGE) {
            builder = builder.header(header::RANGE, range);
        }

        Ok(builder.body(Body::empty())?)
    }
}

/// Resolve the `Location` of a redirect response against the URL which produced it.
fn redirect_location(base: &Uri, headers: &HeaderMap) -> Result<Uri, ForwardError> {
    let location = headers
        .get(header::LOCATION)
        .ok_or(ForwardError::RedirectLocationMissing)?;
    let location = location
        .to_str()
        .map_err(|_| ForwardError::RedirectLocationInvalid("not valid UTF-8".into()))?;

    let resolved = Url::parse(&base.to_string())
        .and_then(|base| base.join(location))
        .map_err(|err| ForwardError::RedirectLocationInvalid(err.to_string()))?;

    resolved
        .as_str()
        .parse()
        .map_err(|err: http::uri::InvalidUri| ForwardError::RedirectLocationInvalid(err.to_string()))
}

/// Sends requests upstream with a scoped bearer token.
#[derive(Debug, Clone)]
pub struct Forwarder {
    tokens: TokenManager,
    client: UpstreamService,
}

impl Forwarder {
    /// Create a forwarder which authenticates through `tokens` and sends over `client`.
    pub fn new(tokens: TokenManager, client: UpstreamService) -> Self {
        Self { tokens, client }
    }

    /// The token manager used by this forwarder.
    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    /// Forward `request` to `uri`, authenticated for `scope`.
    ///
    /// A `401` forces one token refresh and one resend; the second response is
    /// returned whatever its status. A `401` to a streamed body is returned
    /// as-is, since the body is gone. A `302` or `307` is followed once, without
    /// credentials. The final response body is not read.
    #[tracing::instrument(skip(self, uri, request, scope), fields(method = %request.method(), scope = %scope))]
    pub async fn forward(
        &self,
        uri: Uri,
        mut request: UpstreamRequest,
        scope: &Scope,
    ) -> Result<Response, ForwardError> {
        let token = self.tokens.acquire(scope, false).await?;
        let mut response = self.send(request.authorized(&uri, &token)?).await?;

        if response.status() == StatusCode::UNAUTHORIZED && !request.is_replayable() {
            tracing::warn!("Token rejected by registry, streamed body cannot be resent");
        } else if response.status() == StatusCode::UNAUTHORIZED {
            tracing::info!("Token rejected by registry, refreshing");
            let token = self.tokens.acquire(scope, true).await?;
            response = self.send(request.authorized(&uri, &token)?).await?;
        }

        if matches!(
            response.status(),
            StatusCode::TEMPORARY_REDIRECT | StatusCode::FOUND
        ) {
            let location = redirect_location(&uri, response.headers())?;
            tracing::debug!(
                status = %response.status(),
                host = location.host().unwrap_or_default(),
                "Following redirect"
            );
            response = self.send(request.redirected(location)?).await?;
        }

        Ok(response)
    }

    async fn send(&self, req: Request) -> Result<Response, ForwardError> {
        self.client
            .clone()
            .oneshot(req)
            .await
            .map_err(ForwardError::Upstream)
    }
}
