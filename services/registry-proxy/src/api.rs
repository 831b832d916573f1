//! Proxy builder and router

use axum::Router;
use axum::body::HttpBody as _;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use token_store::{MemoryTokenStore, TokenStore};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::forward::{ForwardError, Forwarder, UpstreamRequest};
use crate::route::{
    API_VERSION, API_VERSION_HEADER, RegistryPath, ResourceKind, manifest_accept,
};
use crate::token::TokenManager;
use crate::upstream::{self, UpstreamService, strip_hop_by_hop};

/// Methods answered on the bare `/v2/` path.
const VERSION_CHECK_METHODS: &str = "GET, HEAD, OPTIONS";

/// Builder for configuring and creating the proxy service
#[derive(Debug, Default)]
pub struct ProxyBuilder {
    config: Option<ProxyConfig>,
    store: Option<TokenStore>,
    client: Option<UpstreamService>,
}

impl ProxyBuilder {
    /// Create a new proxy builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the proxy configuration. Defaults to a Docker Hub proxy.
    pub fn config(mut self, config: ProxyConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the token store. Defaults to an in-memory store.
    pub fn store(mut self, store: TokenStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the transport used for token, registry and redirect requests.
    pub fn client(mut self, client: UpstreamService) -> Self {
        self.client = Some(client);
        self
    }

    /// Build the proxy without wrapping it in a router
    pub fn build_proxy(self) -> Proxy {
        let config = self.config.unwrap_or_default();
        let store = self
            .store
            .unwrap_or_else(|| MemoryTokenStore::new().into());
        let client = self.client.unwrap_or_else(upstream::client);

        let tokens = TokenManager::new(
            store,
            client.clone(),
            config.upstream.auth,
            config.upstream.service,
        )
        .with_ttl(config.upstream.token_ttl);

        let registry = config.upstream.registry.to_string();

        Proxy {
            forwarder: Forwarder::new(tokens, client),
            registry: registry.trim_end_matches('/').to_owned(),
            max_request_body: config.max_request_body,
        }
    }

    /// Build the proxy service
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn build(self) -> Router {
        let proxy = self.build_proxy();

        Router::new()
            .route(
                "/v2/",
                get(api_version_check)
                    .options(cors_preflight)
                    .fallback(method_not_allowed),
            )
            .route(
                "/v2",
                get(api_version_check)
                    .options(cors_preflight)
                    .fallback(method_not_allowed),
            )
            .fallback(dispatch)
            .with_state(proxy)
    }
}

/// The pull-through proxy: maps inbound registry requests onto the upstream.
#[derive(Debug, Clone)]
pub struct Proxy {
    forwarder: Forwarder,
    registry: String,
    max_request_body: usize,
}

impl Proxy {
    /// Proxy a single `/v2/<repository>/(manifests|blobs)/<reference>` request.
    #[tracing::instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
    pub async fn handle(&self, request: Request) -> ProxyResult<Response> {
        let path = RegistryPath::parse(request.uri().path())
            .ok_or_else(|| ProxyError::ProtocolMismatch(request.uri().path().to_owned()))?;
        let uri = self.upstream_uri(request.uri())?;

        let (parts, body) = request.into_parts();
        let mut upstream = if self.is_replayable(&body) {
            let body = axum::body::to_bytes(body, self.max_request_body)
                .await
                .map_err(ProxyError::RequestBody)?;
            UpstreamRequest::new(parts.method, parts.headers, body)
        } else {
            tracing::debug!("Streaming request body upstream");
            UpstreamRequest::streaming(parts.method, parts.headers, body.into())
        };
        if path.kind() == ResourceKind::Manifests {
            upstream
                .headers_mut()
                .insert(header::ACCEPT, manifest_accept());
        }

        let response = self
            .forwarder
            .forward(uri, upstream, &path.scope())
            .await?;

        tracing::debug!(
            repository = path.repository(),
            kind = %path.kind(),
            status = %response.status(),
            "Upstream responded"
        );

        Ok(relay(response))
    }

    /// Bodies of known length up to the limit are buffered, so the request can
    /// be resent after a token refresh. Anything else is streamed.
    fn is_replayable(&self, body: &axum::body::Body) -> bool {
        body.size_hint()
            .upper()
            .is_some_and(|len| len <= self.max_request_body as u64)
    }

    fn upstream_uri(&self, uri: &Uri) -> Result<Uri, ForwardError> {
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| uri.path());

        format!("{}{}", self.registry, path)
            .parse::<Uri>()
            .map_err(|err| ForwardError::Request(err.into()))
    }
}

/// Turn the final upstream response into the response sent to the client.
///
/// Successful bodies are streamed through untouched.
fn relay(response: upstream::Response) -> Response {
    let (mut parts, body) = response.into_parts();

    if !parts.status.is_success() {
        let reason = reason_phrase(&parts);
        return (parts.status, format!("Registry error: {reason}")).into_response();
    }

    strip_hop_by_hop(&mut parts.headers);
    parts
        .headers
        .insert(API_VERSION_HEADER, HeaderValue::from_static(API_VERSION));

    Response::from_parts(parts, axum::body::Body::new(body))
}

/// The reason phrase sent by the upstream, falling back to the canonical one.
fn reason_phrase(parts: &http::response::Parts) -> String {
    parts
        .extensions
        .get::<hyper::ext::ReasonPhrase>()
        .map(|reason| String::from_utf8_lossy(reason.as_bytes()).into_owned())
        .or_else(|| parts.status.canonical_reason().map(str::to_owned))
        .unwrap_or_else(|| "Unknown Status".to_owned())
}

async fn dispatch(State(proxy): State<Proxy>, request: Request) -> Response {
    if request.method() == Method::OPTIONS {
        return cors_preflight().await.into_response();
    }

    if !request.uri().path().starts_with("/v2/") {
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    }

    proxy.handle(request).await.into_response()
}

/// API version check endpoint
///
/// Answers locally; the upstream is never contacted.
async fn api_version_check() -> impl IntoResponse {
    (StatusCode::OK, [(API_VERSION_HEADER, API_VERSION)])
}

async fn method_not_allowed() -> impl IntoResponse {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, VERSION_CHECK_METHODS)],
        "Method Not Allowed",
    )
}

async fn cors_preflight() -> impl IntoResponse {
    (
        StatusCode::OK,
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (
                header::ACCESS_CONTROL_ALLOW_METHODS,
                "GET, HEAD, POST, PUT, DELETE",
            ),
            (
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                "Authorization, Content-Type, Range",
            ),
            (header::ACCESS_CONTROL_MAX_AGE, "86400"),
        ],
    )
}
