//! Tests which run the real HTTP client against a local server

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Method, Request, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use bytes::Bytes;
use http_body_util::BodyExt as _;
use registry_proxy::{
    Forwarder, ProxyBuilder, ProxyConfig, Scope, TokenManager, UpstreamRequest, upstream,
};
use serde_json::json;
use token_store::MemoryTokenStore;
use tower::ServiceExt;

const BLOB_PATH: &str = "/v2/library/nginx/blobs/sha256:abc";

#[derive(Debug, Clone, Default)]
struct Hits {
    one: Arc<AtomicUsize>,
    one_authorized: Arc<AtomicUsize>,
    two: Arc<AtomicUsize>,
}

async fn issue_token() -> impl IntoResponse {
    axum::Json(json!({ "token": "abc" }))
}

async fn blob() -> impl IntoResponse {
    (StatusCode::TEMPORARY_REDIRECT, [(header::LOCATION, "/cdn/one")])
}

async fn cdn_one(State(hits): State<Hits>, headers: HeaderMap) -> impl IntoResponse {
    hits.one.fetch_add(1, Ordering::SeqCst);
    if headers.contains_key(header::AUTHORIZATION) {
        hits.one_authorized.fetch_add(1, Ordering::SeqCst);
    }
    (StatusCode::TEMPORARY_REDIRECT, [(header::LOCATION, "/cdn/two")])
}

async fn cdn_two(State(hits): State<Hits>) -> impl IntoResponse {
    hits.two.fetch_add(1, Ordering::SeqCst);
    "blob"
}

/// Start a registry whose blob redirects twice, returning its base URL.
async fn redirecting_registry(hits: Hits) -> String {
    let app = Router::new()
        .route("/token", get(issue_token))
        .route(BLOB_PATH, get(blob))
        .route("/cdn/one", get(cdn_one))
        .route("/cdn/two", get(cdn_two))
        .with_state(hits);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{addr}")
}

#[tokio::test]
async fn test_client_leaves_redirects_to_forwarder() {
    let hits = Hits::default();
    let base = redirecting_registry(hits.clone()).await;

    let client = upstream::client();
    let tokens = TokenManager::new(
        MemoryTokenStore::new().into(),
        client.clone(),
        format!("{base}/token").parse().unwrap(),
        "registry.test",
    );
    let forwarder = Forwarder::new(tokens, client);

    let response = forwarder
        .forward(
            format!("{base}{BLOB_PATH}").parse().unwrap(),
            UpstreamRequest::new(Method::GET, HeaderMap::new(), Bytes::new()),
            &Scope::pull("library/nginx"),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(response.headers()[header::LOCATION], "/cdn/two");
    assert_eq!(hits.one.load(Ordering::SeqCst), 1);
    assert_eq!(hits.one_authorized.load(Ordering::SeqCst), 0);
    assert_eq!(hits.two.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_default_proxy_follows_one_hop() {
    let hits = Hits::default();
    let base = redirecting_registry(hits.clone()).await;

    let mut config = ProxyConfig::default();
    config.upstream.registry = base.parse().unwrap();
    config.upstream.auth = format!("{base}/token").parse().unwrap();

    let app = ProxyBuilder::new().config(config).build();
    let response = app
        .oneshot(Request::builder().uri(BLOB_PATH).body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, "Registry error: Temporary Redirect");
    assert_eq!(hits.one.load(Ordering::SeqCst), 1);
    assert_eq!(hits.two.load(Ordering::SeqCst), 0);
}
