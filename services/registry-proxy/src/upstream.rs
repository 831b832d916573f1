//! HTTP transport used for every outbound call: token service, registry and
//! redirect targets.

use http::header::{self, HeaderMap, HeaderName};
use hyperdriver::service::SharedService;

/// An outbound request.
pub type Request = http::Request<hyperdriver::Body>;

/// An upstream response, with its body still streaming.
pub type Response = http::Response<hyperdriver::Body>;

/// Shared, cloneable HTTP client service.
pub type UpstreamService =
    hyperdriver::client::SharedClientService<hyperdriver::Body, hyperdriver::Body>;

/// Build the default TCP + TLS client, relying on the transport's default timeouts.
///
/// Redirects are not followed by the client; the forwarding engine follows
/// exactly one hop itself, without credentials.
pub fn client() -> UpstreamService {
    hyperdriver::Client::build_tcp_http()
        .with_default_tls()
        .without_redirects()
        .build_service()
}

/// Wrap an arbitrary client service, e.g. a mock, as an [`UpstreamService`].
pub fn from_service<S>(inner: S) -> UpstreamService
where
    S: tower::Service<Request, Response = Response, Error = hyperdriver::client::Error>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
{
    tower::ServiceBuilder::new()
        .layer(SharedService::layer())
        .service(inner)
}

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

/// Remove headers which describe a single connection and must not be relayed,
/// including any named by the `Connection` header.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| name.trim().parse().ok())
        .collect();

    for name in named {
        headers.remove(name);
    }

    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
    headers.remove(header::UPGRADE);
}

/// A recording in-memory transport for tests.
pub mod mock {
    use std::collections::{HashMap, VecDeque};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Arc;

    use bytes::Bytes;
    use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
    use http_body_util::BodyExt as _;
    use parking_lot::Mutex;

    use super::{Request, Response, UpstreamService};

    type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

    /// A canned response.
    #[derive(Debug, Clone)]
    pub struct MockResponse {
        status: StatusCode,
        reason: Option<&'static str>,
        headers: HeaderMap,
        body: Bytes,
    }

    impl MockResponse {
        /// An empty response with the given status.
        pub fn new(status: StatusCode) -> Self {
            Self {
                status,
                reason: None,
                headers: HeaderMap::new(),
                body: Bytes::new(),
            }
        }

        /// Send a non-canonical reason phrase, as an HTTP/1.1 server may.
        pub fn reason(mut self, reason: &'static str) -> Self {
            self.reason = Some(reason);
            self
        }

        /// Add a response header.
        pub fn header(mut self, name: HeaderName, value: &str) -> Self {
            self.headers.append(
                name,
                HeaderValue::from_str(value).expect("valid mock header value"),
            );
            self
        }

        /// Set the response body.
        pub fn body<B: Into<Bytes>>(mut self, body: B) -> Self {
            self.body = body.into();
            self
        }

        /// Set a JSON response body.
        pub fn json(self, value: serde_json::Value) -> Self {
            self.header(http::header::CONTENT_TYPE, "application/json")
                .body(value.to_string())
        }

        fn build(&self) -> Response {
            let mut builder = http::Response::builder()
                .status(self.status)
                .version(http::Version::HTTP_11);

            for (key, value) in self.headers.iter() {
                builder = builder.header(key, value);
            }

            if let Some(reason) = self.reason {
                builder =
                    builder.extension(hyper::ext::ReasonPhrase::from_static(reason.as_bytes()));
            }

            builder
                .body(hyperdriver::Body::from(self.body.clone()))
                .unwrap()
        }
    }

    #[derive(Debug, Clone)]
    enum MockReply {
        Respond(MockResponse),
        Fail(&'static str),
    }

    /// A request seen by the mock transport.
    #[derive(Debug, Clone)]
    pub struct RecordedRequest {
        /// Request method.
        pub method: Method,

        /// Full request URI.
        pub uri: Uri,

        /// Request headers as sent.
        pub headers: HeaderMap,

        /// Request body as sent.
        pub body: Bytes,
    }

    #[derive(Debug, Default)]
    struct MockState {
        routes: HashMap<String, VecDeque<MockReply>>,
        requests: Vec<RecordedRequest>,
    }

    /// Mock transport which answers by host and path, and records every request.
    ///
    /// Replies added for the same URL are served in order; the last one is
    /// repeated once the queue is drained. Query strings are ignored when matching.
    #[derive(Debug, Default, Clone)]
    pub struct MockUpstream {
        state: Arc<Mutex<MockState>>,
    }

    fn route_key(uri: &Uri) -> String {
        format!(
            "{}{}",
            uri.authority().map(|a| a.as_str()).unwrap_or_default(),
            uri.path()
        )
    }

    impl MockUpstream {
        /// Create a mock with no configured responses.
        pub fn new() -> Self {
            Self::default()
        }

        fn push(&self, url: &str, reply: MockReply) {
            let uri: Uri = url.parse().expect("valid mock url");
            self.state
                .lock()
                .routes
                .entry(route_key(&uri))
                .or_default()
                .push_back(reply);
        }

        /// Queue a response for an absolute URL.
        pub fn add(&self, url: &str, response: MockResponse) {
            self.push(url, MockReply::Respond(response));
        }

        /// Queue a connection failure for an absolute URL.
        pub fn fail(&self, url: &str, message: &'static str) {
            self.push(url, MockReply::Fail(message));
        }

        /// Every request seen so far, in order.
        pub fn requests(&self) -> Vec<RecordedRequest> {
            self.state.lock().requests.clone()
        }

        /// Requests made to an absolute URL, ignoring query strings.
        pub fn requests_to(&self, url: &str) -> Vec<RecordedRequest> {
            let uri: Uri = url.parse().expect("valid mock url");
            let key = route_key(&uri);
            self.state
                .lock()
                .requests
                .iter()
                .filter(|req| route_key(&req.uri) == key)
                .cloned()
                .collect()
        }

        /// Number of requests made to an absolute URL.
        pub fn count(&self, url: &str) -> usize {
            self.requests_to(url).len()
        }

        /// This mock as an [`UpstreamService`].
        pub fn service(&self) -> UpstreamService {
            super::from_service(self.clone())
        }

        fn reply(&self, recorded: RecordedRequest) -> MockReply {
            let key = route_key(&recorded.uri);
            let mut state = self.state.lock();
            state.requests.push(recorded);

            let queue = state
                .routes
                .get_mut(&key)
                .unwrap_or_else(|| panic!("No response configured for {key}"));
            if queue.len() > 1 {
                queue.pop_front().expect("queue is not empty")
            } else {
                queue.front().cloned().expect("queue is not empty")
            }
        }
    }

    impl tower::Service<Request> for MockUpstream {
        type Response = Response;
        type Error = hyperdriver::client::Error;
        type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

        fn poll_ready(
            &mut self,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: Request) -> Self::Future {
            let mock = self.clone();
            Box::pin(async move {
                let (parts, body) = req.into_parts();
                let body = body
                    .collect()
                    .await
                    .map_err(hyperdriver::client::Error::Service)?
                    .to_bytes();

                let reply = mock.reply(RecordedRequest {
                    method: parts.method,
                    uri: parts.uri,
                    headers: parts.headers,
                    body,
                });

                match reply {
                    MockReply::Respond(response) => Ok(response.build()),
                    MockReply::Fail(message) => {
                        Err(hyperdriver::client::Error::Connection(message.into()))
                    }
                }
            })
        }
    }
}
