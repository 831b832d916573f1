//! Error types for the proxy

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::forward::ForwardError;

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Errors which end a proxied request
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The path is under `/v2/` but is not a manifest or blob request
    #[error("Invalid registry request")]
    ProtocolMismatch(String),

    /// The inbound body could not be read, or exceeded the configured limit
    #[error("Invalid request body: {0}")]
    RequestBody(#[source] axum::Error),

    /// Token acquisition, redirect or transport failure
    #[error(transparent)]
    Forward(#[from] ForwardError),
}

impl ProxyError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::ProtocolMismatch(_) | ProxyError::RequestBody(_) => {
                StatusCode::BAD_REQUEST
            }
            ProxyError::Forward(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            ProxyError::ProtocolMismatch(path) => {
                tracing::debug!(%path, "Rejecting non-registry path");
                (status, self.to_string()).into_response()
            }
            ProxyError::RequestBody(_) => {
                tracing::warn!(error = %self, "Rejecting request body");
                (status, self.to_string()).into_response()
            }
            ProxyError::Forward(_) => {
                tracing::error!(error = %self, "Proxy request failed");
                (status, format!("Error: {self}")).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt as _;

    use super::*;
    use crate::token::AuthError;

    async fn body(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn protocol_mismatch_is_bad_request() {
        let response = ProxyError::ProtocolMismatch("/v2/library/nginx/tags/list".into())
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body(response).await, "Invalid registry request");
    }

    #[tokio::test]
    async fn forward_errors_are_internal() {
        let response =
            ProxyError::from(ForwardError::RedirectLocationMissing).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body(response).await, "Error: Redirect location not found");
    }

    #[test]
    fn auth_errors_map_to_500() {
        let err = ProxyError::from(ForwardError::from(AuthError::InvalidToken));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
