use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use tracing_error::SpanTrace;

/// Categorizes token store errors independent of the backend which produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStoreErrorKind {
    /// The backing store could not be reached.
    ///
    /// **Retryable:** Yes - the store should recover.
    Unavailable,

    /// The key or value was rejected by the backend.
    ///
    /// **Retryable:** No - the request itself is invalid.
    InvalidRequest,

    /// The stored value could not be encoded or decoded.
    SerializationError,

    /// An unexpected or uncategorized error occurred.
    Other,
}

impl TokenStoreErrorKind {
    /// Returns whether this error kind typically indicates a retryable condition.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TokenStoreErrorKind::Unavailable)
    }
}

impl fmt::Display for TokenStoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenStoreErrorKind::Unavailable => write!(f, "unavailable"),
            TokenStoreErrorKind::InvalidRequest => write!(f, "invalid request"),
            TokenStoreErrorKind::SerializationError => write!(f, "serialization error"),
            TokenStoreErrorKind::Other => write!(f, "other error"),
        }
    }
}

#[derive(Debug)]
struct ErrorTrace {
    backtrace: Backtrace,
    span_trace: SpanTrace,
}

impl ErrorTrace {
    #[track_caller]
    fn capture() -> Self {
        ErrorTrace {
            backtrace: Backtrace::capture(),
            span_trace: SpanTrace::capture(),
        }
    }
}

/// An error raised by a token store backend.
///
/// Carries the engine name, a semantic [`TokenStoreErrorKind`], the key
/// involved (when known) and the underlying error. Token values are never
/// part of the error.
#[derive(Debug)]
pub struct TokenStoreError {
    kind: TokenStoreErrorKind,
    engine: &'static str,
    key: Option<String>,
    source: Box<dyn StdError + Send + Sync + 'static>,
    traces: Box<ErrorTrace>,
}

impl StdError for TokenStoreError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl TokenStoreError {
    /// Create a new token store error.
    pub fn new<E>(engine: &'static str, kind: TokenStoreErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self {
            kind,
            engine,
            key: None,
            source: error.into(),
            traces: Box::new(ErrorTrace::capture()),
        }
    }

    /// Returns a boxed closure that creates a token store error from a downstream error.
    ///
    /// ```rust
    /// use token_store::{TokenStoreError, TokenStoreErrorKind};
    ///
    /// fn decode(raw: Vec<u8>) -> Result<String, TokenStoreError> {
    ///     String::from_utf8(raw)
    ///         .map_err(TokenStoreError::with("redis", TokenStoreErrorKind::SerializationError))
    /// }
    /// ```
    pub fn with<E>(
        engine: &'static str,
        kind: TokenStoreErrorKind,
    ) -> Box<dyn FnOnce(E) -> TokenStoreError + Send + Sync>
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Box::new(move |error: E| TokenStoreError::new(engine, kind, error))
    }

    /// Attach the key which was being read or written.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> TokenStoreErrorKind {
        self.kind
    }

    /// Returns the token store engine name.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// Returns the key involved, if known.
    pub fn cache_key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Returns whether this error is likely retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Returns a reference to the captured backtrace.
    pub fn backtrace(&self) -> &Backtrace {
        &self.traces.backtrace
    }

    /// Returns the tracing span context at the point where this error was created.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.traces.span_trace
    }
}

impl fmt::Display for TokenStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token store error [{}] from {}", self.kind, self.engine)?;

        if let Some(key) = &self.key {
            write!(f, " (key: {})", key)?;
        }

        write!(f, ": {}", self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(TokenStoreError: Send, Sync);

    #[test]
    fn display_includes_engine_and_key() {
        let err = TokenStoreError::new(
            "memory",
            TokenStoreErrorKind::Unavailable,
            "connection refused",
        )
        .key("repository:library/nginx:pull");

        assert_eq!(
            err.to_string(),
            "Token store error [unavailable] from memory (key: repository:library/nginx:pull): connection refused"
        );
        assert!(err.is_retryable());
        assert_eq!(err.cache_key(), Some("repository:library/nginx:pull"));
    }

    #[test]
    fn with_builds_mapper() {
        let result: Result<(), &str> = Err("bad bytes");
        let err = result
            .map_err(TokenStoreError::with(
                "memory",
                TokenStoreErrorKind::SerializationError,
            ))
            .unwrap_err();
        assert_eq!(err.kind(), TokenStoreErrorKind::SerializationError);
        assert!(!err.is_retryable());
        assert!(err.source().is_some());
    }
}
