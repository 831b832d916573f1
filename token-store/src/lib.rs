//! # Token stores
//!
//! A small key-value contract for caching short-lived credentials with an
//! expiry, plus an in-process implementation.
//!
//! Backends implement [`TokenDriver`]. Callers hold a [`TokenStore`], a cheap
//! to clone handle which adds tracing around every driver call.
//!
//! ```
//! use std::time::Duration;
//! use token_store::{MemoryTokenStore, TokenStore};
//!
//! # async fn example() -> Result<(), token_store::TokenStoreError> {
//! let store: TokenStore = MemoryTokenStore::new().into();
//! store.put("repository:library/nginx:pull", "abc", Duration::from_secs(300)).await?;
//! assert_eq!(store.get("repository:library/nginx:pull").await?.as_deref(), Some("abc"));
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

mod error;
mod memory;

pub use error::{TokenStoreError, TokenStoreErrorKind};
#[doc(inline)]
pub use memory::MemoryTokenStore;

/// A key-value backend which stores values with a time-to-live.
///
/// An entry must never be returned by [`TokenDriver::get`] once its TTL has
/// elapsed. Concurrent `put` calls for the same key may race; the last write wins.
#[async_trait::async_trait]
pub trait TokenDriver: fmt::Debug {
    /// The name of the driver, used in logs and errors.
    fn name(&self) -> &'static str;

    /// Look up a value by key.
    async fn get(&self, key: &str) -> Result<Option<String>, TokenStoreError>;

    /// Store a value under a key, replacing any previous value, for `ttl`.
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), TokenStoreError>;
}

pub(crate) type ArcDriver = Arc<dyn TokenDriver + Send + Sync>;

/// Shared handle to a token store backend.
#[derive(Debug, Clone)]
pub struct TokenStore {
    driver: ArcDriver,
}

impl<D> From<D> for TokenStore
where
    D: TokenDriver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        TokenStore::new(value)
    }
}

impl TokenStore {
    /// Wrap a driver in a shared handle.
    pub fn new<D: TokenDriver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// The name of the underlying driver.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// Look up a value by key.
    #[tracing::instrument(level = "trace", skip(self), fields(driver=self.driver.name()))]
    pub async fn get(&self, key: &str) -> Result<Option<String>, TokenStoreError> {
        self.driver.get(key).await
    }

    /// Store a value under a key for `ttl`.
    #[tracing::instrument(level = "trace", skip(self, value), fields(driver=self.driver.name()))]
    pub async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), TokenStoreError> {
        self.driver.put(key, value, ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_obj_safe!(TokenDriver);
    static_assertions::assert_impl_all!(TokenStore: Send, Sync, Clone);

    #[tokio::test]
    async fn handle_shares_driver() {
        let store: TokenStore = MemoryTokenStore::new().into();
        let other = store.clone();

        store
            .put("scope", "value", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(other.get("scope").await.unwrap().as_deref(), Some("value"));
        assert_eq!(other.name(), "memory");
    }
}
