use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::{TokenDriver, TokenStoreError, TokenStoreErrorKind};

#[derive(Debug)]
struct MemoryTokenItem {
    value: String,
    expires: Instant,
}

impl MemoryTokenItem {
    fn new(value: String, ttl: Duration) -> Self {
        Self {
            value,
            expires: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        self.expires <= Instant::now()
    }
}

/// Token store driver that keeps entries in process memory.
///
/// Expired entries are evicted lazily, on the next lookup of their key.
/// Expiry follows the tokio clock.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    entries: DashMap<String, MemoryTokenItem>,
}

impl MemoryTokenStore {
    /// Create a new, empty `MemoryTokenStore`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries held, including expired entries not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait::async_trait]
impl TokenDriver for MemoryTokenStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, TokenStoreError> {
        if let Some(item) = self.entries.get(key) {
            if !item.is_expired() {
                return Ok(Some(item.value.clone()));
            }
        } else {
            return Ok(None);
        }

        tracing::trace!(%key, "evicting expired entry");
        self.entries.remove_if(key, |_, item| item.is_expired());
        Ok(None)
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), TokenStoreError> {
        if ttl.is_zero() {
            return Err(TokenStoreError::new(
                self.name(),
                TokenStoreErrorKind::InvalidRequest,
                "expiration ttl must be positive",
            )
            .key(key));
        }

        self.entries
            .insert(key.to_owned(), MemoryTokenItem::new(value.to_owned(), ttl));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_key_is_absent() {
        let store = MemoryTokenStore::new();
        assert_eq!(store.get("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_replaces_value() {
        let store = MemoryTokenStore::new();
        store.put("k", "one", Duration::from_secs(60)).await.unwrap();
        store.put("k", "two", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("two"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = MemoryTokenStore::new();
        store.put("k", "v", Duration::from_secs(300)).await.unwrap();

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn zero_ttl_is_rejected() {
        let store = MemoryTokenStore::new();
        let err = store.put("k", "v", Duration::ZERO).await.unwrap_err();
        assert_eq!(err.kind(), TokenStoreErrorKind::InvalidRequest);
        assert_eq!(err.cache_key(), Some("k"));
        assert!(store.is_empty());
    }
}
