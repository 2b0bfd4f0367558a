//! Keyword search fronted by the cache.

use std::time::Duration;

use crate::{
    cache::{CacheStore, normalize_query, search_cache_key},
    error::MirrorResult,
    remote::{RemoteMetadataClient, SearchResult},
    security::Credentials,
};

pub struct CachedSearch<S> {
    cache: S,
    ttl: Duration,
}

impl<S: CacheStore> CachedSearch<S> {
    pub fn new(cache: S, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    pub fn cache(&self) -> &S {
        &self.cache
    }

    /// Returns cached hits when a live entry exists, otherwise asks the
    /// remote once and stores the answer for `ttl`.
    ///
    /// A blank query returns nothing and touches neither side. A cached
    /// payload that no longer deserializes is treated as a miss.
    pub async fn search_cached<C>(
        &self,
        client: &C,
        creds: &Credentials,
        query: &str,
        max_results: u32,
    ) -> MirrorResult<Vec<SearchResult>>
    where
        C: RemoteMetadataClient + ?Sized,
    {
        let normalized = normalize_query(query);
        if normalized.is_empty() {
            return Ok(Vec::new());
        }

        let key = search_cache_key(&normalized, max_results);
        if let Some(payload) = self.cache.get(&key).await? {
            match serde_json::from_str::<Vec<SearchResult>>(&payload) {
                Ok(results) => {
                    tracing::debug!(query = %normalized, hits = results.len(), "search cache hit");
                    return Ok(results);
                }
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "discarding unreadable cache entry");
                }
            }
        }

        tracing::debug!(query = %normalized, "search cache miss");
        let results = client.search(creds, query.trim(), max_results).await?;
        let payload = serde_json::to_string(&results)?;
        self.cache.set(&key, payload, self.ttl).await?;
        Ok(results)
    }
}
