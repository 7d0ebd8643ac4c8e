//! Read-through cache for reference lists.
//!
//! A live fetch always wins and refreshes the cache; the cached copy is only
//! consulted when the fetch fails. There is no TTL: deciding whether a list
//! is stale is the reconciler's job.

use std::sync::Arc;

use serde_json::Value;

use crate::http::HttpTransport;
use crate::notice::{NoticeSender, SyncNotice};
use crate::store::{read_json, KeyValueStore};
use crate::Result;

/// Cache key for a list that depends on an upstream selection.
pub fn keyed_cache_key(prefix: &str, dynamic_key: &str) -> String {
    format!("{prefix}_{dynamic_key}")
}

/// Where a value returned by the cache came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Live,
    Cache,
}

pub struct ReadThroughCache<S, T> {
    store: Arc<S>,
    transport: Arc<T>,
    notices: NoticeSender,
}

impl<S, T> Clone for ReadThroughCache<S, T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            transport: Arc::clone(&self.transport),
            notices: self.notices.clone(),
        }
    }
}

impl<S: KeyValueStore, T: HttpTransport> ReadThroughCache<S, T> {
    pub const fn new(store: Arc<S>, transport: Arc<T>, notices: NoticeSender) -> Self {
        Self {
            store,
            transport,
            notices,
        }
    }

    /// Fetch `url` and cache the response under `cache_key`. On failure,
    /// return the last cached response; with nothing cached, the fetch error.
    pub async fn fetch(&self, cache_key: &str, url: &str, headers: &[(&str, &str)]) -> Result<Value> {
        Ok(self.fetch_with_origin(cache_key, url, headers).await?.0)
    }

    /// Like [`Self::fetch`], also reporting whether the value is live.
    pub async fn fetch_with_origin(
        &self,
        cache_key: &str,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<(Value, Origin)> {
        match self.transport.get_json(url, headers).await {
            Ok(value) => {
                if let Err(error) = self.store.set(cache_key, &value.to_string()).await {
                    tracing::warn!("Failed to cache '{}': {}", cache_key, error);
                }
                Ok((value, Origin::Live))
            }
            Err(error) => match self.cached(cache_key).await {
                Some(cached) => {
                    tracing::warn!(
                        "Fetch of {} failed ({}); serving cached '{}'",
                        url,
                        error,
                        cache_key
                    );
                    self.notices.publish(SyncNotice::ServedFromCache {
                        cache_key: cache_key.to_string(),
                        error: error.to_string(),
                    });
                    Ok((cached, Origin::Cache))
                }
                None => Err(error),
            },
        }
    }

    /// [`Self::fetch`] under the key `prefix_dynamicKey`, e.g. work orders
    /// of one equipment unit.
    pub async fn fetch_keyed(
        &self,
        prefix: &str,
        dynamic_key: &str,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<Value> {
        self.fetch(&keyed_cache_key(prefix, dynamic_key), url, headers)
            .await
    }

    /// Last cached value, if any and parseable.
    pub async fn cached(&self, cache_key: &str) -> Option<Value> {
        read_json(self.store.as_ref(), cache_key).await
    }
}
