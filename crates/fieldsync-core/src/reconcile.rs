//! Staleness reconciliation for list resources.
//!
//! Before downloading a full list, ask the server for a cheap change summary
//! (`max_id`, `last_update`) and compare it with the watermark stored after
//! the previous download. Matching watermarks reuse the cached list.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::cache::{Origin, ReadThroughCache};
use crate::http::HttpTransport;
use crate::notice::{NoticeSender, SyncNotice};
use crate::store::KeyValueStore;
use crate::util::join_url;
use crate::{Error, Result};

/// Server-side change summary, also stored locally as the watermark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    #[serde(deserialize_with = "string_or_number")]
    pub max_id: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub last_update: String,
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// A list endpoint guarded by a summary endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListResource {
    /// Cache key of the list and prefix of its watermark keys.
    pub name: String,
    pub list_path: String,
    pub summary_path: String,
}

impl ListResource {
    /// Resource whose summary lives at `/<name>/summary`.
    pub fn new(name: impl Into<String>, list_path: impl Into<String>) -> Self {
        let name = name.into();
        let summary_path = format!("/{name}/summary");
        Self {
            name,
            list_path: list_path.into(),
            summary_path,
        }
    }

    #[must_use]
    pub fn with_summary_path(mut self, summary_path: impl Into<String>) -> Self {
        self.summary_path = summary_path.into();
        self
    }

    fn max_id_key(&self) -> String {
        format!("{}_max_id", self.name)
    }

    fn last_update_key(&self) -> String {
        format!("{}_last_update", self.name)
    }
}

/// What to do about a list before showing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefetchDecision {
    /// Download the full list; apply the summary as the new watermark after
    /// a successful download (absent when the summary failed on a forced
    /// refresh).
    Refetch(Option<Watermark>),
    /// Server data has not changed since the last download.
    UseCached(Watermark),
    /// The summary call failed; show whatever is cached.
    SummaryUnavailable,
}

pub struct Reconciler<S, T> {
    store: Arc<S>,
    transport: Arc<T>,
    cache: ReadThroughCache<S, T>,
    notices: NoticeSender,
    base_url: String,
    resources: Vec<ListResource>,
    watermarks: Arc<RwLock<HashMap<String, Watermark>>>,
}

impl<S, T> Clone for Reconciler<S, T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            transport: Arc::clone(&self.transport),
            cache: self.cache.clone(),
            notices: self.notices.clone(),
            base_url: self.base_url.clone(),
            resources: self.resources.clone(),
            watermarks: Arc::clone(&self.watermarks),
        }
    }
}

impl<S: KeyValueStore, T: HttpTransport> Reconciler<S, T> {
    pub fn new(
        store: Arc<S>,
        transport: Arc<T>,
        notices: NoticeSender,
        base_url: impl Into<String>,
        resources: Vec<ListResource>,
    ) -> Self {
        let cache = ReadThroughCache::new(Arc::clone(&store), Arc::clone(&transport), notices.clone());
        Self {
            store,
            transport,
            cache,
            notices,
            base_url: base_url.into(),
            resources,
            watermarks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn resources(&self) -> &[ListResource] {
        &self.resources
    }

    fn resource(&self, name: &str) -> Result<&ListResource> {
        self.resources
            .iter()
            .find(|resource| resource.name == name)
            .ok_or_else(|| Error::NotFound(format!("list resource '{name}'")))
    }

    /// Load every registered resource's stored watermark into memory.
    pub async fn init(&self) -> usize {
        let mut loaded = HashMap::new();
        for resource in &self.resources {
            if let Some(watermark) = self.read_watermark(resource).await {
                loaded.insert(resource.name.clone(), watermark);
            }
        }
        let count = loaded.len();
        *self.watermarks.write().unwrap_or_else(PoisonError::into_inner) = loaded;
        tracing::debug!("Loaded {} list watermarks", count);
        count
    }

    /// Last applied watermark of a resource.
    pub fn watermark(&self, name: &str) -> Option<Watermark> {
        self.watermarks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    async fn read_watermark(&self, resource: &ListResource) -> Option<Watermark> {
        let max_id = self.store.get(&resource.max_id_key()).await.ok().flatten()?;
        let last_update = self
            .store
            .get(&resource.last_update_key())
            .await
            .ok()
            .flatten()?;
        Some(Watermark {
            max_id,
            last_update,
        })
    }

    /// Compare the server summary with the stored watermark.
    pub async fn should_refetch(
        &self,
        name: &str,
        force: bool,
        headers: &[(&str, &str)],
    ) -> Result<RefetchDecision> {
        let resource = self.resource(name)?;
        let url = join_url(&self.base_url, &resource.summary_path);

        let summary = match self.transport.get_json(&url, headers).await {
            Ok(raw) => serde_json::from_value::<Watermark>(raw).map_err(Error::from),
            Err(error) => Err(error),
        };
        let summary = match summary {
            Ok(summary) => summary,
            Err(error) => {
                tracing::info!("Summary for '{}' unavailable: {}", name, error);
                self.notices.publish(SyncNotice::SummaryUnavailable {
                    resource: name.to_string(),
                    error: error.to_string(),
                });
                return Ok(if force {
                    RefetchDecision::Refetch(None)
                } else {
                    RefetchDecision::SummaryUnavailable
                });
            }
        };

        let stored = self.read_watermark(resource).await;
        if force || stored.as_ref() != Some(&summary) {
            tracing::debug!(
                "'{}' changed (stored {:?}, server {:?}, force {})",
                name,
                stored,
                summary,
                force
            );
            Ok(RefetchDecision::Refetch(Some(summary)))
        } else {
            Ok(RefetchDecision::UseCached(summary))
        }
    }

    /// Persist a new watermark: both fields, sequentially.
    pub async fn apply_watermark(&self, name: &str, summary: &Watermark) -> Result<()> {
        let resource = self.resource(name)?;
        self.store.set(&resource.max_id_key(), &summary.max_id).await?;
        self.store
            .set(&resource.last_update_key(), &summary.last_update)
            .await?;
        self.watermarks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), summary.clone());
        Ok(())
    }

    /// Return the list, downloading it only when the server reports changes
    /// or `force` is set.
    pub async fn load_list(&self, name: &str, force: bool, headers: &[(&str, &str)]) -> Result<Value> {
        let resource = self.resource(name)?;
        let list_url = join_url(&self.base_url, &resource.list_path);

        let summary = match self.should_refetch(name, force, headers).await? {
            RefetchDecision::UseCached(summary) => {
                if let Some(cached) = self.cache.cached(name).await {
                    return Ok(cached);
                }
                Some(summary)
            }
            RefetchDecision::SummaryUnavailable => {
                if let Some(cached) = self.cache.cached(name).await {
                    return Ok(cached);
                }
                return self.cache.fetch(name, &list_url, headers).await;
            }
            RefetchDecision::Refetch(summary) => summary,
        };

        let (list, origin) = self.cache.fetch_with_origin(name, &list_url, headers).await?;
        if let (Origin::Live, Some(summary)) = (origin, summary) {
            self.apply_watermark(name, &summary).await?;
        }
        Ok(list)
    }
}
