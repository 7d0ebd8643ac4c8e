//! Durable per-domain write queue.
//!
//! Each domain's pending mutations live under one storage key as a JSON array
//! of flat objects: the business payload plus transport metadata
//! (`id_local`, and `sync_rejections` once the server has refused an entry).
//! Metadata never leaves the device.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::keyed_lock::KeyedLocks;
use crate::store::{read_json, write_json, KeyValueStore};
use crate::util::unix_millis_now;
use crate::Result;

/// Client idempotency token field.
pub const ID_LOCAL_FIELD: &str = "id_local";
/// Server rejection counter field.
pub const REJECTIONS_FIELD: &str = "sync_rejections";

const DEAD_LETTER_SUFFIX: &str = "_dead_letter";

/// Generate a client idempotency token: millisecond timestamp plus a random
/// suffix.
pub fn new_id_local() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", unix_millis_now(), &suffix[..8])
}

/// One pending mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub id_local: String,
    /// Business fields only; never contains transport metadata.
    pub payload: Map<String, Value>,
    /// Times the server answered and refused this entry.
    pub rejections: u32,
}

impl QueueEntry {
    /// Wrap a payload, keeping a caller-supplied `id_local` when present.
    pub fn new(mut payload: Map<String, Value>) -> Self {
        let id_local = take_id_local(&mut payload).unwrap_or_else(new_id_local);
        payload.remove(REJECTIONS_FIELD);
        Self {
            id_local,
            payload,
            rejections: 0,
        }
    }

    /// Rebuild an entry from its stored form. Non-object values are not
    /// entries.
    pub fn from_stored(value: Value) -> Option<Self> {
        Self::parse_stored(value).map(|(entry, _)| entry)
    }

    /// Like [`Self::from_stored`], also reporting whether `id_local` had to
    /// be generated because the stored element carried none.
    fn parse_stored(value: Value) -> Option<(Self, bool)> {
        let Value::Object(mut payload) = value else {
            return None;
        };
        let stored_id = take_id_local(&mut payload);
        let assigned = stored_id.is_none();
        let id_local = stored_id.unwrap_or_else(new_id_local);
        let rejections = payload
            .remove(REJECTIONS_FIELD)
            .and_then(|value| value.as_u64())
            .map_or(0, |count| u32::try_from(count).unwrap_or(u32::MAX));
        Some((
            Self {
                id_local,
                payload,
                rejections,
            },
            assigned,
        ))
    }

    /// Stored form: `{...payload, id_local}` plus the rejection counter when
    /// non-zero.
    pub fn to_stored(&self) -> Value {
        let mut stored = self.payload.clone();
        stored.insert(ID_LOCAL_FIELD.to_string(), Value::String(self.id_local.clone()));
        if self.rejections > 0 {
            stored.insert(REJECTIONS_FIELD.to_string(), Value::from(self.rejections));
        }
        Value::Object(stored)
    }

    /// Request body sent to the server.
    pub fn body(&self) -> Value {
        Value::Object(self.payload.clone())
    }
}

fn take_id_local(payload: &mut Map<String, Value>) -> Option<String> {
    match payload.remove(ID_LOCAL_FIELD)? {
        Value::String(id) if !id.trim().is_empty() => Some(id),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Limits on queue growth. Unset limits keep entries forever.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueuePolicy {
    /// Longest a live queue may grow; the oldest overflow goes to the
    /// dead-letter queue.
    pub max_len: Option<usize>,
    /// Server rejections after which an entry goes to the dead-letter queue.
    pub max_rejections: Option<u32>,
}

/// Result of appending one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    pub id_local: String,
    /// Live queue length after the append.
    pub pending: usize,
    /// Oldest entries displaced to the dead-letter queue by `max_len`.
    pub dead_lettered: usize,
}

/// Storage key of a domain's dead-letter queue.
pub fn dead_letter_key(queue_key: &str) -> String {
    format!("{queue_key}{DEAD_LETTER_SUFFIX}")
}

/// Queue operations over a key-value store.
///
/// Read-modify-write cycles on one key are serialized in-process, so an
/// enqueue racing a dispatcher write-back is never lost.
pub struct WriteQueue<S> {
    store: Arc<S>,
    policy: QueuePolicy,
    write_locks: KeyedLocks,
}

impl<S> Clone for WriteQueue<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            policy: self.policy,
            write_locks: self.write_locks.clone(),
        }
    }
}

impl<S: KeyValueStore> WriteQueue<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_policy(store, QueuePolicy::default())
    }

    pub fn with_policy(store: Arc<S>, policy: QueuePolicy) -> Self {
        Self {
            store,
            policy,
            write_locks: KeyedLocks::new(),
        }
    }

    pub const fn policy(&self) -> QueuePolicy {
        self.policy
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    /// Snapshot of the queue in FIFO order. Missing or corrupt data reads
    /// as empty; individual malformed elements are skipped.
    pub async fn entries(&self, queue_key: &str) -> Vec<QueueEntry> {
        self.load(queue_key).await
    }

    /// Number of pending entries; 0 on missing or corrupt data.
    pub async fn count(&self, queue_key: &str) -> usize {
        self.entries(queue_key).await.len()
    }

    /// Append a payload and return the new queue length.
    pub async fn enqueue(&self, queue_key: &str, payload: Map<String, Value>) -> Result<usize> {
        Ok(self.push(queue_key, QueueEntry::new(payload)).await?.pending)
    }

    /// Append a prepared entry, applying `max_len`.
    pub async fn push(&self, queue_key: &str, entry: QueueEntry) -> Result<Enqueued> {
        let id_local = entry.id_local.clone();
        let max_len = self.policy.max_len;

        let (pending, displaced) = self
            .update(queue_key, move |entries| {
                entries.push(entry);
                let overflow =
                    max_len.map_or(0, |max_len| entries.len().saturating_sub(max_len));
                let displaced: Vec<QueueEntry> = entries.drain(..overflow).collect();
                (entries.len(), displaced)
            })
            .await?;

        let dead_lettered = displaced.len();
        if dead_lettered > 0 {
            self.dead_letter(queue_key, displaced).await?;
            tracing::warn!(
                "Queue '{}' exceeded {} entries; moved {} oldest to dead-letter",
                queue_key,
                max_len.unwrap_or_default(),
                dead_lettered
            );
        }

        tracing::info!("Queued entry {} in '{}' ({} pending)", id_local, queue_key, pending);
        Ok(Enqueued {
            id_local,
            pending,
            dead_lettered,
        })
    }

    /// Read, modify and write back one queue while holding its write lock.
    /// An emptied queue removes the key.
    pub async fn update<R: Send>(
        &self,
        queue_key: &str,
        apply: impl FnOnce(&mut Vec<QueueEntry>) -> R + Send,
    ) -> Result<R> {
        let _write = self.write_locks.lock(queue_key).await;
        let (mut entries, _) = read_entries(self.store.as_ref(), queue_key).await;
        let result = apply(&mut entries);
        write_entries(self.store.as_ref(), queue_key, &entries).await?;
        Ok(result)
    }

    /// Overwrite the queue; an empty list removes the key.
    pub async fn replace(&self, queue_key: &str, entries: &[QueueEntry]) -> Result<()> {
        let _write = self.write_locks.lock(queue_key).await;
        write_entries(self.store.as_ref(), queue_key, entries).await
    }

    /// Discard every pending entry of a domain.
    pub async fn clear(&self, queue_key: &str) -> Result<()> {
        let _write = self.write_locks.lock(queue_key).await;
        self.store.remove(queue_key).await?;
        tracing::info!("Cleared offline queue '{}'", queue_key);
        Ok(())
    }

    /// Append entries to the domain's dead-letter queue.
    pub async fn dead_letter(&self, queue_key: &str, entries: Vec<QueueEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.update(&dead_letter_key(queue_key), move |dead| dead.extend(entries))
            .await
    }

    pub async fn dead_letters(&self, queue_key: &str) -> Vec<QueueEntry> {
        self.load(&dead_letter_key(queue_key)).await
    }

    /// Give dead-lettered entries another chance: they are appended to the
    /// live queue with their rejection count reset. Returns how many moved.
    pub async fn requeue_dead_letters(&self, queue_key: &str) -> Result<usize> {
        let dead_key = dead_letter_key(queue_key);
        let _dead_write = self.write_locks.lock(&dead_key).await;
        let (dead, _) = read_entries(self.store.as_ref(), &dead_key).await;
        if dead.is_empty() {
            return Ok(0);
        }
        let moved = dead.len();

        // Live queue first: a crash in between duplicates, never loses.
        self.update(queue_key, move |entries| {
            entries.extend(dead.into_iter().map(|entry| QueueEntry {
                rejections: 0,
                ..entry
            }));
        })
        .await?;
        self.store.remove(&dead_key).await?;

        tracing::info!("Requeued {} dead-lettered entries into '{}'", moved, queue_key);
        Ok(moved)
    }

    /// Read a queue, persisting ids generated for elements stored without
    /// one so every later read sees the same `id_local`.
    async fn load(&self, key: &str) -> Vec<QueueEntry> {
        let _write = self.write_locks.lock(key).await;
        let (entries, assigned) = read_entries(self.store.as_ref(), key).await;
        if assigned {
            match write_entries(self.store.as_ref(), key, &entries).await {
                Ok(()) => tracing::info!("Assigned missing ids in '{}'", key),
                Err(error) => tracing::warn!("Failed to persist ids in '{}': {}", key, error),
            }
        }
        entries
    }

    pub async fn clear_dead_letters(&self, queue_key: &str) -> Result<()> {
        let dead_key = dead_letter_key(queue_key);
        let _write = self.write_locks.lock(&dead_key).await;
        self.store.remove(&dead_key).await
    }
}

/// Entries in FIFO order and whether any `id_local` was generated.
async fn read_entries<S: KeyValueStore + ?Sized>(store: &S, key: &str) -> (Vec<QueueEntry>, bool) {
    let Some(values) = read_json::<S, Vec<Value>>(store, key).await else {
        return (Vec::new(), false);
    };
    let total = values.len();
    let mut assigned = false;
    let entries: Vec<QueueEntry> = values
        .into_iter()
        .filter_map(QueueEntry::parse_stored)
        .map(|(entry, generated)| {
            assigned |= generated;
            entry
        })
        .collect();
    if entries.len() < total {
        tracing::warn!(
            "Skipped {} malformed entries in '{}'",
            total - entries.len(),
            key
        );
    }
    (entries, assigned)
}

async fn write_entries<S: KeyValueStore + ?Sized>(
    store: &S,
    key: &str,
    entries: &[QueueEntry],
) -> Result<()> {
    if entries.is_empty() {
        return store.remove(key).await;
    }
    let stored: Vec<Value> = entries.iter().map(QueueEntry::to_stored).collect();
    write_json(store, key, &stored).await
}
