//! Durable string-keyed storage used by queues, caches and watermarks.
//!
//! The engine never assumes multi-key transactions: every operation touches
//! exactly one key, and callers that update several keys do so sequentially.

use std::future::Future;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Result;

mod libsql_store;
mod memory;

pub use libsql_store::LibSqlStore;
pub use memory::MemoryStore;

/// Asynchronous key-value persistence.
pub trait KeyValueStore: Send + Sync + 'static {
    /// Read the raw value stored under `key`.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> impl Future<Output = Result<()>> + Send;

    /// Remove `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Read and parse a JSON value, treating missing, unreadable or corrupt
/// values as absent.
pub async fn read_json<S, T>(store: &S, key: &str) -> Option<T>
where
    S: KeyValueStore + ?Sized,
    T: DeserializeOwned,
{
    let raw = match store.get(key).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(error) => {
            tracing::warn!("Failed to read '{}' from storage: {}", key, error);
            return None;
        }
    };

    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::warn!("Ignoring unparseable value stored under '{}': {}", key, error);
            None
        }
    }
}

/// Serialize `value` to JSON and store it under `key`.
pub async fn write_json<S, T>(store: &S, key: &str, value: &T) -> Result<()>
where
    S: KeyValueStore + ?Sized,
    T: Serialize + Sync,
{
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw).await
}
