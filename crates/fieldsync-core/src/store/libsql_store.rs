//! Durable key-value store on a device-local libSQL file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::KeyValueStore;
use crate::db::{Database, LibSqlKvRepository};
use crate::Result;

/// Thread-safe handle to the on-device database.
#[derive(Clone)]
pub struct LibSqlStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl LibSqlStore {
    /// Open (or create) the store at the given filesystem path.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                crate::Error::Storage(format!(
                    "failed to create {}: {error}",
                    parent.display()
                ))
            })?;
        }

        let db = Database::open(&db_path).await?;
        tracing::info!("Opened offline store at {}", db_path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    /// Path of the backing file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }
}

impl KeyValueStore for LibSqlStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let db = self.db.lock().await;
        let repo = LibSqlKvRepository::new(db.connection());
        repo.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlKvRepository::new(db.connection());
        repo.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlKvRepository::new(db.connection());
        repo.remove(key).await
    }
}
