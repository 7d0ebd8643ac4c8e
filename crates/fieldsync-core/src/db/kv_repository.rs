//! Key-value repository on top of the `kv_store` table

use crate::error::Result;
use crate::util::unix_millis_now;
use libsql::Connection;

/// libSQL access to the `kv_store` table
pub struct LibSqlKvRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlKvRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query("SELECT value FROM kv_store WHERE key = ?", [key])
            .await?;

        if let Some(row) = rows.next().await? {
            let value: String = row.get(0)?;
            Ok(Some(value))
        } else {
            Ok(None)
        }
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?, ?, ?)",
                libsql::params![key, value, unix_millis_now()],
            )
            .await?;
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM kv_store WHERE key = ?", [key])
            .await?;
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn get_missing_key_is_none() {
        let db = setup().await;
        let repo = LibSqlKvRepository::new(db.connection());
        assert_eq!(repo.get("absent").await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn set_overwrites_and_remove_deletes() {
        let db = setup().await;
        let repo = LibSqlKvRepository::new(db.connection());

        repo.set("token", "a").await.unwrap();
        repo.set("token", "b").await.unwrap();
        assert_eq!(repo.get("token").await.unwrap().as_deref(), Some("b"));

        repo.remove("token").await.unwrap();
        assert_eq!(repo.get("token").await.unwrap(), None);
    }
}
