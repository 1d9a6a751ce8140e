//! libSQL-backed durable asset store.
//!
//! A single `assets` table holds `{id, blob, timestamp}` rows. Schema changes
//! go through the version-tracked `_migrations` table.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;

use crate::assets::durable::{AssetRecord, DurableStore};
use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "assets_table",
    sql: r#"
        CREATE TABLE IF NOT EXISTS assets (
            id TEXT PRIMARY KEY,
            blob BLOB NOT NULL,
            timestamp INTEGER NOT NULL
        );
    "#,
}];

/// Apply every migration newer than the recorded version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;
    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(version = migration.version, name = migration.name, "Applying migration");
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            conn.execute(
                "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
                params![migration.version, migration.name],
            )
            .await
            .map_err(|e| DatabaseError::Migration(format!("Failed to record V{}: {e}", migration.version)))?;
        }
    }
    Ok(())
}

/// Highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(format!("Failed to parse migration version: {e}"))),
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Migration(format!("Failed to read migration version: {e}"))),
    }
}

pub struct LibSqlAssetStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlAssetStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DatabaseError::Pool(format!("Failed to create database directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Asset database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to create in-memory database: {e}")))?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }
}

#[async_trait]
impl DurableStore for LibSqlAssetStore {
    async fn get(&self, id: &str) -> Result<Option<AssetRecord>, DatabaseError> {
        let mut rows = self
            .conn
            .query("SELECT id, blob, timestamp FROM assets WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_asset: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let record = AssetRecord {
                    id: row.get(0).map_err(|e| DatabaseError::Query(format!("get_asset id: {e}")))?,
                    blob: row.get(1).map_err(|e| DatabaseError::Query(format!("get_asset blob: {e}")))?,
                    timestamp: row
                        .get(2)
                        .map_err(|e| DatabaseError::Query(format!("get_asset timestamp: {e}")))?,
                };
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_asset: {e}"))),
        }
    }

    async fn put(&self, record: &AssetRecord) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO assets (id, blob, timestamp) VALUES (?1, ?2, ?3)",
                params![record.id.as_str(), record.blob.clone(), record.timestamp],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("put_asset: {e}")))?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), DatabaseError> {
        self.conn
            .execute("DELETE FROM assets WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_asset: {e}")))?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), DatabaseError> {
        self.conn
            .execute("DELETE FROM assets", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("clear_assets: {e}")))?;
        Ok(())
    }

    async fn count(&self) -> Result<usize, DatabaseError> {
        query_count(&self.conn, "SELECT COUNT(*) FROM assets").await
    }
}

/// Run a single-value count query.
async fn query_count(conn: &Connection, sql: &str) -> Result<usize, DatabaseError> {
    let mut rows = conn
        .query(sql, ())
        .await
        .map_err(|e| DatabaseError::Query(format!("count_assets: {e}")))?;
    match rows.next().await {
        Ok(Some(row)) => row
            .get::<i64>(0)
            .map(|n| n as usize)
            .map_err(|e| DatabaseError::Query(format!("count_assets value: {e}"))),
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Query(format!("count_assets: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> LibSqlAssetStore {
        LibSqlAssetStore::new_memory().await.unwrap()
    }

    fn record(id: &str, timestamp: i64) -> AssetRecord {
        AssetRecord {
            id: id.to_string(),
            blob: vec![0x89, b'P', b'N', b'G', 0, 1],
            timestamp,
        }
    }

    #[tokio::test]
    async fn count_rejects_non_integer_value() {
        let db = test_db().await;
        let err = query_count(&db.conn, "SELECT 'many'").await.unwrap_err();
        assert!(matches!(err, DatabaseError::Query(msg) if msg.starts_with("count_assets value")));
        assert_eq!(db.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn put_get_replace() {
        let db = test_db().await;
        assert!(db.get("/a.png").await.unwrap().is_none());

        db.put(&record("/a.png", 10)).await.unwrap();
        assert_eq!(db.get("/a.png").await.unwrap(), Some(record("/a.png", 10)));

        db.put(&record("/a.png", 20)).await.unwrap();
        assert_eq!(db.get("/a.png").await.unwrap().unwrap().timestamp, 20);
        assert_eq!(db.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_and_clear() {
        let db = test_db().await;
        db.put(&record("/a.png", 1)).await.unwrap();
        db.put(&record("/b.png", 1)).await.unwrap();

        db.delete("/a.png").await.unwrap();
        assert!(db.get("/a.png").await.unwrap().is_none());

        db.clear().await.unwrap();
        assert_eq!(db.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let db = test_db().await;
        run_migrations(&db.conn).await.unwrap();
        assert_eq!(get_current_version(&db.conn).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("assets.db");
        {
            let db = LibSqlAssetStore::new_local(&path).await.unwrap();
            db.put(&record("/logo.svg", 42)).await.unwrap();
        }
        let db = LibSqlAssetStore::new_local(&path).await.unwrap();
        assert_eq!(db.get("/logo.svg").await.unwrap().unwrap().timestamp, 42);
    }
}
