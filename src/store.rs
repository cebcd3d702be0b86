// src/store.rs

use crate::models::{TaskId, TaskSnapshot};
use rusqlite::params;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

/// Keeps task snapshots in SQLite so the list survives a restart.
/// Each row holds one snapshot serialized as JSON.
pub struct TaskStore {
    conn: Connection,
}

impl TaskStore {
    /// Opens (or creates) the database file.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path).await?;
        Self::setup(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        Self::setup(conn).await
    }

    async fn setup(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS tasks (
                    id          INTEGER PRIMARY KEY,
                    snapshot    TEXT NOT NULL
                )",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    /// Inserts or replaces the snapshot of one task.
    pub async fn save(&self, snapshot: &TaskSnapshot) -> Result<(), StoreError> {
        let data = serde_json::to_string(snapshot)?;
        let id = snapshot.id.0 as i64;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO tasks (id, snapshot) VALUES (?1, ?2)",
                    params![id, data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// All saved snapshots in creation order.
    pub async fn load_all(&self) -> Result<Vec<TaskSnapshot>, StoreError> {
        let rows: Vec<String> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT snapshot FROM tasks ORDER BY id")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await?;

        rows.iter()
            .map(|raw| serde_json::from_str(raw).map_err(StoreError::from))
            .collect()
    }

    pub async fn delete(&self, id: TaskId) -> Result<(), StoreError> {
        let id = id.0 as i64;
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute("DELETE FROM tasks", [])?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
