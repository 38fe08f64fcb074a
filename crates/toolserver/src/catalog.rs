//! SQLite catalog of stored videos plus an append-only event log.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog query failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("catalog task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRecord {
    pub id: String,
    pub size_bytes: i64,
    pub uploaded_at_ms: i64,
    pub thumbnail: Option<String>,
    pub frame_count: i64,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    db_path: PathBuf,
}

impl Catalog {
    /// Opens the database at `db_path`, creating the schema if needed.
    pub fn open(db_path: &Path) -> Result<Self, CatalogError> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS videos (
  id TEXT PRIMARY KEY,
  size_bytes INTEGER NOT NULL,
  uploaded_at_ms INTEGER NOT NULL,
  thumbnail TEXT,
  frame_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  video_id TEXT,
  ts_ms INTEGER NOT NULL,
  level TEXT NOT NULL,
  message TEXT NOT NULL,
  data_json TEXT
);
CREATE INDEX IF NOT EXISTS idx_events_video_id ON events(video_id);
            "#,
        )?;

        Ok(Self {
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, CatalogError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)?;
            f(&conn)
        })
        .await?
        .map_err(CatalogError::from)
    }

    /// Inserts or replaces the row for a freshly stored artifact.
    pub async fn record_artifact(&self, record: VideoRecord) -> Result<(), CatalogError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO videos (id, size_bytes, uploaded_at_ms, thumbnail, frame_count)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                   size_bytes = excluded.size_bytes,
                   uploaded_at_ms = excluded.uploaded_at_ms,
                   thumbnail = excluded.thumbnail,
                   frame_count = excluded.frame_count",
                params![
                    &record.id,
                    record.size_bytes,
                    record.uploaded_at_ms,
                    &record.thumbnail,
                    record.frame_count
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list(&self) -> Result<Vec<VideoRecord>, CatalogError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, size_bytes, uploaded_at_ms, thumbnail, frame_count
                 FROM videos ORDER BY uploaded_at_ms DESC, id",
            )?;
            let rows = stmt.query_map([], row_to_video)?;
            rows.collect()
        })
        .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<VideoRecord>, CatalogError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, size_bytes, uploaded_at_ms, thumbnail, frame_count FROM videos WHERE id = ?1",
                [id],
                row_to_video,
            )
            .optional()
        })
        .await
    }

    pub async fn rename(&self, old: &str, new: &str) -> Result<(), CatalogError> {
        let (old, new) = (old.to_string(), new.to_string());
        self.with_conn(move |conn| {
            // A row for a file removed by hand must not block the rename.
            conn.execute("DELETE FROM videos WHERE id = ?1", [&new])?;
            conn.execute("UPDATE videos SET id = ?2 WHERE id = ?1", params![&old, &new])?;
            conn.execute("UPDATE events SET video_id = ?2 WHERE video_id = ?1", params![&old, &new])?;
            Ok(())
        })
        .await
    }

    pub async fn remove(&self, id: &str) -> Result<bool, CatalogError> {
        let id = id.to_string();
        self.with_conn(move |conn| Ok(conn.execute("DELETE FROM videos WHERE id = ?1", [id])? > 0))
            .await
    }

    pub async fn set_thumbnail(&self, id: &str, thumbnail: Option<String>) -> Result<(), CatalogError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute("UPDATE videos SET thumbnail = ?2 WHERE id = ?1", params![&id, &thumbnail])?;
            Ok(())
        })
        .await
    }

    pub async fn set_frame_count(&self, id: &str, frame_count: i64) -> Result<(), CatalogError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute("UPDATE videos SET frame_count = ?2 WHERE id = ?1", params![&id, frame_count])?;
            Ok(())
        })
        .await
    }

    pub async fn log_event(
        &self,
        video_id: Option<&str>,
        level: &'static str,
        message: &'static str,
        data: serde_json::Value,
    ) -> Result<(), CatalogError> {
        let video_id = video_id.map(str::to_string);
        let ts_ms = crate::now_ms();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO events (video_id, ts_ms, level, message, data_json) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![&video_id, ts_ms, level, message, data.to_string()],
            )?;
            Ok(())
        })
        .await
    }

    /// Logs an event, downgrading any failure to a warning.
    pub async fn note(&self, video_id: Option<&str>, message: &'static str, data: serde_json::Value) {
        if let Err(err) = self.log_event(video_id, "info", message, data).await {
            tracing::warn!(error = %err, message, "failed to record event");
        }
    }

    pub async fn events_for(&self, video_id: &str) -> Result<Vec<(String, String)>, CatalogError> {
        let video_id = video_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT level, message FROM events WHERE video_id = ?1 ORDER BY id")?;
            let rows = stmt.query_map([video_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })
        .await
    }
}

fn row_to_video(row: &rusqlite::Row<'_>) -> rusqlite::Result<VideoRecord> {
    Ok(VideoRecord {
        id: row.get(0)?,
        size_bytes: row.get(1)?,
        uploaded_at_ms: row.get(2)?,
        thumbnail: row.get(3)?,
        frame_count: row.get(4)?,
    })
}
