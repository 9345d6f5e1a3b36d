//! SQLite-backed [`DocumentStore`].
//!
//! Shares the `Arc<Mutex<Connection>>` with the SQLite vector index when both
//! live in one database file. Every call hops onto the blocking pool.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};

use super::{
    format_timestamp, parse_timestamp, CollectionRecord, DocumentStore, MediaRecord, Visibility,
};

#[derive(Clone)]
pub struct SqliteDocumentStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteDocumentStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.db)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut conn = db
                .lock()
                .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
            f(&mut conn)
        })
        .await
        .context("db task failed")?
    }

    /// Insert or replace a media record (the upload path's durable write).
    pub async fn insert_media(&self, record: MediaRecord) -> Result<()> {
        self.with_conn(move |conn| insert_media_row(conn, &record)).await
    }

    /// Remove a media record. Returns `false` if it did not exist.
    pub async fn delete_media(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let rows = conn.execute("DELETE FROM media WHERE id = ?1", params![id])?;
            Ok(rows > 0)
        })
        .await
    }

    pub async fn create_collection(
        &self,
        id: &str,
        owner_id: &str,
        name: &str,
        is_public: bool,
    ) -> Result<()> {
        let (id, owner_id, name) = (id.to_string(), owner_id.to_string(), name.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO collections (id, owner_id, name, is_public, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, owner_id, name, is_public, format_timestamp(&chrono::Utc::now())],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn add_to_collection(&self, collection_id: &str, media_id: &str) -> Result<()> {
        let (collection_id, media_id) = (collection_id.to_string(), media_id.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO collection_media (collection_id, media_id, added_at) \
                 VALUES (?1, ?2, ?3)",
                params![collection_id, media_id, format_timestamp(&chrono::Utc::now())],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn get(&self, id: &str) -> Result<Option<MediaRecord>> {
        let id = id.to_string();
        self.with_conn(move |conn| read_media(conn, &id)).await
    }

    async fn get_collection(&self, id: &str) -> Result<Option<CollectionRecord>> {
        let id = id.to_string();
        self.with_conn(move |conn| read_collection(conn, &id)).await
    }

    async fn set_indexed_flag(&self, id: &str, indexed: bool) -> Result<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE media SET embedding_indexed = ?1 WHERE id = ?2",
                params![indexed, id],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_media_ids(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM media ORDER BY upload_date, rowid")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
        .await
    }
}

fn insert_media_row(conn: &Connection, record: &MediaRecord) -> Result<()> {
    let tags_json = serde_json::to_string(&record.tags)?;
    conn.execute(
        "INSERT INTO media (id, owner_id, visibility, content_type, filename, file_size, \
                            tags, upload_date, embedding_indexed) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
         ON CONFLICT(id) DO UPDATE SET \
             owner_id = excluded.owner_id, visibility = excluded.visibility, \
             content_type = excluded.content_type, filename = excluded.filename, \
             file_size = excluded.file_size, tags = excluded.tags, \
             upload_date = excluded.upload_date, embedding_indexed = excluded.embedding_indexed",
        params![
            record.id,
            record.owner_id,
            record.visibility.as_str(),
            record.content_type,
            record.filename,
            record.file_size as i64,
            tags_json,
            format_timestamp(&record.upload_date),
            record.embedding_indexed,
        ],
    )?;
    Ok(())
}

fn read_media(conn: &Connection, id: &str) -> Result<Option<MediaRecord>> {
    let row = conn
        .query_row(
            "SELECT id, owner_id, visibility, content_type, filename, file_size, tags, \
                    upload_date, embedding_indexed \
             FROM media WHERE id = ?1",
            params![id],
            raw_media_row,
        )
        .optional()?;

    row.map(RawMediaRow::into_record).transpose()
}

fn read_collection(conn: &Connection, id: &str) -> Result<Option<CollectionRecord>> {
    let head: Option<(String, String, bool)> = conn
        .query_row(
            "SELECT id, owner_id, is_public FROM collections WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let Some((id, owner_id, is_public)) = head else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT media_id FROM collection_media WHERE collection_id = ?1 ORDER BY added_at, rowid",
    )?;
    let media_ids = stmt
        .query_map(params![id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(CollectionRecord {
        id,
        owner_id,
        is_public,
        media_ids,
    }))
}

// ── Row mapping ─────────────────────────────────────────────────────────────

struct RawMediaRow {
    id: String,
    owner_id: Option<String>,
    visibility: String,
    content_type: String,
    filename: String,
    file_size: i64,
    tags: String,
    upload_date: String,
    embedding_indexed: bool,
}

fn raw_media_row(row: &Row<'_>) -> rusqlite::Result<RawMediaRow> {
    Ok(RawMediaRow {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        visibility: row.get(2)?,
        content_type: row.get(3)?,
        filename: row.get(4)?,
        file_size: row.get(5)?,
        tags: row.get(6)?,
        upload_date: row.get(7)?,
        embedding_indexed: row.get(8)?,
    })
}

impl RawMediaRow {
    fn into_record(self) -> Result<MediaRecord> {
        let visibility: Visibility = self.visibility.parse().map_err(anyhow::Error::msg)?;
        let tags: Vec<String> = serde_json::from_str(&self.tags)
            .with_context(|| format!("corrupt tags for media {}", self.id))?;
        let upload_date = parse_timestamp(&self.upload_date)
            .with_context(|| format!("corrupt upload_date for media {}", self.id))?;

        Ok(MediaRecord {
            id: self.id,
            owner_id: self.owner_id,
            visibility,
            content_type: self.content_type,
            filename: self.filename,
            file_size: self.file_size.max(0) as u64,
            tags,
            upload_date,
            embedding_indexed: self.embedding_indexed,
        })
    }
}
