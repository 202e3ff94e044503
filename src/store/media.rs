//! Media cache index. The bytes live on disk; these rows track location,
//! size, and expiry.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::Result;

use super::{sql_ts, sql_uuid, ts_to_sql, Store};

/// One cached media file.
#[derive(Debug, Clone)]
pub struct MediaCacheItem {
    pub session_id: Uuid,
    pub message_id: String,
    pub media_type: String,
    pub mime_type: String,
    pub file_path: String,
    pub file_size: i64,
    pub filename: Option<String>,
    pub cached_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

const MEDIA_COLS: &str = "session_id, message_id, media_type, mime_type, file_path, file_size, \
                          filename, cached_at, last_access, expires_at";

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<MediaCacheItem> {
    let session_id: String = row.get(0)?;
    let cached_at: String = row.get(7)?;
    let last_access: String = row.get(8)?;
    let expires_at: String = row.get(9)?;
    Ok(MediaCacheItem {
        session_id: sql_uuid(0, &session_id)?,
        message_id: row.get(1)?,
        media_type: row.get(2)?,
        mime_type: row.get(3)?,
        file_path: row.get(4)?,
        file_size: row.get(5)?,
        filename: row.get(6)?,
        cached_at: sql_ts(7, &cached_at)?,
        last_access: sql_ts(8, &last_access)?,
        expires_at: sql_ts(9, &expires_at)?,
    })
}

impl Store {
    /// Inserts or replaces a cache entry.
    pub fn put_media_item(&self, item: &MediaCacheItem) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO media_cache \
             (session_id, message_id, media_type, mime_type, file_path, file_size, filename, \
              cached_at, last_access, expires_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                item.session_id.to_string(),
                item.message_id,
                item.media_type,
                item.mime_type,
                item.file_path,
                item.file_size,
                item.filename,
                ts_to_sql(item.cached_at),
                ts_to_sql(item.last_access),
                ts_to_sql(item.expires_at)
            ],
        )?;
        Ok(())
    }

    /// Looks up a cache entry and stamps `last_access` when found.
    pub fn get_media_item(
        &self,
        session_id: Uuid,
        message_id: &str,
    ) -> Result<Option<MediaCacheItem>> {
        let conn = self.lock();
        let item = conn
            .query_row(
                &format!(
                    "SELECT {} FROM media_cache WHERE session_id = ?1 AND message_id = ?2",
                    MEDIA_COLS
                ),
                params![session_id.to_string(), message_id],
                row_to_item,
            )
            .optional()?;
        if item.is_some() {
            conn.execute(
                "UPDATE media_cache SET last_access = ?3 \
                 WHERE session_id = ?1 AND message_id = ?2",
                params![
                    session_id.to_string(),
                    message_id,
                    ts_to_sql(Utc::now())
                ],
            )?;
        }
        Ok(item)
    }

    /// Removes one cache entry, returning its file path if it existed.
    pub fn delete_media_item(
        &self,
        session_id: Uuid,
        message_id: &str,
    ) -> Result<Option<String>> {
        let conn = self.lock();
        let path: Option<String> = conn
            .query_row(
                "SELECT file_path FROM media_cache WHERE session_id = ?1 AND message_id = ?2",
                params![session_id.to_string(), message_id],
                |row| row.get(0),
            )
            .optional()?;
        if path.is_some() {
            conn.execute(
                "DELETE FROM media_cache WHERE session_id = ?1 AND message_id = ?2",
                params![session_id.to_string(), message_id],
            )?;
        }
        Ok(path)
    }

    /// Deletes expired rows and returns their file paths so the sweeper can
    /// unlink the files.
    pub fn delete_expired_media(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT file_path FROM media_cache WHERE expires_at < ?1")?;
        let rows = stmt.query_map(params![ts_to_sql(now)], |row| row.get::<_, String>(0))?;
        let mut paths = Vec::new();
        for row in rows {
            paths.push(row?);
        }
        drop(stmt);
        conn.execute(
            "DELETE FROM media_cache WHERE expires_at < ?1",
            params![ts_to_sql(now)],
        )?;
        Ok(paths)
    }
}
