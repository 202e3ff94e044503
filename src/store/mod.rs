//! Persistent storage for the gateway.
//!
//! All durable state lives in a single SQLite database:
//! - `sessions`: one row per WhatsApp session (device)
//! - `webhook_subscriptions`: per-session and global webhook configs + stats
//! - `zpChatwoot`: one Chatwoot bridge config per session
//! - `zpMessage`: the WhatsApp↔Chatwoot message mapping table
//! - `media_cache`: on-disk media cache index
//!
//! The `Store` wraps a single `rusqlite::Connection` behind a mutex. Every
//! statement is short-lived and the lock is never held across an await point,
//! so calling these methods from async tasks is safe.

mod chatwoot;
mod media;
mod sessions;
mod webhooks;

pub use chatwoot::{ChatwootConfig, MessageMapping, SyncStatus};
pub use media::MediaCacheItem;
pub use sessions::SessionRecord;
pub use webhooks::{DeliveryStats, WebhookSubscription};

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;

/// Shared handle to the gateway database.
///
/// Cheap to clone; all clones share the same connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Opens (or creates) the database at `path` and applies migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        info!("Store opened at {}", path.display());
        Ok(store)
    }

    /// Opens an in-memory database. Used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id            TEXT PRIMARY KEY,
                name          TEXT NOT NULL UNIQUE,
                device_jid    TEXT,
                proxy_url     TEXT,
                is_connected  INTEGER NOT NULL DEFAULT 0,
                last_seen     TEXT,
                created_at    TEXT NOT NULL,
                updated_at    TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS webhook_subscriptions (
                id              TEXT PRIMARY KEY,
                session_id      TEXT,
                url             TEXT NOT NULL,
                secret          TEXT,
                events          TEXT NOT NULL,
                enabled         INTEGER NOT NULL DEFAULT 1,
                total           INTEGER NOT NULL DEFAULT 0,
                success         INTEGER NOT NULL DEFAULT 0,
                failure         INTEGER NOT NULL DEFAULT 0,
                last_delivery   TEXT,
                last_success    TEXT,
                last_failure    TEXT,
                avg_latency_ms  REAL NOT NULL DEFAULT 0,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_webhook_session
                ON webhook_subscriptions(session_id);

            CREATE TABLE IF NOT EXISTS zpChatwoot (
                session_id       TEXT PRIMARY KEY,
                url              TEXT NOT NULL,
                token            TEXT NOT NULL,
                account_id       TEXT NOT NULL,
                inbox_id         INTEGER,
                enabled          INTEGER NOT NULL DEFAULT 0,
                auto_create      INTEGER NOT NULL DEFAULT 0,
                sign_msg         INTEGER NOT NULL DEFAULT 0,
                sign_delimiter   TEXT NOT NULL DEFAULT '\n',
                reopen_conv      INTEGER NOT NULL DEFAULT 1,
                conv_pending     INTEGER NOT NULL DEFAULT 0,
                import_contacts  INTEGER NOT NULL DEFAULT 0,
                import_messages  INTEGER NOT NULL DEFAULT 0,
                import_days      INTEGER NOT NULL DEFAULT 60,
                merge_brazil     INTEGER NOT NULL DEFAULT 0,
                ignore_jids      TEXT NOT NULL DEFAULT '[]',
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS zpMessage (
                id                  TEXT PRIMARY KEY,
                session_id          TEXT NOT NULL,
                zp_message_id       TEXT NOT NULL,
                zp_sender           TEXT NOT NULL,
                zp_chat             TEXT NOT NULL,
                zp_timestamp        INTEGER NOT NULL,
                zp_from_me          INTEGER NOT NULL,
                zp_type             TEXT NOT NULL,
                content             TEXT,
                cw_message_id       INTEGER,
                cw_conversation_id  INTEGER,
                sync_status         TEXT NOT NULL DEFAULT 'pending',
                synced_at           TEXT,
                created_at          TEXT NOT NULL,
                updated_at          TEXT NOT NULL,
                UNIQUE(session_id, zp_message_id)
            );

            CREATE TABLE IF NOT EXISTS media_cache (
                session_id   TEXT NOT NULL,
                message_id   TEXT NOT NULL,
                media_type   TEXT NOT NULL,
                mime_type    TEXT NOT NULL,
                file_path    TEXT NOT NULL,
                file_size    INTEGER NOT NULL,
                filename     TEXT,
                cached_at    TEXT NOT NULL,
                last_access  TEXT NOT NULL,
                expires_at   TEXT NOT NULL,
                PRIMARY KEY (session_id, message_id)
            );
            "#,
        )?;
        Ok(())
    }
}

/// Serializes a timestamp for storage.
pub(crate) fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

/// Parses a stored timestamp inside a row mapper, turning a corrupt value
/// into a conversion error instead of a panic.
pub(crate) fn sql_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Parses a stored UUID inside a row mapper.
pub(crate) fn sql_uuid(idx: usize, raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}
