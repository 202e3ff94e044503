//! Session records: the durable side of each WhatsApp device.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{GatewayError, Result};

use super::{sql_ts, sql_uuid, ts_to_sql, Store};

/// Durable record of a session.
///
/// The connection *state machine* lives in the runtime; this row only carries
/// identity, pairing result, and the last observed connection flag.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: Uuid,
    /// Unique human-chosen name.
    pub name: String,
    /// JID assigned by WhatsApp after pairing, e.g. "5511999999999:12@s.whatsapp.net".
    pub device_jid: Option<String>,
    /// Optional proxy URL the bridge should route this session through.
    pub proxy_url: Option<String>,
    pub is_connected: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const SESSION_COLS: &str =
    "id, name, device_jid, proxy_url, is_connected, last_seen, created_at, updated_at";

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let id: String = row.get(0)?;
    let last_seen: Option<String> = row.get(5)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    Ok(SessionRecord {
        id: sql_uuid(0, &id)?,
        name: row.get(1)?,
        device_jid: row.get(2)?,
        proxy_url: row.get(3)?,
        is_connected: row.get::<_, i64>(4)? != 0,
        last_seen: last_seen.as_deref().map(|s| sql_ts(5, s)).transpose()?,
        created_at: sql_ts(6, &created_at)?,
        updated_at: sql_ts(7, &updated_at)?,
    })
}

impl Store {
    /// Creates a session row in the `disconnected` state.
    ///
    /// Fails with `AlreadyExists` when the name is taken.
    pub fn create_session(&self, name: &str, proxy_url: Option<&str>) -> Result<SessionRecord> {
        let now = Utc::now();
        let record = SessionRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            device_jid: None,
            proxy_url: proxy_url.map(str::to_string),
            is_connected: false,
            last_seen: None,
            created_at: now,
            updated_at: now,
        };

        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO sessions \
             (id, name, device_jid, proxy_url, is_connected, created_at, updated_at) \
             VALUES (?1, ?2, NULL, ?3, 0, ?4, ?4)",
            params![
                record.id.to_string(),
                record.name,
                record.proxy_url,
                ts_to_sql(now)
            ],
        )?;
        if inserted == 0 {
            return Err(GatewayError::AlreadyExists(format!(
                "session name '{}'",
                name
            )));
        }
        Ok(record)
    }

    /// Fetches a session by id, or `NotFound`.
    pub fn get_session(&self, id: Uuid) -> Result<SessionRecord> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLS),
            params![id.to_string()],
            row_to_session,
        )
        .optional()?
        .ok_or_else(|| GatewayError::NotFound(format!("session {}", id)))
    }

    /// Fetches a session by its unique name.
    pub fn get_session_by_name(&self, name: &str) -> Result<SessionRecord> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {} FROM sessions WHERE name = ?1", SESSION_COLS),
            params![name],
            row_to_session,
        )
        .optional()?
        .ok_or_else(|| GatewayError::NotFound(format!("session '{}'", name)))
    }

    /// Lists all sessions, oldest first.
    pub fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sessions ORDER BY created_at",
            SESSION_COLS
        ))?;
        let rows = stmt.query_map([], row_to_session)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Updates the connection flag; a disconnect also stamps `last_seen`.
    pub fn set_session_connected(&self, id: Uuid, connected: bool) -> Result<()> {
        let now = ts_to_sql(Utc::now());
        let conn = self.lock();
        let changed = if connected {
            conn.execute(
                "UPDATE sessions SET is_connected = 1, updated_at = ?2 WHERE id = ?1",
                params![id.to_string(), now],
            )?
        } else {
            conn.execute(
                "UPDATE sessions SET is_connected = 0, last_seen = ?2, updated_at = ?2 \
                 WHERE id = ?1",
                params![id.to_string(), now],
            )?
        };
        if changed == 0 {
            return Err(GatewayError::NotFound(format!("session {}", id)));
        }
        Ok(())
    }

    /// Persists (or clears) the device JID after pairing/logout.
    pub fn set_session_device_jid(&self, id: Uuid, device_jid: Option<&str>) -> Result<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE sessions SET device_jid = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), device_jid, ts_to_sql(Utc::now())],
        )?;
        if changed == 0 {
            return Err(GatewayError::NotFound(format!("session {}", id)));
        }
        Ok(())
    }

    /// Sets or clears the session proxy.
    pub fn set_session_proxy(&self, id: Uuid, proxy_url: Option<&str>) -> Result<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE sessions SET proxy_url = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), proxy_url, ts_to_sql(Utc::now())],
        )?;
        if changed == 0 {
            return Err(GatewayError::NotFound(format!("session {}", id)));
        }
        Ok(())
    }

    /// Removes the session row. The caller is responsible for stopping the
    /// runtime first.
    pub fn delete_session(&self, id: Uuid) -> Result<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "DELETE FROM sessions WHERE id = ?1",
            params![id.to_string()],
        )?;
        if changed == 0 {
            return Err(GatewayError::NotFound(format!("session {}", id)));
        }
        Ok(())
    }
}
