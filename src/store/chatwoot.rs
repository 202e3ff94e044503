//! Chatwoot bridge persistence: per-session configs (`zpChatwoot`) and the
//! WhatsApp↔Chatwoot message mapping table (`zpMessage`).
//!
//! The mapping table is the bridge's dedup ledger. A row is written in
//! `pending` state *before* any remote Chatwoot call, then promoted to
//! `synced` (with both Chatwoot ids) or demoted to `failed`. The unique index
//! on `(session_id, zp_message_id)` makes re-observed messages a no-op.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{GatewayError, Result};

use super::{sql_ts, sql_uuid, ts_to_sql, Store};

// ============================================================================
// ChatwootConfig
// ============================================================================

/// Bridge configuration for one session (one Chatwoot inbox).
#[derive(Debug, Clone, PartialEq)]
pub struct ChatwootConfig {
    pub session_id: Uuid,
    /// Chatwoot base URL, e.g. "https://chat.example.com".
    pub url: String,
    /// `api_access_token` for the account.
    pub token: String,
    pub account_id: String,
    /// Inbox this session mirrors into; auto-created when `auto_create`.
    pub inbox_id: Option<i64>,
    pub enabled: bool,
    pub auto_create: bool,
    /// Prefix outbound WhatsApp messages with the agent signature.
    pub sign_msg: bool,
    pub sign_delimiter: String,
    /// Reopen resolved conversations instead of creating new ones.
    pub reopen_conv: bool,
    /// Create conversations in `pending` rather than `open`.
    pub conv_pending: bool,
    pub import_contacts: bool,
    pub import_messages: bool,
    pub import_days: i64,
    /// Merge 13/14-digit Brazilian number variants into one contact.
    pub merge_brazil: bool,
    /// JIDs whose messages are never mirrored.
    pub ignore_jids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatwootConfig {
    /// A disabled config with gateway defaults, used as the PUT base.
    pub fn new(session_id: Uuid, url: &str, token: &str, account_id: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            url: url.to_string(),
            token: token.to_string(),
            account_id: account_id.to_string(),
            inbox_id: None,
            enabled: false,
            auto_create: false,
            sign_msg: false,
            sign_delimiter: "\n".to_string(),
            reopen_conv: true,
            conv_pending: false,
            import_contacts: false,
            import_messages: false,
            import_days: 60,
            merge_brazil: false,
            ignore_jids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether messages in `jid` should be skipped entirely.
    pub fn ignores(&self, jid: &str) -> bool {
        self.ignore_jids.iter().any(|j| j == jid)
    }
}

const CW_COLS: &str = "session_id, url, token, account_id, inbox_id, enabled, auto_create, \
                       sign_msg, sign_delimiter, reopen_conv, conv_pending, import_contacts, \
                       import_messages, import_days, merge_brazil, ignore_jids, \
                       created_at, updated_at";

fn row_to_config(row: &Row<'_>) -> rusqlite::Result<ChatwootConfig> {
    let session_id: String = row.get(0)?;
    let ignore_raw: String = row.get(15)?;
    let created_at: String = row.get(16)?;
    let updated_at: String = row.get(17)?;
    Ok(ChatwootConfig {
        session_id: sql_uuid(0, &session_id)?,
        url: row.get(1)?,
        token: row.get(2)?,
        account_id: row.get(3)?,
        inbox_id: row.get(4)?,
        enabled: row.get::<_, i64>(5)? != 0,
        auto_create: row.get::<_, i64>(6)? != 0,
        sign_msg: row.get::<_, i64>(7)? != 0,
        sign_delimiter: row.get(8)?,
        reopen_conv: row.get::<_, i64>(9)? != 0,
        conv_pending: row.get::<_, i64>(10)? != 0,
        import_contacts: row.get::<_, i64>(11)? != 0,
        import_messages: row.get::<_, i64>(12)? != 0,
        import_days: row.get(13)?,
        merge_brazil: row.get::<_, i64>(14)? != 0,
        ignore_jids: serde_json::from_str(&ignore_raw).unwrap_or_default(),
        created_at: sql_ts(16, &created_at)?,
        updated_at: sql_ts(17, &updated_at)?,
    })
}

// ============================================================================
// MessageMapping
// ============================================================================

/// Sync state of one mapping row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "synced" => SyncStatus::Synced,
            "failed" => SyncStatus::Failed,
            _ => SyncStatus::Pending,
        }
    }
}

/// One observed WhatsApp message and its Chatwoot counterpart (when known).
#[derive(Debug, Clone)]
pub struct MessageMapping {
    pub id: Uuid,
    pub session_id: Uuid,
    pub zp_message_id: String,
    pub zp_sender: String,
    pub zp_chat: String,
    /// WhatsApp message timestamp, unix seconds.
    pub zp_timestamp: i64,
    pub zp_from_me: bool,
    pub zp_type: String,
    pub content: Option<String>,
    pub cw_message_id: Option<i64>,
    pub cw_conversation_id: Option<i64>,
    pub sync_status: SyncStatus,
    pub synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const MAP_COLS: &str = "id, session_id, zp_message_id, zp_sender, zp_chat, zp_timestamp, \
                        zp_from_me, zp_type, content, cw_message_id, cw_conversation_id, \
                        sync_status, synced_at, created_at, updated_at";

fn row_to_mapping(row: &Row<'_>) -> rusqlite::Result<MessageMapping> {
    let id: String = row.get(0)?;
    let session_id: String = row.get(1)?;
    let status: String = row.get(11)?;
    let synced_at: Option<String> = row.get(12)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;
    Ok(MessageMapping {
        id: sql_uuid(0, &id)?,
        session_id: sql_uuid(1, &session_id)?,
        zp_message_id: row.get(2)?,
        zp_sender: row.get(3)?,
        zp_chat: row.get(4)?,
        zp_timestamp: row.get(5)?,
        zp_from_me: row.get::<_, i64>(6)? != 0,
        zp_type: row.get(7)?,
        content: row.get(8)?,
        cw_message_id: row.get(9)?,
        cw_conversation_id: row.get(10)?,
        sync_status: SyncStatus::parse(&status),
        synced_at: synced_at.as_deref().map(|s| sql_ts(12, s)).transpose()?,
        created_at: sql_ts(13, &created_at)?,
        updated_at: sql_ts(14, &updated_at)?,
    })
}

impl Store {
    // ------------------------------------------------------------------
    // Config
    // ------------------------------------------------------------------

    /// Inserts or replaces the bridge config for a session.
    pub fn put_chatwoot_config(&self, cfg: &ChatwootConfig) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO zpChatwoot \
             (session_id, url, token, account_id, inbox_id, enabled, auto_create, sign_msg, \
              sign_delimiter, reopen_conv, conv_pending, import_contacts, import_messages, \
              import_days, merge_brazil, ignore_jids, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?17) \
             ON CONFLICT(session_id) DO UPDATE SET \
              url = ?2, token = ?3, account_id = ?4, inbox_id = ?5, enabled = ?6, \
              auto_create = ?7, sign_msg = ?8, sign_delimiter = ?9, reopen_conv = ?10, \
              conv_pending = ?11, import_contacts = ?12, import_messages = ?13, \
              import_days = ?14, merge_brazil = ?15, ignore_jids = ?16, updated_at = ?17",
            params![
                cfg.session_id.to_string(),
                cfg.url,
                cfg.token,
                cfg.account_id,
                cfg.inbox_id,
                cfg.enabled as i64,
                cfg.auto_create as i64,
                cfg.sign_msg as i64,
                cfg.sign_delimiter,
                cfg.reopen_conv as i64,
                cfg.conv_pending as i64,
                cfg.import_contacts as i64,
                cfg.import_messages as i64,
                cfg.import_days,
                cfg.merge_brazil as i64,
                serde_json::to_string(&cfg.ignore_jids)?,
                ts_to_sql(Utc::now())
            ],
        )?;
        Ok(())
    }

    /// Returns the config for a session, if any.
    pub fn get_chatwoot_config(&self, session_id: Uuid) -> Result<Option<ChatwootConfig>> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {} FROM zpChatwoot WHERE session_id = ?1", CW_COLS),
                params![session_id.to_string()],
                row_to_config,
            )
            .optional()?)
    }

    /// Persists the inbox id once resolved/created.
    pub fn set_chatwoot_inbox(&self, session_id: Uuid, inbox_id: i64) -> Result<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE zpChatwoot SET inbox_id = ?2, updated_at = ?3 WHERE session_id = ?1",
            params![session_id.to_string(), inbox_id, ts_to_sql(Utc::now())],
        )?;
        if changed == 0 {
            return Err(GatewayError::NotFound(format!(
                "chatwoot config for session {}",
                session_id
            )));
        }
        Ok(())
    }

    /// Removes the bridge config for a session.
    pub fn delete_chatwoot_config(&self, session_id: Uuid) -> Result<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "DELETE FROM zpChatwoot WHERE session_id = ?1",
            params![session_id.to_string()],
        )?;
        if changed == 0 {
            return Err(GatewayError::NotFound(format!(
                "chatwoot config for session {}",
                session_id
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Message mappings
    // ------------------------------------------------------------------

    /// Looks up the mapping for a WhatsApp message id.
    pub fn get_mapping(
        &self,
        session_id: Uuid,
        zp_message_id: &str,
    ) -> Result<Option<MessageMapping>> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {} FROM zpMessage WHERE session_id = ?1 AND zp_message_id = ?2",
                    MAP_COLS
                ),
                params![session_id.to_string(), zp_message_id],
                row_to_mapping,
            )
            .optional()?)
    }

    /// Writes the pending marker for a message before any remote call.
    ///
    /// If a row already exists for `(session_id, zp_message_id)` it is left
    /// untouched and returned; the caller decides whether it represents an
    /// echo to skip.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_pending_mapping(
        &self,
        session_id: Uuid,
        zp_message_id: &str,
        zp_sender: &str,
        zp_chat: &str,
        zp_timestamp: i64,
        zp_from_me: bool,
        zp_type: &str,
        content: Option<&str>,
    ) -> Result<MessageMapping> {
        {
            let conn = self.lock();
            conn.execute(
                "INSERT OR IGNORE INTO zpMessage \
                 (id, session_id, zp_message_id, zp_sender, zp_chat, zp_timestamp, zp_from_me, \
                  zp_type, content, sync_status, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', ?10, ?10)",
                params![
                    Uuid::new_v4().to_string(),
                    session_id.to_string(),
                    zp_message_id,
                    zp_sender,
                    zp_chat,
                    zp_timestamp,
                    zp_from_me as i64,
                    zp_type,
                    content,
                    ts_to_sql(Utc::now())
                ],
            )?;
        }
        self.get_mapping(session_id, zp_message_id)?
            .ok_or_else(|| GatewayError::Internal("mapping vanished after upsert".to_string()))
    }

    /// Promotes a mapping to `synced` with both Chatwoot ids.
    pub fn mark_mapping_synced(
        &self,
        session_id: Uuid,
        zp_message_id: &str,
        cw_message_id: i64,
        cw_conversation_id: i64,
    ) -> Result<()> {
        let now = ts_to_sql(Utc::now());
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE zpMessage SET cw_message_id = ?3, cw_conversation_id = ?4, \
             sync_status = 'synced', synced_at = ?5, updated_at = ?5 \
             WHERE session_id = ?1 AND zp_message_id = ?2",
            params![
                session_id.to_string(),
                zp_message_id,
                cw_message_id,
                cw_conversation_id,
                now
            ],
        )?;
        if changed == 0 {
            return Err(GatewayError::NotFound(format!(
                "mapping for message {}",
                zp_message_id
            )));
        }
        Ok(())
    }

    /// Demotes a mapping to `failed`. Never retried automatically.
    pub fn mark_mapping_failed(&self, session_id: Uuid, zp_message_id: &str) -> Result<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE zpMessage SET sync_status = 'failed', updated_at = ?3 \
             WHERE session_id = ?1 AND zp_message_id = ?2",
            params![
                session_id.to_string(),
                zp_message_id,
                ts_to_sql(Utc::now())
            ],
        )?;
        if changed == 0 {
            return Err(GatewayError::NotFound(format!(
                "mapping for message {}",
                zp_message_id
            )));
        }
        Ok(())
    }

    /// Pre-seeds a `synced` mapping for a message that originated in Chatwoot
    /// (outbound path), so the inbound echo of the same WhatsApp message id
    /// short-circuits at the dedup check.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_synced_mapping(
        &self,
        session_id: Uuid,
        zp_message_id: &str,
        zp_sender: &str,
        zp_chat: &str,
        zp_timestamp: i64,
        content: Option<&str>,
        cw_message_id: i64,
        cw_conversation_id: i64,
    ) -> Result<()> {
        let now = ts_to_sql(Utc::now());
        let conn = self.lock();
        conn.execute(
            "INSERT INTO zpMessage \
             (id, session_id, zp_message_id, zp_sender, zp_chat, zp_timestamp, zp_from_me, \
              zp_type, content, cw_message_id, cw_conversation_id, sync_status, synced_at, \
              created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, 'text', ?7, ?8, ?9, 'synced', ?10, ?10, ?10) \
             ON CONFLICT(session_id, zp_message_id) DO UPDATE SET \
              cw_message_id = ?8, cw_conversation_id = ?9, sync_status = 'synced', \
              synced_at = ?10, updated_at = ?10",
            params![
                Uuid::new_v4().to_string(),
                session_id.to_string(),
                zp_message_id,
                zp_sender,
                zp_chat,
                zp_timestamp,
                content,
                cw_message_id,
                cw_conversation_id,
                now
            ],
        )?;
        Ok(())
    }

    /// Marks rows stuck in `pending` longer than `max_age` as `failed`.
    /// Returns the number of rows swept. Does not re-send anything.
    pub fn sweep_stale_pending(&self, max_age: chrono::Duration) -> Result<usize> {
        let cutoff = ts_to_sql(Utc::now() - max_age);
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE zpMessage SET sync_status = 'failed', updated_at = ?1 \
             WHERE sync_status = 'pending' AND created_at < ?2",
            params![ts_to_sql(Utc::now()), cutoff],
        )?;
        Ok(changed)
    }
}
