//! Webhook subscription records and delivery statistics.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{GatewayError, Result};

use super::{sql_ts, sql_uuid, ts_to_sql, Store};

/// Aggregated delivery statistics for one subscription.
///
/// `total` counts HTTP attempts, not logical events; a delivery that succeeds
/// on its third try contributes 3 to `total`, 1 to `success`, 2 to `failure`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryStats {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub last_delivery: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub avg_latency_ms: f64,
}

/// A webhook subscription.
///
/// `session_id == None` marks a global subscription: it receives an event only
/// when no session-scoped subscription matched it.
#[derive(Debug, Clone)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub session_id: Option<Uuid>,
    pub url: String,
    /// HMAC-SHA256 signing secret; empty/None disables the signature header.
    pub secret: Option<String>,
    /// Event type names this subscription wants. Must be a non-empty subset of
    /// the known catalogue (validated at the use-case layer).
    pub events: Vec<String>,
    pub enabled: bool,
    pub stats: DeliveryStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookSubscription {
    /// Whether this subscription wants events of the given type.
    pub fn wants(&self, event_type: &str) -> bool {
        self.events.iter().any(|e| e == event_type)
    }
}

const SUB_COLS: &str = "id, session_id, url, secret, events, enabled, total, success, failure, \
                        last_delivery, last_success, last_failure, avg_latency_ms, \
                        created_at, updated_at";

fn row_to_subscription(row: &Row<'_>) -> rusqlite::Result<WebhookSubscription> {
    let id: String = row.get(0)?;
    let session_id: Option<String> = row.get(1)?;
    let events_raw: String = row.get(4)?;
    let events: Vec<String> = serde_json::from_str(&events_raw).unwrap_or_default();
    let opt_ts = |idx: usize, raw: Option<String>| -> rusqlite::Result<Option<DateTime<Utc>>> {
        raw.as_deref().map(|s| sql_ts(idx, s)).transpose()
    };
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;
    Ok(WebhookSubscription {
        id: sql_uuid(0, &id)?,
        session_id: session_id.as_deref().map(|s| sql_uuid(1, s)).transpose()?,
        url: row.get(2)?,
        secret: row.get(3)?,
        events,
        enabled: row.get::<_, i64>(5)? != 0,
        stats: DeliveryStats {
            total: row.get::<_, i64>(6)? as u64,
            success: row.get::<_, i64>(7)? as u64,
            failure: row.get::<_, i64>(8)? as u64,
            last_delivery: opt_ts(9, row.get(9)?)?,
            last_success: opt_ts(10, row.get(10)?)?,
            last_failure: opt_ts(11, row.get(11)?)?,
            avg_latency_ms: row.get(12)?,
        },
        created_at: sql_ts(13, &created_at)?,
        updated_at: sql_ts(14, &updated_at)?,
    })
}

impl Store {
    /// Inserts a new subscription and returns it with fresh stats.
    pub fn create_subscription(
        &self,
        session_id: Option<Uuid>,
        url: &str,
        secret: Option<&str>,
        events: &[String],
        enabled: bool,
    ) -> Result<WebhookSubscription> {
        let now = Utc::now();
        let sub = WebhookSubscription {
            id: Uuid::new_v4(),
            session_id,
            url: url.to_string(),
            secret: secret.map(str::to_string),
            events: events.to_vec(),
            enabled,
            stats: DeliveryStats::default(),
            created_at: now,
            updated_at: now,
        };
        let conn = self.lock();
        conn.execute(
            "INSERT INTO webhook_subscriptions \
             (id, session_id, url, secret, events, enabled, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                sub.id.to_string(),
                sub.session_id.map(|id| id.to_string()),
                sub.url,
                sub.secret,
                serde_json::to_string(&sub.events)?,
                sub.enabled as i64,
                ts_to_sql(now)
            ],
        )?;
        Ok(sub)
    }

    /// Fetches one subscription by id.
    pub fn get_subscription(&self, id: Uuid) -> Result<WebhookSubscription> {
        let conn = self.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM webhook_subscriptions WHERE id = ?1",
                SUB_COLS
            ),
            params![id.to_string()],
            row_to_subscription,
        )
        .optional()?
        .ok_or_else(|| GatewayError::NotFound(format!("webhook subscription {}", id)))
    }

    /// Lists subscriptions, optionally filtered to one session's scope.
    /// `None` lists everything (session-scoped and global).
    pub fn list_subscriptions(
        &self,
        session_id: Option<Uuid>,
    ) -> Result<Vec<WebhookSubscription>> {
        let conn = self.lock();
        let mut out = Vec::new();
        match session_id {
            Some(sid) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM webhook_subscriptions WHERE session_id = ?1 \
                     ORDER BY created_at",
                    SUB_COLS
                ))?;
                let rows = stmt.query_map(params![sid.to_string()], row_to_subscription)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM webhook_subscriptions ORDER BY created_at",
                    SUB_COLS
                ))?;
                let rows = stmt.query_map([], row_to_subscription)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// Enabled subscriptions scoped to `session_id` (pass `None` for the
    /// global pool). Event filtering happens in the registry, which owns the
    /// session→global fallback rule.
    pub fn enabled_subscriptions(
        &self,
        session_id: Option<Uuid>,
    ) -> Result<Vec<WebhookSubscription>> {
        let conn = self.lock();
        let mut out = Vec::new();
        match session_id {
            Some(sid) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM webhook_subscriptions \
                     WHERE enabled = 1 AND session_id = ?1",
                    SUB_COLS
                ))?;
                let rows = stmt.query_map(params![sid.to_string()], row_to_subscription)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM webhook_subscriptions \
                     WHERE enabled = 1 AND session_id IS NULL",
                    SUB_COLS
                ))?;
                let rows = stmt.query_map([], row_to_subscription)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// Updates the mutable fields of a subscription (url, secret, events,
    /// enabled). Stats are only touched through `record_delivery`.
    pub fn update_subscription(
        &self,
        id: Uuid,
        url: &str,
        secret: Option<&str>,
        events: &[String],
        enabled: bool,
    ) -> Result<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE webhook_subscriptions \
             SET url = ?2, secret = ?3, events = ?4, enabled = ?5, updated_at = ?6 \
             WHERE id = ?1",
            params![
                id.to_string(),
                url,
                secret,
                serde_json::to_string(events)?,
                enabled as i64,
                ts_to_sql(Utc::now())
            ],
        )?;
        if changed == 0 {
            return Err(GatewayError::NotFound(format!(
                "webhook subscription {}",
                id
            )));
        }
        Ok(())
    }

    /// Deletes a subscription.
    pub fn delete_subscription(&self, id: Uuid) -> Result<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "DELETE FROM webhook_subscriptions WHERE id = ?1",
            params![id.to_string()],
        )?;
        if changed == 0 {
            return Err(GatewayError::NotFound(format!(
                "webhook subscription {}",
                id
            )));
        }
        Ok(())
    }

    /// Records one HTTP delivery attempt: bumps counters, stamps the relevant
    /// last-* column, and folds the latency into a running mean.
    pub fn record_delivery(&self, id: Uuid, success: bool, latency_ms: f64) -> Result<()> {
        let now = ts_to_sql(Utc::now());
        let conn = self.lock();
        let changed = if success {
            conn.execute(
                "UPDATE webhook_subscriptions SET \
                 total = total + 1, success = success + 1, \
                 last_delivery = ?2, last_success = ?2, \
                 avg_latency_ms = avg_latency_ms + (?3 - avg_latency_ms) / (total + 1), \
                 updated_at = ?2 \
                 WHERE id = ?1",
                params![id.to_string(), now, latency_ms],
            )?
        } else {
            conn.execute(
                "UPDATE webhook_subscriptions SET \
                 total = total + 1, failure = failure + 1, \
                 last_delivery = ?2, last_failure = ?2, \
                 avg_latency_ms = avg_latency_ms + (?3 - avg_latency_ms) / (total + 1), \
                 updated_at = ?2 \
                 WHERE id = ?1",
                params![id.to_string(), now, latency_ms],
            )?
        };
        if changed == 0 {
            return Err(GatewayError::NotFound(format!(
                "webhook subscription {}",
                id
            )));
        }
        Ok(())
    }
}
