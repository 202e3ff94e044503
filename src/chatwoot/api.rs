//! Chatwoot REST client.
//!
//! All calls target `<url>/api/v1/accounts/<account_id>` with the
//! `api_access_token` header and a 30 s timeout. Upstream statuses map onto
//! the gateway error taxonomy (401 → Unauthenticated, 429 →
//! ResourceExhausted, 5xx → Unavailable, ...).
//!
//! Chatwoot wraps many responses in `{"payload": ...}` envelopes whose exact
//! nesting varies by endpoint and version; `unwrap_payload` peels them before
//! the typed decode.

use std::time::Duration;

use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{GatewayError, Result};
use crate::store::ChatwootConfig;

/// Per-request deadline.
const REQUEST_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// DTOs
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct Contact {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Conversation {
    pub id: i64,
    #[serde(default)]
    pub inbox_id: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
}

impl Conversation {
    /// A conversation is active unless explicitly resolved.
    pub fn is_open(&self) -> bool {
        self.status.as_deref() != Some("resolved")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatwootMessage {
    pub id: i64,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Inbox {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
}

// ============================================================================
// Client
// ============================================================================

/// HTTP client bound to one Chatwoot account.
pub struct ChatwootApi {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

/// Peels `{"payload": ...}` / `{"payload": {"contact": ...}}` envelopes.
fn unwrap_payload(mut value: Value) -> Value {
    if let Some(inner) = value.get_mut("payload") {
        value = inner.take();
    }
    if let Some(inner) = value.get_mut("contact") {
        value = inner.take();
    }
    value
}

impl ChatwootApi {
    /// Builds a client from a session's bridge config.
    pub fn new(config: &ChatwootConfig) -> Self {
        Self::with_credentials(&config.url, &config.token, &config.account_id)
    }

    pub fn with_credentials(url: &str, token: &str, account_id: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: format!(
                "{}/api/v1/accounts/{}",
                url.trim_end_matches('/'),
                account_id
            ),
            token: token.to_string(),
        }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: Option<&[(&str, &str)]>,
        body: Option<Value>,
    ) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .http
            .request(method, &url)
            .header("api_access_token", &self.token);
        if let Some(query) = query {
            req = req.query(query);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::DeadlineExceeded(format!("chatwoot {}", path))
            } else {
                GatewayError::Unavailable(format!("chatwoot {}: {}", path, e))
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(GatewayError::from_status(
                status.as_u16(),
                &format!("chatwoot {}", path),
            ));
        }
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        Ok(resp.json().await.unwrap_or(Value::Null))
    }

    fn decode<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> Result<T> {
        serde_json::from_value(unwrap_payload(value))
            .map_err(|e| GatewayError::Internal(format!("chatwoot {} decode: {}", what, e)))
    }

    // ------------------------------------------------------------------
    // Inboxes
    // ------------------------------------------------------------------

    pub async fn list_inboxes(&self) -> Result<Vec<Inbox>> {
        let value = self.request(Method::GET, "/inboxes", None, None).await?;
        Self::decode(value, "inboxes")
    }

    pub async fn create_inbox(&self, name: &str) -> Result<Inbox> {
        let body = json!({"name": name, "channel": {"type": "api"}});
        let value = self
            .request(Method::POST, "/inboxes", None, Some(body))
            .await?;
        Self::decode(value, "inbox")
    }

    pub async fn get_inbox(&self, id: i64) -> Result<Inbox> {
        let value = self
            .request(Method::GET, &format!("/inboxes/{}", id), None, None)
            .await?;
        Self::decode(value, "inbox")
    }

    pub async fn update_inbox(&self, id: i64, name: &str) -> Result<Inbox> {
        let value = self
            .request(
                Method::PATCH,
                &format!("/inboxes/{}", id),
                None,
                Some(json!({"name": name})),
            )
            .await?;
        Self::decode(value, "inbox")
    }

    pub async fn delete_inbox(&self, id: i64) -> Result<()> {
        self.request(Method::DELETE, &format!("/inboxes/{}", id), None, None)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Contacts
    // ------------------------------------------------------------------

    /// Searches contacts by phone (or any query string).
    pub async fn search_contacts(&self, query: &str) -> Result<Vec<Contact>> {
        let value = self
            .request(
                Method::GET,
                "/contacts/search",
                Some(&[("q", query)]),
                None,
            )
            .await?;
        Self::decode(value, "contacts")
    }

    pub async fn create_contact(
        &self,
        inbox_id: i64,
        name: &str,
        phone: &str,
    ) -> Result<Contact> {
        let body = json!({
            "inbox_id": inbox_id,
            "name": name,
            "phone_number": phone,
        });
        let value = self
            .request(Method::POST, "/contacts", None, Some(body))
            .await?;
        Self::decode(value, "contact")
    }

    pub async fn get_contact(&self, id: i64) -> Result<Contact> {
        let value = self
            .request(Method::GET, &format!("/contacts/{}", id), None, None)
            .await?;
        Self::decode(value, "contact")
    }

    pub async fn update_contact(&self, id: i64, name: &str) -> Result<Contact> {
        let value = self
            .request(
                Method::PUT,
                &format!("/contacts/{}", id),
                None,
                Some(json!({"name": name})),
            )
            .await?;
        Self::decode(value, "contact")
    }

    /// Merges two contacts; the mergee's artifacts move onto the base.
    pub async fn merge_contacts(&self, base_id: i64, mergee_id: i64) -> Result<Contact> {
        let body = json!({
            "base_contact_id": base_id,
            "mergee_contact_id": mergee_id,
        });
        let value = self
            .request(Method::POST, "/actions/contact_merge", None, Some(body))
            .await?;
        Self::decode(value, "merged contact")
    }

    // ------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------

    pub async fn contact_conversations(&self, contact_id: i64) -> Result<Vec<Conversation>> {
        let value = self
            .request(
                Method::GET,
                &format!("/contacts/{}/conversations", contact_id),
                None,
                None,
            )
            .await?;
        Self::decode(value, "conversations")
    }

    pub async fn create_conversation(
        &self,
        contact_id: i64,
        inbox_id: i64,
        status: Option<&str>,
    ) -> Result<Conversation> {
        let mut body = json!({
            "contact_id": contact_id,
            "inbox_id": inbox_id,
        });
        if let Some(status) = status {
            body["status"] = json!(status);
        }
        let value = self
            .request(Method::POST, "/conversations", None, Some(body))
            .await?;
        Self::decode(value, "conversation")
    }

    pub async fn get_conversation(&self, id: i64) -> Result<Conversation> {
        let value = self
            .request(Method::GET, &format!("/conversations/{}", id), None, None)
            .await?;
        Self::decode(value, "conversation")
    }

    /// Toggles a conversation's status ("open", "resolved", "pending").
    pub async fn toggle_status(&self, conversation_id: i64, status: &str) -> Result<()> {
        self.request(
            Method::POST,
            &format!("/conversations/{}/toggle_status", conversation_id),
            None,
            Some(json!({"status": status})),
        )
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Posts a message; `message_type` is "incoming" (from the WhatsApp
    /// contact) or "outgoing" (mirrored from this device).
    pub async fn create_message(
        &self,
        conversation_id: i64,
        content: &str,
        message_type: &str,
    ) -> Result<ChatwootMessage> {
        let body = json!({
            "content": content,
            "message_type": message_type,
        });
        let value = self
            .request(
                Method::POST,
                &format!("/conversations/{}/messages", conversation_id),
                None,
                Some(body),
            )
            .await?;
        Self::decode(value, "message")
    }

    pub async fn list_messages(
        &self,
        conversation_id: i64,
        before: Option<i64>,
    ) -> Result<Vec<ChatwootMessage>> {
        let path = format!("/conversations/{}/messages", conversation_id);
        let value = match before {
            Some(before) => {
                let before = before.to_string();
                self.request(
                    Method::GET,
                    &path,
                    Some(&[("before", before.as_str())]),
                    None,
                )
                .await?
            }
            None => self.request(Method::GET, &path, None, None).await?,
        };
        Self::decode(value, "messages")
    }
}

// ===========================================================================
// Tests
// ===========================================================================
