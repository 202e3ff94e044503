//! Outbound mirror: Chatwoot → WhatsApp.
//!
//! Triggered by Chatwoot's `message_created` webhook. A short settle delay
//! absorbs Chatwoot's event ordering races; then the drop rules run (private
//! notes, bots, non-outgoing messages), markdown is reverse-converted, and
//! the text goes out through the message use-cases.
//!
//! After a successful send the mapping table is pre-seeded with the WhatsApp
//! message id in `synced` state, so the echo the device produces for its own
//! message is recognized by the inbound dedup check and never posted back to
//! Chatwoot.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::client::SendReceipt;
use crate::error::{GatewayError, Result};
use crate::store::Store;

use super::markdown;

/// Settle delay before processing any Chatwoot webhook.
const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Sender identifier Chatwoot assigns to its own automation bot.
const BOT_IDENTIFIER: &str = "123456";

// ============================================================================
// Webhook payload
// ============================================================================

/// The subset of Chatwoot's webhook payload the bridge reads.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChatwootWebhook {
    pub event: String,
    pub message: Option<WebhookMessage>,
    pub conversation: Option<WebhookConversation>,
    pub contact: Option<WebhookContact>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebhookMessage {
    pub id: i64,
    pub content: Option<String>,
    pub message_type: Option<String>,
    pub private: bool,
    pub content_attributes: Map<String, Value>,
    pub sender: Option<WebhookSender>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebhookSender {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub sender_type: Option<String>,
    pub identifier: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebhookConversation {
    pub id: i64,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebhookContact {
    pub id: i64,
    pub name: Option<String>,
    pub phone_number: Option<String>,
}

/// What happened to one webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundOutcome {
    /// Forwarded to WhatsApp.
    Sent { message_id: String },
    /// Intentionally not forwarded; the HTTP layer still answers 200.
    Dropped(&'static str),
}

/// Sends text back into a session. Implemented by the message use-cases; the
/// bridge stays decoupled from their full surface.
#[async_trait]
pub trait TextSender: Send + Sync {
    async fn send_text(&self, session_id: Uuid, to_jid: &str, body: &str) -> Result<SendReceipt>;
}

// ============================================================================
// Handler
// ============================================================================

/// Processes inbound Chatwoot webhooks for all sessions.
pub struct OutboundHandler {
    store: Store,
    sender: Arc<dyn TextSender>,
}

impl OutboundHandler {
    pub fn new(store: Store, sender: Arc<dyn TextSender>) -> Self {
        Self { store, sender }
    }

    /// Handles one webhook delivery for `session_id`.
    pub async fn process(
        &self,
        session_id: Uuid,
        webhook: ChatwootWebhook,
    ) -> Result<OutboundOutcome> {
        tokio::time::sleep(SETTLE_DELAY).await;

        let config = self
            .store
            .get_chatwoot_config(session_id)?
            .ok_or_else(|| {
                GatewayError::NotFound(format!("chatwoot config for session {}", session_id))
            })?;
        if !config.enabled {
            return Ok(OutboundOutcome::Dropped("bridge disabled"));
        }

        match webhook.event.as_str() {
            "message_created" => {}
            "message_updated" => {
                let deleted = webhook
                    .message
                    .as_ref()
                    .map(|m| m.content_attributes.contains_key("deleted"))
                    .unwrap_or(false);
                if !deleted {
                    return Ok(OutboundOutcome::Dropped("update without deletion"));
                }
                // TODO: propagate the deletion as a WhatsApp revoke once the
                // mapping row carries enough addressing for it.
                debug!(session_id = %session_id, "chatwoot deletion observed, not propagated");
                return Ok(OutboundOutcome::Dropped("deletion not propagated"));
            }
            "conversation_status_changed" => {
                return Ok(OutboundOutcome::Dropped("status change ignored"));
            }
            _ => return Ok(OutboundOutcome::Dropped("unhandled event")),
        }

        let Some(message) = webhook.message else {
            return Ok(OutboundOutcome::Dropped("no message object"));
        };
        if message.private {
            return Ok(OutboundOutcome::Dropped("private note"));
        }
        if let Some(sender) = &message.sender {
            if sender.sender_type.as_deref() == Some("agent_bot")
                || sender.identifier.as_deref() == Some(BOT_IDENTIFIER)
            {
                return Ok(OutboundOutcome::Dropped("bot sender"));
            }
        }
        if message.message_type.as_deref() != Some("outgoing") {
            return Ok(OutboundOutcome::Dropped("not an outgoing message"));
        }

        let raw = message.content.as_deref().unwrap_or("").trim();
        if raw.is_empty() {
            return Ok(OutboundOutcome::Dropped("empty content"));
        }
        let mut content = markdown::chatwoot_to_whatsapp(raw);
        if config.sign_msg {
            if let Some(name) = message.sender.as_ref().and_then(|s| s.name.as_deref()) {
                content = format!("*{}*{}{}", name, config.sign_delimiter, content);
            }
        }

        let phone = webhook
            .contact
            .as_ref()
            .and_then(|c| c.phone_number.as_deref())
            .unwrap_or("");
        let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return Err(GatewayError::InvalidArgument(
                "contact phone_number missing".to_string(),
            ));
        }
        let jid = format!("{}@s.whatsapp.net", digits);

        let receipt = self.sender.send_text(session_id, &jid, &content).await?;

        // Pre-seed the echo dedup row keyed by the WhatsApp message id.
        if !receipt.message_id.is_empty() {
            let device_jid = self
                .store
                .get_session(session_id)
                .ok()
                .and_then(|s| s.device_jid)
                .unwrap_or_default();
            let conversation_id = webhook.conversation.map(|c| c.id).unwrap_or_default();
            if let Err(e) = self.store.insert_synced_mapping(
                session_id,
                &receipt.message_id,
                &device_jid,
                &jid,
                receipt.timestamp,
                Some(&content),
                message.id,
                conversation_id,
            ) {
                debug!("failed to pre-seed outbound mapping: {}", e);
            }
        }

        info!(
            session_id = %session_id,
            to = %jid,
            "chatwoot message forwarded to WhatsApp"
        );
        Ok(OutboundOutcome::Sent {
            message_id: receipt.message_id,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
