//! Inbound mirror: WhatsApp → Chatwoot.
//!
//! The bridge consumes enriched `Message` events for sessions whose Chatwoot
//! config is enabled. The dedup ledger (`zpMessage`) is written *before* any
//! remote call: the pending row is the promise that this WhatsApp message id
//! is being handled, so a re-observed message (echo of an outbound send, or
//! an at-least-once redelivery that already synced) never double-posts.
//!
//! The event sink does only local work (config lookup, dedup check, pending
//! upsert), then spawns the remote reconciliation so the session's dispatch
//! task is never blocked on Chatwoot.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::events::{Event, EventSink, EventType};
use crate::store::{ChatwootConfig, Store};

use super::api::{ChatwootApi, Contact, Conversation};
use super::markdown;
use super::phone;

/// The fields of an enriched `Message` event the bridge consumes.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub message_id: String,
    pub chat: String,
    pub sender: String,
    pub from_me: bool,
    pub timestamp: i64,
    pub message_type: String,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub filename: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub address: Option<String>,
    pub contact_name: Option<String>,
    pub contact_phone: Option<String>,
    pub quoted_text: Option<String>,
    pub push_name: Option<String>,
}

impl InboundMessage {
    /// Extracts the bridge's view from an enriched event's data object.
    pub fn from_event(event: &Event) -> Option<Self> {
        let data = &event.data;
        let get_str =
            |key: &str| -> Option<String> { data.get(key)?.as_str().map(str::to_string) };
        let message_id = get_str("message_id")?;
        if message_id.is_empty() {
            return None;
        }
        Some(Self {
            message_id,
            chat: get_str("chat").unwrap_or_default(),
            sender: get_str("sender").unwrap_or_default(),
            from_me: data.get("from_me").and_then(Value::as_bool).unwrap_or(false),
            timestamp: data
                .get("timestamp")
                .and_then(Value::as_i64)
                .unwrap_or_default(),
            message_type: get_str("message_type").unwrap_or_else(|| "unknown".to_string()),
            text: get_str("text"),
            caption: get_str("caption"),
            filename: get_str("filename"),
            latitude: data.get("latitude").and_then(Value::as_f64),
            longitude: data.get("longitude").and_then(Value::as_f64),
            address: get_str("address"),
            contact_name: get_str("contact_name"),
            contact_phone: get_str("contact_phone"),
            quoted_text: get_str("quoted_text"),
            push_name: get_str("push_name"),
        })
    }

    /// Formats this message as Chatwoot markdown per its type.
    pub fn format_content(&self) -> String {
        let content = match self.message_type.as_str() {
            "text" => markdown::whatsapp_to_chatwoot(self.text.as_deref().unwrap_or_default()),
            "contact" => markdown::format_contact(
                self.contact_name.as_deref().unwrap_or("Unknown"),
                self.contact_phone.as_deref().unwrap_or(""),
            ),
            "location" => markdown::format_location(
                self.latitude.unwrap_or_default(),
                self.longitude.unwrap_or_default(),
                self.address.as_deref(),
            ),
            other => {
                let header = markdown::media_header(other).unwrap_or("📎 Attachment");
                let body = self
                    .caption
                    .as_deref()
                    .or(self.filename.as_deref())
                    .unwrap_or("");
                if body.is_empty() {
                    header.to_string()
                } else {
                    format!("{}\n{}", header, markdown::whatsapp_to_chatwoot(body))
                }
            }
        };

        match self.quoted_text.as_deref() {
            Some(quoted) if !quoted.is_empty() => {
                markdown::quote_block(&markdown::whatsapp_to_chatwoot(quoted), &content)
            }
            _ => content,
        }
    }
}

/// The WhatsApp→Chatwoot half of the bridge.
pub struct ChatwootBridge {
    store: Store,
}

impl ChatwootBridge {
    pub fn new(store: Store) -> Arc<Self> {
        Arc::new(Self { store })
    }

    /// Local (non-remote) half of inbound handling: filter, dedup, pending
    /// marker. Returns the work to mirror remotely, or `None` when the event
    /// is skipped.
    fn prepare(&self, event: &Event) -> Option<(Uuid, ChatwootConfig, InboundMessage)> {
        if event.event_type != EventType::Message {
            return None;
        }
        let session_id = Uuid::parse_str(&event.session_id).ok()?;

        let config = match self.store.get_chatwoot_config(session_id) {
            Ok(Some(config)) if config.enabled => config,
            Ok(_) => return None,
            Err(e) => {
                warn!(session_id = %session_id, "chatwoot config lookup failed: {}", e);
                return None;
            }
        };

        let msg = InboundMessage::from_event(event)?;
        if config.ignores(&msg.chat) || config.ignores(&msg.sender) {
            debug!(chat = %msg.chat, "chatwoot: ignored JID");
            return None;
        }

        // Dedup: a row that already carries a Chatwoot message id means this
        // WhatsApp message originated in (or already reached) Chatwoot.
        match self.store.get_mapping(session_id, &msg.message_id) {
            Ok(Some(mapping)) if mapping.cw_message_id.is_some() => {
                debug!(message_id = %msg.message_id, "chatwoot: already mapped, skipping");
                return None;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("chatwoot mapping lookup failed: {}", e);
                return None;
            }
        }

        // Pending marker before any remote call.
        if let Err(e) = self.store.upsert_pending_mapping(
            session_id,
            &msg.message_id,
            &msg.sender,
            &msg.chat,
            msg.timestamp,
            msg.from_me,
            &msg.message_type,
            msg.text.as_deref().or(msg.caption.as_deref()),
        ) {
            warn!("chatwoot pending mapping write failed: {}", e);
            return None;
        }

        Some((session_id, config, msg))
    }
}

#[async_trait]
impl EventSink for ChatwootBridge {
    fn name(&self) -> &str {
        "chatwoot"
    }

    async fn deliver(&self, event: &Event) {
        let Some((session_id, config, msg)) = self.prepare(event) else {
            return;
        };

        let store = self.store.clone();
        tokio::spawn(async move {
            let message_id = msg.message_id.clone();
            if let Err(e) = sync_to_chatwoot(&store, &config, session_id, msg).await {
                warn!(
                    session_id = %session_id,
                    message_id = %message_id,
                    "chatwoot sync failed: {}", e
                );
                if let Err(e) = store.mark_mapping_failed(session_id, &message_id) {
                    debug!("failed to mark mapping failed: {}", e);
                }
            }
        });
    }
}

// ----------------------------------------------------------------------
// Remote reconciliation
// ----------------------------------------------------------------------

/// Mirrors one message into Chatwoot and promotes its mapping to `synced`.
async fn sync_to_chatwoot(
    store: &Store,
    config: &ChatwootConfig,
    session_id: Uuid,
    msg: InboundMessage,
) -> Result<()> {
    let api = ChatwootApi::new(config);
    let inbox_id = ensure_inbox(store, &api, config, session_id).await?;

    let digits = phone::extract_phone(&msg.sender).ok_or_else(|| {
        GatewayError::InvalidArgument(format!("no phone in sender JID '{}'", msg.sender))
    })?;
    let variants = phone::lookup_variants(&digits, config.merge_brazil);
    let display_name = msg
        .push_name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| variants[0].clone());

    let contact = resolve_contact(&api, inbox_id, &variants, &display_name).await?;
    let conversation = resolve_conversation(&api, config, contact.id, inbox_id).await?;

    let content = msg.format_content();
    let message_type = if msg.from_me { "outgoing" } else { "incoming" };
    let posted = api
        .create_message(conversation.id, &content, message_type)
        .await?;

    store.mark_mapping_synced(session_id, &msg.message_id, posted.id, conversation.id)?;
    debug!(
        message_id = %msg.message_id,
        cw_message_id = posted.id,
        "chatwoot: message mirrored"
    );
    Ok(())
}

/// Resolves the target inbox: the configured one, or (with `auto_create`) an
/// inbox named after the session, created on first use and persisted.
async fn ensure_inbox(
    store: &Store,
    api: &ChatwootApi,
    config: &ChatwootConfig,
    session_id: Uuid,
) -> Result<i64> {
    if let Some(inbox_id) = config.inbox_id {
        return Ok(inbox_id);
    }
    if !config.auto_create {
        return Err(GatewayError::FailedPrecondition(
            "no Chatwoot inbox configured".to_string(),
        ));
    }

    let session = store.get_session(session_id)?;
    let existing = api
        .list_inboxes()
        .await?
        .into_iter()
        .find(|inbox| inbox.name.as_deref() == Some(session.name.as_str()));
    let inbox = match existing {
        Some(inbox) => inbox,
        None => api.create_inbox(&session.name).await?,
    };
    store.set_chatwoot_inbox(session_id, inbox.id)?;
    Ok(inbox.id)
}

/// Finds or creates the contact for a set of phone variants, merging the
/// Brazilian 13/14-digit pair when both exist.
async fn resolve_contact(
    api: &ChatwootApi,
    inbox_id: i64,
    variants: &[String],
    display_name: &str,
) -> Result<Contact> {
    let mut found: Vec<Contact> = Vec::new();
    for variant in variants {
        for contact in api.search_contacts(variant).await? {
            if contact.phone_number.as_deref() == Some(variant.as_str())
                && !found.iter().any(|c| c.id == contact.id)
            {
                found.push(contact);
            }
        }
    }

    if found.len() == 2 && variants.len() == 2 && variants.iter().all(|v| v.starts_with("+55")) {
        // Both number variants exist: keep the 14-digit contact as base.
        if let Some(base_idx) = found
            .iter()
            .position(|c| c.phone_number.as_deref() == Some(variants[1].as_str()))
        {
            let base = found.remove(base_idx);
            let mergee = found.remove(0);
            api.merge_contacts(base.id, mergee.id).await?;
            return Ok(base);
        }
    }

    if let Some(contact) = found.into_iter().next() {
        return Ok(contact);
    }
    api.create_contact(inbox_id, display_name, &variants[0]).await
}

/// Finds the active conversation for (contact, inbox), reopening or creating
/// per config.
async fn resolve_conversation(
    api: &ChatwootApi,
    config: &ChatwootConfig,
    contact_id: i64,
    inbox_id: i64,
) -> Result<Conversation> {
    let conversations = api.contact_conversations(contact_id).await?;

    if let Some(open) = conversations
        .iter()
        .find(|c| c.inbox_id == Some(inbox_id) && c.is_open())
    {
        return Ok(open.clone());
    }

    if config.reopen_conv {
        if let Some(resolved) = conversations.iter().find(|c| c.inbox_id == Some(inbox_id)) {
            api.toggle_status(resolved.id, "open").await?;
            let mut reopened = resolved.clone();
            reopened.status = Some("open".to_string());
            return Ok(reopened);
        }
    }

    let status = if config.conv_pending {
        Some("pending")
    } else {
        None
    };
    api.create_conversation(contact_id, inbox_id, status).await
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SyncStatus;
    use serde_json::json;

    fn message_event(session_id: Uuid, message_id: &str) -> Event {
        let mut data = serde_json::Map::new();
        data.insert("message_id".to_string(), json!(message_id));
        data.insert("chat".to_string(), json!("5511999999999@s.whatsapp.net"));
        data.insert("sender".to_string(), json!("5511999999999@s.whatsapp.net"));
        data.insert("from_me".to_string(), json!(false));
        data.insert("timestamp".to_string(), json!(1707900000));
        data.insert("message_type".to_string(), json!("text"));
        data.insert("text".to_string(), json!("oi"));
        Event::new(session_id, EventType::Message, data)
    }

    fn enabled_config(store: &Store, session_id: Uuid) -> ChatwootConfig {
        let mut cfg = ChatwootConfig::new(session_id, "http://127.0.0.1:1", "tok", "1");
        cfg.enabled = true;
        store.put_chatwoot_config(&cfg).unwrap();
        cfg
    }

    #[test]
    fn test_from_event_extraction() {
        let event = message_event(Uuid::new_v4(), "MSG1");
        let msg = InboundMessage::from_event(&event).unwrap();
        assert_eq!(msg.message_id, "MSG1");
        assert_eq!(msg.sender, "5511999999999@s.whatsapp.net");
        assert_eq!(msg.message_type, "text");
        assert_eq!(msg.text.as_deref(), Some("oi"));
        assert!(!msg.from_me);
    }

    #[test]
    fn test_from_event_requires_message_id() {
        let mut event = message_event(Uuid::new_v4(), "MSG1");
        event.data.remove("message_id");
        assert!(InboundMessage::from_event(&event).is_none());
    }

    #[test]
    fn test_format_text_converts_markdown() {
        let msg = InboundMessage {
            message_type: "text".to_string(),
            text: Some("*bold* and _italic_".to_string()),
            ..Default::default()
        };
        assert_eq!(msg.format_content(), "**bold** and *italic*");
    }

    #[test]
    fn test_format_media_with_caption() {
        let msg = InboundMessage {
            message_type: "image".to_string(),
            caption: Some("look at *this*".to_string()),
            ..Default::default()
        };
        assert_eq!(msg.format_content(), "📷 Image\nlook at **this**");
    }

    #[test]
    fn test_format_media_without_caption() {
        let msg = InboundMessage {
            message_type: "sticker".to_string(),
            ..Default::default()
        };
        assert_eq!(msg.format_content(), "😊 Sticker");
    }

    #[test]
    fn test_format_document_falls_back_to_filename() {
        let msg = InboundMessage {
            message_type: "document".to_string(),
            filename: Some("report.pdf".to_string()),
            ..Default::default()
        };
        assert_eq!(msg.format_content(), "📄 Document\nreport.pdf");
    }

    #[test]
    fn test_format_contact_card() {
        let msg = InboundMessage {
            message_type: "contact".to_string(),
            contact_name: Some("Maria".to_string()),
            contact_phone: Some("+5511988888888".to_string()),
            ..Default::default()
        };
        let out = msg.format_content();
        assert!(out.starts_with("📞 **Contact Shared**"));
        assert!(out.contains("**Name:** Maria"));
        assert!(out.contains("**Phone:** +5511988888888"));
    }

    #[test]
    fn test_format_location_card() {
        let msg = InboundMessage {
            message_type: "location".to_string(),
            latitude: Some(-23.55),
            longitude: Some(-46.63),
            address: Some("Av. Paulista".to_string()),
            ..Default::default()
        };
        let out = msg.format_content();
        assert!(out.contains("**Address:** Av. Paulista"));
        assert!(out.contains("https://maps.google.com/?q=-23.55,-46.63"));
    }

    #[test]
    fn test_format_quoted_prepends_blockquote() {
        let msg = InboundMessage {
            message_type: "text".to_string(),
            text: Some("reply".to_string()),
            quoted_text: Some("original".to_string()),
            ..Default::default()
        };
        assert_eq!(msg.format_content(), "> original\n\nreply");
    }

    #[test]
    fn test_prepare_skips_without_config() {
        let store = Store::open_in_memory().unwrap();
        let bridge = ChatwootBridge::new(store);
        let event = message_event(Uuid::new_v4(), "MSG1");
        assert!(bridge.prepare(&event).is_none());
    }

    #[test]
    fn test_prepare_skips_disabled_config() {
        let store = Store::open_in_memory().unwrap();
        let session = store.create_session("alice", None).unwrap();
        let cfg = ChatwootConfig::new(session.id, "http://x", "tok", "1");
        store.put_chatwoot_config(&cfg).unwrap();

        let bridge = ChatwootBridge::new(store);
        assert!(bridge.prepare(&message_event(session.id, "MSG1")).is_none());
    }

    #[test]
    fn test_prepare_writes_pending_marker() {
        let store = Store::open_in_memory().unwrap();
        let session = store.create_session("alice", None).unwrap();
        enabled_config(&store, session.id);

        let bridge = ChatwootBridge::new(store.clone());
        let prepared = bridge.prepare(&message_event(session.id, "MSG1"));
        assert!(prepared.is_some());

        let mapping = store.get_mapping(session.id, "MSG1").unwrap().unwrap();
        assert_eq!(mapping.sync_status, SyncStatus::Pending);
        assert!(!mapping.zp_from_me);
        assert_eq!(mapping.content.as_deref(), Some("oi"));
    }

    #[test]
    fn test_prepare_dedups_mapped_message() {
        let store = Store::open_in_memory().unwrap();
        let session = store.create_session("alice", None).unwrap();
        enabled_config(&store, session.id);

        // Message already reached Chatwoot (e.g. outbound echo).
        store
            .insert_synced_mapping(
                session.id,
                "MSG1",
                "me@s.whatsapp.net",
                "5511999999999@s.whatsapp.net",
                1707900000,
                Some("hello"),
                42,
                7,
            )
            .unwrap();

        let bridge = ChatwootBridge::new(store);
        assert!(bridge.prepare(&message_event(session.id, "MSG1")).is_none());
    }

    #[test]
    fn test_prepare_allows_retry_of_failed_mapping() {
        let store = Store::open_in_memory().unwrap();
        let session = store.create_session("alice", None).unwrap();
        enabled_config(&store, session.id);

        let bridge = ChatwootBridge::new(store.clone());
        assert!(bridge.prepare(&message_event(session.id, "MSG1")).is_some());
        store.mark_mapping_failed(session.id, "MSG1").unwrap();

        // A redelivered event may try again: no Chatwoot id yet.
        assert!(bridge.prepare(&message_event(session.id, "MSG1")).is_some());
    }

    #[test]
    fn test_prepare_respects_ignore_jids() {
        let store = Store::open_in_memory().unwrap();
        let session = store.create_session("alice", None).unwrap();
        let mut cfg = ChatwootConfig::new(session.id, "http://x", "tok", "1");
        cfg.enabled = true;
        cfg.ignore_jids = vec!["5511999999999@s.whatsapp.net".to_string()];
        store.put_chatwoot_config(&cfg).unwrap();

        let bridge = ChatwootBridge::new(store);
        assert!(bridge.prepare(&message_event(session.id, "MSG1")).is_none());
    }

    #[test]
    fn test_prepare_ignores_non_message_events() {
        let store = Store::open_in_memory().unwrap();
        let session = store.create_session("alice", None).unwrap();
        enabled_config(&store, session.id);

        let bridge = ChatwootBridge::new(store);
        let event = Event::new(session.id, EventType::Connected, serde_json::Map::new());
        assert!(bridge.prepare(&event).is_none());
    }
}
