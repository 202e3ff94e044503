//! Classification and enrichment of raw client events.
//!
//! One call per raw event: classify the adapter tag against the catalogue,
//! drop what is not in it (notably `AppState`), serialize the raw fields to a
//! flat JSON object, and add the per-type field set every consumer relies on.

use chrono::Utc;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::client::{RawEvent, RawMessage};

use super::{Event, EventType};

/// Normalized message type for enriched `Message` events.
fn message_type(raw_kind: &str) -> &'static str {
    match raw_kind {
        "text" => "text",
        "image" => "image",
        "audio" => "audio",
        "video" => "video",
        "document" => "document",
        "sticker" => "sticker",
        "location" => "location",
        "contact" => "contact",
        _ => "unknown",
    }
}

fn enrich_message(msg: &RawMessage) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("message_id".to_string(), json!(msg.id));
    data.insert("from_me".to_string(), json!(msg.from_me));
    data.insert("chat".to_string(), json!(msg.chat));
    data.insert("sender".to_string(), json!(msg.sender));
    data.insert("timestamp".to_string(), json!(msg.timestamp));

    let msg_type = message_type(&msg.kind);
    data.insert("message_type".to_string(), json!(msg_type));

    match msg_type {
        "text" => {
            data.insert(
                "text".to_string(),
                json!(msg.text.clone().unwrap_or_default()),
            );
        }
        "image" | "video" => {
            if let Some(caption) = &msg.caption {
                data.insert("caption".to_string(), json!(caption));
            }
        }
        "document" => {
            if let Some(filename) = &msg.filename {
                data.insert("filename".to_string(), json!(filename));
            }
        }
        "location" => {
            data.insert(
                "latitude".to_string(),
                json!(msg.latitude.unwrap_or_default()),
            );
            data.insert(
                "longitude".to_string(),
                json!(msg.longitude.unwrap_or_default()),
            );
            if let Some(address) = &msg.address {
                data.insert("address".to_string(), json!(address));
            }
        }
        "contact" => {
            if let Some(name) = &msg.contact_name {
                data.insert("contact_name".to_string(), json!(name));
            }
            if let Some(phone) = &msg.contact_phone {
                data.insert("contact_phone".to_string(), json!(phone));
            }
        }
        _ => {}
    }

    if let Some(quoted_id) = &msg.quoted_id {
        data.insert("quoted_id".to_string(), json!(quoted_id));
    }
    if let Some(quoted_text) = &msg.quoted_text {
        data.insert("quoted_text".to_string(), json!(quoted_text));
    }
    if let Some(push_name) = &msg.push_name {
        data.insert("push_name".to_string(), json!(push_name));
    }
    data
}

/// Classifies and enriches one raw event.
///
/// Returns `None` when the event must be dropped: its tag is outside the
/// catalogue (e.g. `AppState`).
pub fn enrich(session_id: Uuid, raw: &RawEvent) -> Option<Event> {
    let now = Utc::now().timestamp();
    let (event_type, data) = match raw {
        RawEvent::Message(msg) => (EventType::Message, enrich_message(msg)),

        RawEvent::Receipt(receipt) => {
            let mut data = Map::new();
            data.insert("message_ids".to_string(), json!(receipt.message_ids));
            data.insert("chat".to_string(), json!(receipt.chat));
            data.insert("sender".to_string(), json!(receipt.sender));
            data.insert("timestamp".to_string(), json!(receipt.timestamp));
            data.insert("receipt_type".to_string(), json!(receipt.receipt_type));
            (EventType::Receipt, data)
        }

        // QR payloads are redacted: consumers learn how many codes were
        // generated, never the codes themselves.
        RawEvent::Qr { codes } => {
            let mut data = Map::new();
            data.insert("codes_count".to_string(), json!(codes.len()));
            (EventType::Qr, data)
        }

        RawEvent::PairSuccess { device_jid } => {
            let mut data = Map::new();
            data.insert("paired_at".to_string(), json!(now));
            data.insert("device_id".to_string(), json!(device_jid));
            (EventType::PairSuccess, data)
        }

        RawEvent::PairError { message } => {
            let mut data = Map::new();
            data.insert("error_at".to_string(), json!(now));
            data.insert("error_message".to_string(), json!(message));
            (EventType::PairError, data)
        }

        RawEvent::Connected => {
            let mut data = Map::new();
            data.insert("connected_at".to_string(), json!(now));
            (EventType::Connected, data)
        }

        RawEvent::Disconnected => {
            let mut data = Map::new();
            data.insert("disconnected_at".to_string(), json!(now));
            (EventType::Disconnected, data)
        }

        RawEvent::LoggedOut { reason } => {
            let mut data = Map::new();
            data.insert("logged_out_at".to_string(), json!(now));
            data.insert("reason".to_string(), json!(reason.to_string()));
            (EventType::LoggedOut, data)
        }

        RawEvent::Presence {
            from,
            unavailable,
            last_seen,
        } => {
            let mut data = Map::new();
            data.insert("from".to_string(), json!(from));
            data.insert("unavailable".to_string(), json!(unavailable));
            if let Some(last_seen) = last_seen {
                data.insert("last_seen".to_string(), json!(last_seen));
            }
            (EventType::Presence, data)
        }

        RawEvent::ChatPresence { chat, state, media } => {
            let mut data = Map::new();
            data.insert("chat".to_string(), json!(chat));
            data.insert("state".to_string(), json!(state));
            if let Some(media) = media {
                data.insert("media".to_string(), json!(media));
            }
            (EventType::ChatPresence, data)
        }

        RawEvent::GroupInfo { jid, name, topic } => {
            let mut data = Map::new();
            data.insert("group_jid".to_string(), json!(jid));
            if let Some(name) = name {
                data.insert("group_name".to_string(), json!(name));
            }
            if let Some(topic) = topic {
                data.insert("group_topic".to_string(), json!(topic));
            }
            (EventType::GroupInfo, data)
        }

        RawEvent::JoinedGroup {
            jid,
            reason,
            join_type,
        } => {
            let mut data = Map::new();
            data.insert("group_jid".to_string(), json!(jid));
            data.insert("reason".to_string(), json!(reason));
            data.insert("type".to_string(), json!(join_type));
            (EventType::JoinedGroup, data)
        }

        RawEvent::Picture {
            jid,
            author,
            timestamp,
            remove,
        } => {
            let mut data = Map::new();
            data.insert("jid".to_string(), json!(jid));
            data.insert("author".to_string(), json!(author));
            data.insert("timestamp".to_string(), json!(timestamp));
            data.insert("remove".to_string(), json!(remove));
            (EventType::Picture, data)
        }

        RawEvent::UndecryptableMessage {
            message_id,
            chat,
            sender,
            timestamp,
            is_unavailable,
        } => {
            let mut data = Map::new();
            data.insert("message_id".to_string(), json!(message_id));
            data.insert("chat".to_string(), json!(chat));
            data.insert("sender".to_string(), json!(sender));
            data.insert("timestamp".to_string(), json!(timestamp));
            data.insert("is_unavailable".to_string(), json!(is_unavailable));
            (EventType::UndecryptableMessage, data)
        }

        RawEvent::KeepAliveTimeout => {
            let mut data = Map::new();
            data.insert("keep_alive_timeout_at".to_string(), json!(now));
            (EventType::KeepAliveTimeout, data)
        }

        RawEvent::KeepAliveRestored => {
            let mut data = Map::new();
            data.insert("keep_alive_restored_at".to_string(), json!(now));
            (EventType::KeepAliveRestored, data)
        }

        RawEvent::StreamError { code } => {
            let mut data = Map::new();
            data.insert("code".to_string(), json!(code));
            (EventType::StreamError, data)
        }

        RawEvent::Other { tag, data } => {
            let event_type = EventType::parse(tag)?;
            let data = match data {
                Value::Object(map) => map.clone(),
                _ => Map::new(),
            };
            (event_type, data)
        }
    };

    Some(Event::new(session_id, event_type, data))
}
