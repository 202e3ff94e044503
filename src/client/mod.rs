//! WhatsApp client adapter.
//!
//! The gateway does not speak the WhatsApp wire protocol. It depends on an
//! external protocol bridge that owns encryption, pairing, and session
//! persistence, and exposes a JSON-over-WebSocket interface. This module
//! defines the [`WhatsAppClient`] façade the rest of the gateway programs
//! against, the raw event model the bridge produces, and the concrete
//! [`BridgeClient`](bridge::BridgeClient) implementation.
//!
//! One client instance maps to one session. The session runtime owns the
//! client's event stream; control and send operations are safe to call from
//! any task.

pub mod bridge;

pub use bridge::{BridgeClient, BridgeClientFactory};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;

// ============================================================================
// Raw events (bridge → gateway)
// ============================================================================

/// A message as delivered by the protocol bridge, before enrichment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawMessage {
    pub id: String,
    pub chat: String,
    pub sender: String,
    pub from_me: bool,
    /// Unix seconds.
    pub timestamp: i64,
    /// "text", "image", "audio", "video", "document", "sticker", "location",
    /// "contact", or anything else the bridge may emit ("unknown" downstream).
    pub kind: String,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub address: Option<String>,
    pub contact_name: Option<String>,
    pub contact_phone: Option<String>,
    /// Message id this one quotes, with the quoted text when available.
    pub quoted_id: Option<String>,
    pub quoted_text: Option<String>,
    /// Sender display name (push name).
    pub push_name: Option<String>,
}

/// A delivery/read receipt as delivered by the bridge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawReceipt {
    pub message_ids: Vec<String>,
    pub chat: String,
    pub sender: String,
    /// Unix seconds.
    pub timestamp: i64,
    /// "delivered", "read", "played", ...
    pub receipt_type: String,
}

/// Raw protocol events, tagged by the bridge.
///
/// Structural variants exist for every type the enrichment contract adds
/// fields to; the long tail arrives as [`RawEvent::Other`] and is classified
/// by tag against the catalogue.
#[derive(Debug, Clone)]
pub enum RawEvent {
    Message(RawMessage),
    Receipt(RawReceipt),
    Qr { codes: Vec<String> },
    PairSuccess { device_jid: String },
    PairError { message: String },
    Connected,
    Disconnected,
    LoggedOut { reason: i64 },
    Presence {
        from: String,
        unavailable: bool,
        last_seen: Option<i64>,
    },
    ChatPresence {
        chat: String,
        state: String,
        media: Option<String>,
    },
    GroupInfo {
        jid: String,
        name: Option<String>,
        topic: Option<String>,
    },
    JoinedGroup {
        jid: String,
        reason: String,
        join_type: String,
    },
    Picture {
        jid: String,
        author: String,
        timestamp: i64,
        remove: bool,
    },
    UndecryptableMessage {
        message_id: String,
        chat: String,
        sender: String,
        timestamp: i64,
        is_unavailable: bool,
    },
    KeepAliveTimeout,
    KeepAliveRestored,
    StreamError { code: String },
    /// Anything else, classified by its tag (e.g. "HistorySync", "CallOffer").
    Other {
        tag: String,
        data: serde_json::Value,
    },
}

// ============================================================================
// Outgoing messages (gateway → bridge)
// ============================================================================

/// Media category for outgoing attachments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    Document,
    Sticker,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Document => "document",
            MediaKind::Sticker => "sticker",
        }
    }
}

/// Content of an outgoing send/edit/revoke/reaction operation.
#[derive(Debug, Clone)]
pub enum OutgoingContent {
    Text {
        body: String,
    },
    Media {
        kind: MediaKind,
        data: Vec<u8>,
        mime_type: String,
        caption: Option<String>,
        filename: Option<String>,
    },
    Location {
        latitude: f64,
        longitude: f64,
        name: Option<String>,
        address: Option<String>,
    },
    Contact {
        name: String,
        phone: String,
    },
    Poll {
        name: String,
        options: Vec<String>,
        selectable_count: u32,
    },
    PollVote {
        poll_message_id: String,
        options: Vec<String>,
    },
    Reaction {
        message_id: String,
        emoji: String,
    },
    Edit {
        message_id: String,
        body: String,
    },
    Revoke {
        message_id: String,
    },
}

/// The protocol client's acknowledgement of a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: String,
    /// Unix seconds.
    pub timestamp: i64,
}

/// Downloaded media bytes plus their content type.
#[derive(Debug, Clone)]
pub struct MediaDownload {
    pub data: Vec<u8>,
    pub mime_type: String,
    pub filename: Option<String>,
}

// ============================================================================
// Client façade
// ============================================================================

/// Façade over the external protocol library.
///
/// Implementations must be thread-safe: the runtime drains events from one
/// task while request handlers issue sends from others.
#[async_trait]
pub trait WhatsAppClient: Send + Sync {
    /// Opens (or re-opens) the connection to WhatsApp. Idempotent.
    async fn connect(&self) -> Result<()>;

    /// Closes the connection without revoking the device.
    async fn disconnect(&self);

    /// Revokes the device registration and closes the connection.
    async fn logout(&self) -> Result<()>;

    /// Requests a phone-number pairing code for the given E.164 number.
    async fn pair_phone(&self, phone: &str) -> Result<String>;

    /// Sends a message and returns the protocol acknowledgement.
    async fn send(&self, to: &str, content: OutgoingContent) -> Result<SendReceipt>;

    /// Marks messages in `chat` as read.
    async fn mark_read(&self, chat: &str, message_ids: &[String]) -> Result<()>;

    /// Publishes presence ("available", "composing", "paused", ...).
    async fn set_presence(&self, chat: Option<&str>, state: &str) -> Result<()>;

    /// Downloads the media attached to a received message.
    async fn download_media(&self, message_id: &str) -> Result<MediaDownload>;

    /// Hands the event stream to its single consumer (the session runtime).
    /// Returns `None` on second call.
    fn take_events(&self) -> Option<mpsc::Receiver<RawEvent>>;
}

/// Creates clients for the supervisor, one per session.
pub trait ClientFactory: Send + Sync {
    fn create(&self, session_id: Uuid, proxy_url: Option<&str>) -> Arc<dyn WhatsAppClient>;
}

impl std::fmt::Debug for dyn WhatsAppClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn WhatsAppClient")
    }
}
