//! Domain events and the pipeline that fans them out.
//!
//! Raw client events (from the protocol bridge) are classified against a
//! closed catalogue, enriched with a uniform per-type field set, and published
//! to every registered [`EventSink`]: currently the webhook delivery
//! subsystem and the Chatwoot bridge. Consumers are decoupled: the pipeline
//! holds no direct reference to either subsystem, so each can be disabled
//! independently.

pub mod enrich;
pub mod publisher;

pub use publisher::{EventPipeline, EventPublisher, EventSink};

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use uuid::Uuid;

// ============================================================================
// EventType: the closed catalogue
// ============================================================================

/// Every event type the gateway emits.
///
/// The catalogue is closed: adapter events whose tag is not listed here (for
/// example `AppState`) are dropped at the source and never reach a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Message,
    Receipt,
    Connected,
    Disconnected,
    Qr,
    PairSuccess,
    PairError,
    LoggedOut,
    Presence,
    ChatPresence,
    GroupInfo,
    JoinedGroup,
    Picture,
    UndecryptableMessage,
    KeepAliveTimeout,
    KeepAliveRestored,
    HistorySync,
    CallOffer,
    CallAccept,
    CallTerminate,
    CallOfferNotice,
    CallRelayLatency,
    NewsletterJoin,
    NewsletterLeave,
    NewsletterMuteChange,
    NewsletterLiveUpdate,
    AppStateSyncComplete,
    OfflineSyncCompleted,
    OfflineSyncPreview,
    StreamError,
    StreamReplaced,
    ConnectFailure,
    ClientOutdated,
    TemporaryBan,
    BlocklistChange,
    PrivacySettings,
    PushNameSetting,
    UserAbout,
    MediaRetry,
    ReadReceipt,
    IdentityChange,
    CatRefreshError,
    FbMessage,
    QrScannedWithoutMultidevice,
}

impl EventType {
    /// The wire name used in webhook payloads and subscription filters.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Message => "Message",
            EventType::Receipt => "Receipt",
            EventType::Connected => "Connected",
            EventType::Disconnected => "Disconnected",
            EventType::Qr => "QR",
            EventType::PairSuccess => "PairSuccess",
            EventType::PairError => "PairError",
            EventType::LoggedOut => "LoggedOut",
            EventType::Presence => "Presence",
            EventType::ChatPresence => "ChatPresence",
            EventType::GroupInfo => "GroupInfo",
            EventType::JoinedGroup => "JoinedGroup",
            EventType::Picture => "Picture",
            EventType::UndecryptableMessage => "UndecryptableMessage",
            EventType::KeepAliveTimeout => "KeepAliveTimeout",
            EventType::KeepAliveRestored => "KeepAliveRestored",
            EventType::HistorySync => "HistorySync",
            EventType::CallOffer => "CallOffer",
            EventType::CallAccept => "CallAccept",
            EventType::CallTerminate => "CallTerminate",
            EventType::CallOfferNotice => "CallOfferNotice",
            EventType::CallRelayLatency => "CallRelayLatency",
            EventType::NewsletterJoin => "NewsletterJoin",
            EventType::NewsletterLeave => "NewsletterLeave",
            EventType::NewsletterMuteChange => "NewsletterMuteChange",
            EventType::NewsletterLiveUpdate => "NewsletterLiveUpdate",
            EventType::AppStateSyncComplete => "AppStateSyncComplete",
            EventType::OfflineSyncCompleted => "OfflineSyncCompleted",
            EventType::OfflineSyncPreview => "OfflineSyncPreview",
            EventType::StreamError => "StreamError",
            EventType::StreamReplaced => "StreamReplaced",
            EventType::ConnectFailure => "ConnectFailure",
            EventType::ClientOutdated => "ClientOutdated",
            EventType::TemporaryBan => "TemporaryBan",
            EventType::BlocklistChange => "BlocklistChange",
            EventType::PrivacySettings => "PrivacySettings",
            EventType::PushNameSetting => "PushNameSetting",
            EventType::UserAbout => "UserAbout",
            EventType::MediaRetry => "MediaRetry",
            EventType::ReadReceipt => "ReadReceipt",
            EventType::IdentityChange => "IdentityChange",
            EventType::CatRefreshError => "CATRefreshError",
            EventType::FbMessage => "FBMessage",
            EventType::QrScannedWithoutMultidevice => "QRScannedWithoutMultidevice",
        }
    }

    /// Parses a wire name back into the catalogue. `None` for anything
    /// unknown, including `AppState`, which is deliberately absent.
    pub fn parse(raw: &str) -> Option<Self> {
        Self::all().iter().copied().find(|t| t.as_str() == raw)
    }

    /// The whole catalogue, used to validate subscription filters.
    pub fn all() -> &'static [EventType] {
        use EventType::*;
        &[
            Message,
            Receipt,
            Connected,
            Disconnected,
            Qr,
            PairSuccess,
            PairError,
            LoggedOut,
            Presence,
            ChatPresence,
            GroupInfo,
            JoinedGroup,
            Picture,
            UndecryptableMessage,
            KeepAliveTimeout,
            KeepAliveRestored,
            HistorySync,
            CallOffer,
            CallAccept,
            CallTerminate,
            CallOfferNotice,
            CallRelayLatency,
            NewsletterJoin,
            NewsletterLeave,
            NewsletterMuteChange,
            NewsletterLiveUpdate,
            AppStateSyncComplete,
            OfflineSyncCompleted,
            OfflineSyncPreview,
            StreamError,
            StreamReplaced,
            ConnectFailure,
            ClientOutdated,
            TemporaryBan,
            BlocklistChange,
            PrivacySettings,
            PushNameSetting,
            UserAbout,
            MediaRetry,
            ReadReceipt,
            IdentityChange,
            CatRefreshError,
            FbMessage,
            QrScannedWithoutMultidevice,
        ]
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Event
// ============================================================================

/// One enriched event flowing to consumers.
#[derive(Debug, Clone)]
pub struct Event {
    /// Unique event id. UUID v4 for real events; test injections use the
    /// `test-<subscription-id>` form.
    pub id: String,
    /// Owning session id as a string ("test-session" for test injections).
    pub session_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    /// The enriched, flat data object. Always carries the per-type field set
    /// from the enrichment contract.
    pub data: Map<String, Value>,
}

impl Event {
    /// Creates an event stamped with a fresh id and the current instant.
    pub fn new(session_id: Uuid, event_type: EventType, data: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            event_type,
            timestamp: Utc::now(),
            data,
        }
    }

    /// The webhook payload body for this event.
    pub fn payload(&self) -> Value {
        json!({
            "event": self.event_type.as_str(),
            "sessionId": self.session_id,
            "timestamp": self.timestamp.timestamp(),
            "data": Value::Object(self.data.clone()),
        })
    }
}
