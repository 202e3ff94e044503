//! Message use-cases: validation and send orchestration over the runtime.
//!
//! Every operation checks that the session exists and is connected (via the
//! supervisor's send path), validates its type-specific fields, and maps the
//! adapter call into a `{id, status, timestamp}` result. Media sends own
//! their cache entry for the duration of the send and release it afterwards,
//! success or failure.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chatwoot::TextSender;
use crate::client::{MediaKind, OutgoingContent, SendReceipt};
use crate::error::{GatewayError, Result};
use crate::media::MediaCache;
use crate::runtime::SessionSupervisor;

/// Unified send request for all message types.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SendMessageRequest {
    /// Destination JID.
    pub to: String,
    /// "text", "image", "audio", "video", "document", "sticker", "location",
    /// "contact".
    #[serde(rename = "type")]
    pub message_type: String,
    /// Text body (text messages).
    pub body: Option<String>,
    /// Media reference: URL, local path, or data URI.
    pub file: Option<String>,
    pub caption: Option<String>,
    pub filename: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Location label.
    pub name: Option<String>,
    pub address: Option<String>,
    pub contact_name: Option<String>,
    pub contact_phone: Option<String>,
}

/// Result of a send-like operation.
#[derive(Debug, Clone, Serialize)]
pub struct SendResult {
    pub id: String,
    pub status: String,
    /// Unix seconds.
    pub timestamp: i64,
}

impl SendResult {
    fn sent(receipt: SendReceipt) -> Self {
        Self {
            id: receipt.message_id,
            status: "sent".to_string(),
            timestamp: receipt.timestamp,
        }
    }
}

/// Stubbed poll results shape. Result aggregation needs dedicated event
/// handling and is out of scope for v1.
#[derive(Debug, Clone, Serialize, Default)]
pub struct PollResults {
    pub poll_id: String,
    pub votes: Vec<serde_json::Value>,
}

/// Validates that a destination looks like a JID.
fn validate_jid(to: &str) -> Result<&str> {
    let to = to.trim();
    if to.is_empty() {
        return Err(GatewayError::InvalidArgument(
            "'to' must not be empty".to_string(),
        ));
    }
    if !to.contains('@') {
        return Err(GatewayError::InvalidArgument(format!(
            "'{}' is not a JID (expected user@server)",
            to
        )));
    }
    Ok(to)
}

fn require<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(GatewayError::InvalidArgument(format!(
            "'{}' is required",
            field
        ))),
    }
}

/// Message operations exposed to the HTTP layer.
pub struct MessageService {
    supervisor: Arc<SessionSupervisor>,
    media: Arc<MediaCache>,
}

impl MessageService {
    pub fn new(supervisor: Arc<SessionSupervisor>, media: Arc<MediaCache>) -> Arc<Self> {
        Arc::new(Self { supervisor, media })
    }

    /// Unified send for text, media, location, and contact messages.
    pub async fn send(&self, session_id: Uuid, req: SendMessageRequest) -> Result<SendResult> {
        let to = validate_jid(&req.to)?.to_string();

        // Validate before touching the session so bad requests never cost a
        // client round-trip.
        let content = match req.message_type.as_str() {
            "text" => OutgoingContent::Text {
                body: require(&req.body, "body")?.to_string(),
            },
            "location" => {
                let latitude = req.latitude.ok_or_else(|| {
                    GatewayError::InvalidArgument("'latitude' is required".to_string())
                })?;
                let longitude = req.longitude.ok_or_else(|| {
                    GatewayError::InvalidArgument("'longitude' is required".to_string())
                })?;
                OutgoingContent::Location {
                    latitude,
                    longitude,
                    name: req.name.clone(),
                    address: req.address.clone(),
                }
            }
            "contact" => OutgoingContent::Contact {
                name: require(&req.contact_name, "contactName")?.to_string(),
                phone: require(&req.contact_phone, "contactPhone")?.to_string(),
            },
            "image" | "audio" | "video" | "document" | "sticker" => {
                let kind = match req.message_type.as_str() {
                    "image" => MediaKind::Image,
                    "audio" => MediaKind::Audio,
                    "video" => MediaKind::Video,
                    "sticker" => MediaKind::Sticker,
                    _ => MediaKind::Document,
                };
                return self.send_media(session_id, &to, kind, &req).await;
            }
            other => {
                return Err(GatewayError::InvalidArgument(format!(
                    "unknown message type '{}'",
                    other
                )))
            }
        };

        let client = self.supervisor.client_for(session_id).await?;
        client.send(&to, content).await.map(SendResult::sent)
    }

    /// Media send: fetch into the cache, send, release the entry either way.
    async fn send_media(
        &self,
        session_id: Uuid,
        to: &str,
        kind: MediaKind,
        req: &SendMessageRequest,
    ) -> Result<SendResult> {
        let reference = require(&req.file, "file")?;
        let filename = match kind {
            MediaKind::Document => Some(
                req.filename
                    .as_deref()
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .unwrap_or("document")
                    .to_string(),
            ),
            _ => req.filename.clone(),
        };

        let cached = self
            .media
            .fetch(session_id, reference, kind.as_str(), filename.as_deref())
            .await?;

        let result = match self.supervisor.client_for(session_id).await {
            Ok(client) => {
                client
                    .send(
                        to,
                        OutgoingContent::Media {
                            kind,
                            data: cached.data.clone(),
                            mime_type: cached.mime_type.clone(),
                            caption: req.caption.clone(),
                            filename,
                        },
                    )
                    .await
            }
            Err(e) => Err(e),
        };
        self.media.release(session_id, &cached.key);
        result.map(SendResult::sent)
    }

    /// Edits a previously sent message.
    pub async fn edit(
        &self,
        session_id: Uuid,
        to: &str,
        message_id: &str,
        body: &str,
    ) -> Result<SendResult> {
        let to = validate_jid(to)?;
        if message_id.trim().is_empty() {
            return Err(GatewayError::InvalidArgument(
                "'messageId' is required".to_string(),
            ));
        }
        if body.trim().is_empty() {
            return Err(GatewayError::InvalidArgument(
                "'body' is required".to_string(),
            ));
        }
        let client = self.supervisor.client_for(session_id).await?;
        client
            .send(
                to,
                OutgoingContent::Edit {
                    message_id: message_id.to_string(),
                    body: body.to_string(),
                },
            )
            .await
            .map(SendResult::sent)
    }

    /// Revokes (deletes for everyone) a previously sent message.
    pub async fn revoke(&self, session_id: Uuid, to: &str, message_id: &str) -> Result<SendResult> {
        let to = validate_jid(to)?;
        if message_id.trim().is_empty() {
            return Err(GatewayError::InvalidArgument(
                "'messageId' is required".to_string(),
            ));
        }
        let client = self.supervisor.client_for(session_id).await?;
        client
            .send(
                to,
                OutgoingContent::Revoke {
                    message_id: message_id.to_string(),
                },
            )
            .await
            .map(SendResult::sent)
    }

    /// Marks messages in a chat as read.
    pub async fn mark_read(
        &self,
        session_id: Uuid,
        chat: &str,
        message_ids: &[String],
    ) -> Result<()> {
        let chat = validate_jid(chat)?;
        if message_ids.is_empty() {
            return Err(GatewayError::InvalidArgument(
                "'messageIds' must not be empty".to_string(),
            ));
        }
        let client = self.supervisor.client_for(session_id).await?;
        client.mark_read(chat, message_ids).await
    }

    /// Sends an emoji reaction (empty emoji removes the reaction).
    pub async fn react(
        &self,
        session_id: Uuid,
        to: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<SendResult> {
        let to = validate_jid(to)?;
        if message_id.trim().is_empty() {
            return Err(GatewayError::InvalidArgument(
                "'messageId' is required".to_string(),
            ));
        }
        let client = self.supervisor.client_for(session_id).await?;
        client
            .send(
                to,
                OutgoingContent::Reaction {
                    message_id: message_id.to_string(),
                    emoji: emoji.to_string(),
                },
            )
            .await
            .map(SendResult::sent)
    }

    /// Publishes chat presence ("composing", "paused") or global presence.
    pub async fn presence(
        &self,
        session_id: Uuid,
        chat: Option<&str>,
        state: &str,
    ) -> Result<()> {
        if state.trim().is_empty() {
            return Err(GatewayError::InvalidArgument(
                "'state' is required".to_string(),
            ));
        }
        if let Some(chat) = chat {
            validate_jid(chat)?;
        }
        let client = self.supervisor.client_for(session_id).await?;
        client.set_presence(chat, state).await
    }

    /// Creates a poll.
    pub async fn poll_create(
        &self,
        session_id: Uuid,
        to: &str,
        name: &str,
        options: &[String],
        selectable_count: u32,
    ) -> Result<SendResult> {
        let to = validate_jid(to)?;
        if name.trim().is_empty() {
            return Err(GatewayError::InvalidArgument(
                "'name' is required".to_string(),
            ));
        }
        if options.len() < 2 {
            return Err(GatewayError::InvalidArgument(
                "a poll needs at least two options".to_string(),
            ));
        }
        let client = self.supervisor.client_for(session_id).await?;
        client
            .send(
                to,
                OutgoingContent::Poll {
                    name: name.to_string(),
                    options: options.to_vec(),
                    selectable_count: selectable_count.max(1),
                },
            )
            .await
            .map(SendResult::sent)
    }

    /// Votes on a poll.
    pub async fn poll_vote(
        &self,
        session_id: Uuid,
        to: &str,
        poll_message_id: &str,
        options: &[String],
    ) -> Result<SendResult> {
        let to = validate_jid(to)?;
        if poll_message_id.trim().is_empty() {
            return Err(GatewayError::InvalidArgument(
                "'pollMessageId' is required".to_string(),
            ));
        }
        let client = self.supervisor.client_for(session_id).await?;
        client
            .send(
                to,
                OutgoingContent::PollVote {
                    poll_message_id: poll_message_id.to_string(),
                    options: options.to_vec(),
                },
            )
            .await
            .map(SendResult::sent)
    }

    /// Poll results are not aggregated in v1; returns the empty shape.
    pub async fn poll_results(&self, session_id: Uuid, poll_id: &str) -> Result<PollResults> {
        self.supervisor.get(session_id)?;
        Ok(PollResults {
            poll_id: poll_id.to_string(),
            votes: Vec::new(),
        })
    }

    /// Downloads a received message's media through the client and caches it.
    pub async fn download_media(
        &self,
        session_id: Uuid,
        message_id: &str,
    ) -> Result<crate::media::CachedMedia> {
        if message_id.trim().is_empty() {
            return Err(GatewayError::InvalidArgument(
                "'messageId' is required".to_string(),
            ));
        }
        if let Some(cached) = self.media.get(session_id, message_id).await? {
            return Ok(cached);
        }
        let client = self.supervisor.client_for(session_id).await?;
        let download = client.download_media(message_id).await?;
        self.media
            .put(
                session_id,
                message_id,
                "download",
                &download.mime_type,
                &download.data,
                download.filename.as_deref(),
            )
            .await
    }
}

#[async_trait]
impl TextSender for MessageService {
    async fn send_text(&self, session_id: Uuid, to_jid: &str, body: &str) -> Result<SendReceipt> {
        let to = validate_jid(to_jid)?;
        if body.trim().is_empty() {
            return Err(GatewayError::InvalidArgument(
                "'body' is required".to_string(),
            ));
        }
        self.supervisor.send_text(session_id, to, body).await
    }
}
