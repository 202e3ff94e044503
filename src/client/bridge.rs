//! WhatsApp protocol bridge client (JSON over WebSocket).
//!
//! One `BridgeClient` holds one WebSocket connection to the external bridge,
//! scoped to a single session: `<base_url>/session/<session-id>`.
//!
//! # Bridge Protocol
//!
//! Inbound (bridge → gateway):
//! ```json
//! {"type":"event","tag":"Message","data":{"id":"3EB0...","chat":"5511999999999@s.whatsapp.net","kind":"text","text":"oi","timestamp":1707900000}}
//! {"type":"event","tag":"QR","data":{"codes":["2@abc...","2@def..."]}}
//! {"type":"result","id":7,"ok":true,"data":{"message_id":"3EB0...","timestamp":1707900001}}
//! ```
//!
//! Outbound (gateway → bridge):
//! ```json
//! {"type":"send","id":7,"to":"5511999999999@s.whatsapp.net","kind":"text","body":"hello"}
//! {"type":"pair_phone","id":8,"phone":"+5511999999999"}
//! ```
//!
//! Commands carry a correlation id; the matching `result` frame resolves the
//! caller's oneshot. Reconnection policy lives in the session runtime: when
//! the socket drops, this client emits `RawEvent::Disconnected` and waits for
//! the runtime to call `connect()` again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{GatewayError, Result};

use super::{
    ClientFactory, MediaDownload, OutgoingContent, RawEvent, RawMessage, RawReceipt, SendReceipt,
    WhatsAppClient,
};

/// Per-command response deadline.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Buffer for raw events flowing to the session runtime.
const EVENT_BUFFER_SIZE: usize = 256;

// ---------------------------------------------------------------------------
// Bridge frames
// ---------------------------------------------------------------------------

/// Inbound frame from the bridge.
#[derive(Debug, Deserialize)]
struct InboundFrame {
    /// Frame type: "event" or "result".
    #[serde(rename = "type")]
    kind: String,
    /// Correlation id (result frames only).
    #[serde(default)]
    id: Option<u64>,
    /// Command outcome (result frames only).
    #[serde(default)]
    ok: Option<bool>,
    /// Error message when `ok == false`.
    #[serde(default)]
    error: Option<String>,
    /// Event tag (event frames only), e.g. "Message", "AppState".
    #[serde(default)]
    tag: Option<String>,
    /// Frame payload.
    #[serde(default)]
    data: Option<Value>,
}

/// Resolved command outcome handed back through the pending map.
#[derive(Debug)]
struct CommandOutcome {
    ok: bool,
    error: Option<String>,
    data: Value,
}

type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<CommandOutcome>>>>;

/// Parses an event frame payload into a typed [`RawEvent`].
fn parse_event(tag: &str, data: Value) -> RawEvent {
    fn str_field(data: &Value, key: &str) -> String {
        data.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
    fn i64_field(data: &Value, key: &str) -> i64 {
        data.get(key).and_then(Value::as_i64).unwrap_or_default()
    }
    fn bool_field(data: &Value, key: &str) -> bool {
        data.get(key).and_then(Value::as_bool).unwrap_or_default()
    }
    fn opt_str(data: &Value, key: &str) -> Option<String> {
        data.get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    match tag {
        "Message" => match serde_json::from_value::<RawMessage>(data.clone()) {
            Ok(msg) => RawEvent::Message(msg),
            Err(e) => {
                debug!("Bridge: malformed Message payload ({}), passing through", e);
                RawEvent::Other {
                    tag: tag.to_string(),
                    data,
                }
            }
        },
        "Receipt" => match serde_json::from_value::<RawReceipt>(data.clone()) {
            Ok(receipt) => RawEvent::Receipt(receipt),
            Err(e) => {
                debug!("Bridge: malformed Receipt payload ({}), passing through", e);
                RawEvent::Other {
                    tag: tag.to_string(),
                    data,
                }
            }
        },
        "QR" => {
            let codes = data
                .get("codes")
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            RawEvent::Qr { codes }
        }
        "PairSuccess" => RawEvent::PairSuccess {
            device_jid: str_field(&data, "device_jid"),
        },
        "PairError" => RawEvent::PairError {
            message: str_field(&data, "message"),
        },
        "Connected" => RawEvent::Connected,
        "Disconnected" => RawEvent::Disconnected,
        "LoggedOut" => RawEvent::LoggedOut {
            reason: i64_field(&data, "reason"),
        },
        "Presence" => RawEvent::Presence {
            from: str_field(&data, "from"),
            unavailable: bool_field(&data, "unavailable"),
            last_seen: data.get("last_seen").and_then(Value::as_i64),
        },
        "ChatPresence" => RawEvent::ChatPresence {
            chat: str_field(&data, "chat"),
            state: str_field(&data, "state"),
            media: opt_str(&data, "media"),
        },
        "GroupInfo" => RawEvent::GroupInfo {
            jid: str_field(&data, "jid"),
            name: opt_str(&data, "name"),
            topic: opt_str(&data, "topic"),
        },
        "JoinedGroup" => RawEvent::JoinedGroup {
            jid: str_field(&data, "jid"),
            reason: str_field(&data, "reason"),
            join_type: str_field(&data, "join_type"),
        },
        "Picture" => RawEvent::Picture {
            jid: str_field(&data, "jid"),
            author: str_field(&data, "author"),
            timestamp: i64_field(&data, "timestamp"),
            remove: bool_field(&data, "remove"),
        },
        "UndecryptableMessage" => RawEvent::UndecryptableMessage {
            message_id: str_field(&data, "message_id"),
            chat: str_field(&data, "chat"),
            sender: str_field(&data, "sender"),
            timestamp: i64_field(&data, "timestamp"),
            is_unavailable: bool_field(&data, "is_unavailable"),
        },
        "KeepAliveTimeout" => RawEvent::KeepAliveTimeout,
        "KeepAliveRestored" => RawEvent::KeepAliveRestored,
        "StreamError" => RawEvent::StreamError {
            code: str_field(&data, "code"),
        },
        _ => RawEvent::Other {
            tag: tag.to_string(),
            data,
        },
    }
}

// ---------------------------------------------------------------------------
// BridgeClient
// ---------------------------------------------------------------------------

/// WebSocket client for one session's bridge connection.
pub struct BridgeClient {
    session_id: Uuid,
    url: String,
    proxy_url: Option<String>,
    connected: Arc<AtomicBool>,
    /// Outbound frame queue into the I/O task. `None` while disconnected.
    frame_tx: Mutex<Option<mpsc::Sender<String>>>,
    pending: PendingMap,
    next_id: AtomicU64,
    events_tx: mpsc::Sender<RawEvent>,
    events_rx: StdMutex<Option<mpsc::Receiver<RawEvent>>>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl BridgeClient {
    /// Creates a disconnected client for `session_id`.
    pub fn new(base_url: &str, session_id: Uuid, proxy_url: Option<&str>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        Self {
            session_id,
            url: format!("{}/session/{}", base_url.trim_end_matches('/'), session_id),
            proxy_url: proxy_url.map(str::to_string),
            connected: Arc::new(AtomicBool::new(false)),
            frame_tx: Mutex::new(None),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            events_tx,
            events_rx: StdMutex::new(Some(events_rx)),
            shutdown_tx: Mutex::new(None),
        }
    }

    /// Issues a command frame and awaits its correlated result.
    async fn request(&self, kind: &str, mut body: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, tx);

        let obj = body
            .as_object_mut()
            .ok_or_else(|| GatewayError::Internal("command body must be an object".into()))?;
        obj.insert("type".to_string(), json!(kind));
        obj.insert("id".to_string(), json!(id));
        let frame = body.to_string();

        let sent = {
            let guard = self.frame_tx.lock().await;
            match guard.as_ref() {
                Some(tx) => tx.send(frame).await.is_ok(),
                None => false,
            }
        };
        if !sent {
            self.pending
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&id);
            return Err(GatewayError::Unavailable(
                "bridge connection not established".to_string(),
            ));
        }

        let outcome = tokio::time::timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS), rx)
            .await
            .map_err(|_| {
                self.pending
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&id);
                GatewayError::DeadlineExceeded(format!("bridge command '{}'", kind))
            })?
            .map_err(|_| GatewayError::Unavailable("bridge connection lost".to_string()))?;

        if outcome.ok {
            Ok(outcome.data)
        } else {
            Err(GatewayError::Internal(format!(
                "bridge command '{}' failed: {}",
                kind,
                outcome.error.unwrap_or_else(|| "unknown".to_string())
            )))
        }
    }

    /// I/O task: pumps outbound frames and dispatches inbound frames until
    /// shutdown or socket loss.
    async fn run_io_loop(
        ws_stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        mut frame_rx: mpsc::Receiver<String>,
        events_tx: mpsc::Sender<RawEvent>,
        pending: PendingMap,
        connected: Arc<AtomicBool>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    debug!("Bridge I/O loop shutdown requested");
                    let _ = ws_writer.send(WsMessage::Close(None)).await;
                    break;
                }

                frame = frame_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if let Err(e) = ws_writer.send(WsMessage::Text(frame.into())).await {
                                warn!("Bridge: frame send failed: {}", e);
                                break;
                            }
                        }
                        None => {
                            debug!("Bridge outbound frame channel closed");
                            break;
                        }
                    }
                }

                msg = ws_reader.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(raw))) => {
                            match serde_json::from_str::<InboundFrame>(&raw) {
                                Ok(frame) => {
                                    Self::dispatch_frame(frame, &events_tx, &pending).await;
                                }
                                Err(e) => {
                                    debug!("Bridge: failed to parse frame: {}", e);
                                }
                            }
                        }
                        Some(Ok(WsMessage::Ping(payload))) => {
                            if let Err(e) = ws_writer.send(WsMessage::Pong(payload)).await {
                                warn!("Bridge: pong send failed: {}", e);
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            info!("Bridge: WebSocket closed: {:?}", frame);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Bridge: WebSocket error: {}", e);
                            break;
                        }
                        None => {
                            warn!("Bridge: WebSocket stream ended");
                            break;
                        }
                    }
                }
            }
        }

        let was_connected = connected.swap(false, Ordering::SeqCst);

        // Fail anything still waiting on a result frame.
        let waiters: Vec<_> = {
            let mut map = pending.lock().unwrap_or_else(|p| p.into_inner());
            map.drain().collect()
        };
        for (_, tx) in waiters {
            let _ = tx.send(CommandOutcome {
                ok: false,
                error: Some("connection lost".to_string()),
                data: Value::Null,
            });
        }

        // Let the runtime observe the drop and drive reconnection.
        if was_connected && !*shutdown_rx.borrow() {
            let _ = events_tx.send(RawEvent::Disconnected).await;
        }
    }

    async fn dispatch_frame(
        frame: InboundFrame,
        events_tx: &mpsc::Sender<RawEvent>,
        pending: &PendingMap,
    ) {
        match frame.kind.as_str() {
            "event" => {
                let tag = frame.tag.unwrap_or_default();
                if tag.is_empty() {
                    debug!("Bridge: event frame without tag");
                    return;
                }
                let event = parse_event(&tag, frame.data.unwrap_or(Value::Null));
                if events_tx.send(event).await.is_err() {
                    debug!("Bridge: event receiver dropped");
                }
            }
            "result" => {
                let Some(id) = frame.id else {
                    debug!("Bridge: result frame without id");
                    return;
                };
                let waiter = pending
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(CommandOutcome {
                            ok: frame.ok.unwrap_or(false),
                            error: frame.error,
                            data: frame.data.unwrap_or(Value::Null),
                        });
                    }
                    None => debug!("Bridge: result for unknown command id {}", id),
                }
            }
            other => {
                debug!("Bridge: unknown frame type '{}'", other);
            }
        }
    }
}

#[async_trait]
impl WhatsAppClient for BridgeClient {
    async fn connect(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (ws_stream, _) = connect_async(&self.url).await.map_err(|e| {
            GatewayError::Unavailable(format!("bridge connect to {} failed: {}", self.url, e))
        })?;

        let (frame_tx, frame_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        self.connected.store(true, Ordering::SeqCst);
        *self.frame_tx.lock().await = Some(frame_tx.clone());
        *self.shutdown_tx.lock().await = Some(shutdown_tx);

        tokio::spawn(Self::run_io_loop(
            ws_stream,
            frame_rx,
            self.events_tx.clone(),
            Arc::clone(&self.pending),
            Arc::clone(&self.connected),
            shutdown_rx,
        ));

        // Session-level configuration travels in-band; proxy URLs are opaque
        // to the bridge transport itself.
        if let Some(proxy) = &self.proxy_url {
            let frame = json!({"type": "configure", "proxy": proxy}).to_string();
            let _ = frame_tx.send(frame).await;
        }

        info!(
            session_id = %self.session_id,
            "Bridge WebSocket connected to {}", self.url
        );
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(true);
        }
        *self.frame_tx.lock().await = None;
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn logout(&self) -> Result<()> {
        self.request("logout", json!({})).await?;
        self.disconnect().await;
        Ok(())
    }

    async fn pair_phone(&self, phone: &str) -> Result<String> {
        let data = self.request("pair_phone", json!({"phone": phone})).await?;
        data.get("code")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| GatewayError::Internal("bridge returned no pairing code".to_string()))
    }

    async fn send(&self, to: &str, content: OutgoingContent) -> Result<SendReceipt> {
        let body = match content {
            OutgoingContent::Text { body } => json!({"to": to, "kind": "text", "body": body}),
            OutgoingContent::Media {
                kind,
                data,
                mime_type,
                caption,
                filename,
            } => json!({
                "to": to,
                "kind": kind.as_str(),
                "payload": base64::engine::general_purpose::STANDARD.encode(&data),
                "mime_type": mime_type,
                "caption": caption,
                "filename": filename,
            }),
            OutgoingContent::Location {
                latitude,
                longitude,
                name,
                address,
            } => json!({
                "to": to,
                "kind": "location",
                "latitude": latitude,
                "longitude": longitude,
                "name": name,
                "address": address,
            }),
            OutgoingContent::Contact { name, phone } => {
                json!({"to": to, "kind": "contact", "name": name, "phone": phone})
            }
            OutgoingContent::Poll {
                name,
                options,
                selectable_count,
            } => json!({
                "to": to,
                "kind": "poll",
                "name": name,
                "options": options,
                "selectable_count": selectable_count,
            }),
            OutgoingContent::PollVote {
                poll_message_id,
                options,
            } => json!({
                "to": to,
                "kind": "poll_vote",
                "poll_message_id": poll_message_id,
                "options": options,
            }),
            OutgoingContent::Reaction { message_id, emoji } => {
                json!({"to": to, "kind": "reaction", "message_id": message_id, "emoji": emoji})
            }
            OutgoingContent::Edit { message_id, body } => {
                json!({"to": to, "kind": "edit", "message_id": message_id, "body": body})
            }
            OutgoingContent::Revoke { message_id } => {
                json!({"to": to, "kind": "revoke", "message_id": message_id})
            }
        };

        let data = self.request("send", body).await?;
        Ok(SendReceipt {
            message_id: data
                .get("message_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            timestamp: data
                .get("timestamp")
                .and_then(Value::as_i64)
                .unwrap_or_else(|| chrono::Utc::now().timestamp()),
        })
    }

    async fn mark_read(&self, chat: &str, message_ids: &[String]) -> Result<()> {
        self.request(
            "mark_read",
            json!({"chat": chat, "message_ids": message_ids}),
        )
        .await?;
        Ok(())
    }

    async fn set_presence(&self, chat: Option<&str>, state: &str) -> Result<()> {
        self.request("presence", json!({"chat": chat, "state": state}))
            .await?;
        Ok(())
    }

    async fn download_media(&self, message_id: &str) -> Result<MediaDownload> {
        let data = self
            .request("download_media", json!({"message_id": message_id}))
            .await?;
        let payload = data
            .get("payload")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::Internal("bridge returned no media payload".into()))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|e| GatewayError::Internal(format!("invalid media payload: {}", e)))?;
        Ok(MediaDownload {
            data: bytes,
            mime_type: data
                .get("mime_type")
                .and_then(Value::as_str)
                .unwrap_or("application/octet-stream")
                .to_string(),
            filename: data
                .get("filename")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    fn take_events(&self) -> Option<mpsc::Receiver<RawEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Creates [`BridgeClient`]s against a configured bridge base URL.
pub struct BridgeClientFactory {
    base_url: String,
}

impl BridgeClientFactory {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
        }
    }
}

impl ClientFactory for BridgeClientFactory {
    fn create(&self, session_id: Uuid, proxy_url: Option<&str>) -> Arc<dyn WhatsAppClient> {
        Arc::new(BridgeClient::new(&self.base_url, session_id, proxy_url))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
