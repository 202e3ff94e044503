//! Route table and handlers.

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::chatwoot::ChatwootWebhook;
use crate::error::GatewayError;
use crate::messages::SendMessageRequest;
use crate::store::{ChatwootConfig, SessionRecord, WebhookSubscription};
use crate::webhooks::SubscriptionRegistry;

use super::{ApiResult, AppState};

/// Builds the full route table.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Sessions
        .route("/sessions", post(create_session).get(list_sessions))
        .route(
            "/sessions/{id}",
            get(get_session).delete(delete_session),
        )
        .route("/sessions/{id}/connect", post(connect_session))
        .route("/sessions/{id}/disconnect", post(disconnect_session))
        .route("/sessions/{id}/logout", post(logout_session))
        .route("/sessions/{id}/qr", get(get_qr))
        .route("/sessions/{id}/pair", post(pair_phone))
        .route("/sessions/{id}/status", get(session_status))
        .route("/sessions/{id}/proxy", get(get_proxy).put(set_proxy))
        // Messages
        .route("/sessions/{id}/messages/send", post(send_message))
        .route("/sessions/{id}/messages/edit", post(edit_message))
        .route("/sessions/{id}/messages/revoke", post(revoke_message))
        .route("/sessions/{id}/messages/read", post(mark_read))
        .route("/sessions/{id}/messages/reaction", post(send_reaction))
        .route("/sessions/{id}/messages/presence", post(send_presence))
        .route("/sessions/{id}/polls", post(create_poll))
        .route("/sessions/{id}/polls/vote", post(vote_poll))
        .route("/sessions/{id}/polls/{poll_id}/results", get(poll_results))
        .route("/sessions/{id}/media/{message_id}", get(download_media))
        // Webhook subscriptions
        .route("/webhooks", post(create_webhook).get(list_webhooks))
        .route(
            "/webhooks/{id}",
            get(get_webhook).put(update_webhook).delete(delete_webhook),
        )
        .route("/webhooks/{id}/test", post(test_webhook))
        // Chatwoot
        .route(
            "/sessions/{id}/chatwoot",
            get(get_chatwoot).put(put_chatwoot).delete(delete_chatwoot),
        )
        .route("/chatwoot/webhook/{id}", post(chatwoot_webhook))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn parse_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|_| GatewayError::InvalidArgument(format!("'{}' is not a valid id", raw)).into())
}

// ============================================================================
// DTOs
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    name: String,
    #[serde(default)]
    proxy_url: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    id: Uuid,
    name: String,
    device_jid: Option<String>,
    proxy_url: Option<String>,
    is_connected: bool,
    last_seen: Option<i64>,
    created_at: i64,
}

impl From<SessionRecord> for SessionResponse {
    fn from(record: SessionRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            device_jid: record.device_jid,
            proxy_url: record.proxy_url,
            is_connected: record.is_connected,
            last_seen: record.last_seen.map(|t| t.timestamp()),
            created_at: record.created_at.timestamp(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairRequest {
    phone: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProxyRequest {
    #[serde(default)]
    proxy_url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EditRequest {
    to: String,
    message_id: String,
    body: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevokeRequest {
    to: String,
    message_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarkReadRequest {
    chat: String,
    message_ids: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReactionRequest {
    to: String,
    message_id: String,
    #[serde(default)]
    emoji: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresenceRequest {
    #[serde(default)]
    chat: Option<String>,
    state: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PollCreateRequest {
    to: String,
    name: String,
    options: Vec<String>,
    #[serde(default = "default_selectable")]
    selectable_count: u32,
}

fn default_selectable() -> u32 {
    1
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PollVoteRequest {
    to: String,
    poll_message_id: String,
    #[serde(default)]
    options: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookRequest {
    #[serde(default)]
    session_id: Option<Uuid>,
    url: String,
    #[serde(default)]
    secret: Option<String>,
    events: Vec<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Deserialize)]
struct WebhookListQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<Uuid>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookResponse {
    id: Uuid,
    session_id: Option<Uuid>,
    url: String,
    has_secret: bool,
    events: Vec<String>,
    enabled: bool,
    stats: WebhookStatsResponse,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookStatsResponse {
    total: u64,
    success: u64,
    failure: u64,
    last_delivery: Option<i64>,
    last_success: Option<i64>,
    last_failure: Option<i64>,
    avg_latency_ms: f64,
}

impl From<WebhookSubscription> for WebhookResponse {
    fn from(sub: WebhookSubscription) -> Self {
        Self {
            id: sub.id,
            session_id: sub.session_id,
            url: sub.url,
            has_secret: sub.secret.as_deref().is_some_and(|s| !s.is_empty()),
            events: sub.events,
            enabled: sub.enabled,
            stats: WebhookStatsResponse {
                total: sub.stats.total,
                success: sub.stats.success,
                failure: sub.stats.failure,
                last_delivery: sub.stats.last_delivery.map(|t| t.timestamp()),
                last_success: sub.stats.last_success.map(|t| t.timestamp()),
                last_failure: sub.stats.last_failure.map(|t| t.timestamp()),
                avg_latency_ms: sub.stats.avg_latency_ms,
            },
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestWebhookRequest {
    event: String,
    #[serde(default)]
    data: serde_json::Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatwootConfigRequest {
    url: String,
    token: String,
    account_id: String,
    #[serde(default)]
    inbox_id: Option<i64>,
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    auto_create: bool,
    #[serde(default)]
    sign_msg: bool,
    #[serde(default = "default_delimiter")]
    sign_delimiter: String,
    #[serde(default = "default_enabled")]
    reopen_conv: bool,
    #[serde(default)]
    conv_pending: bool,
    #[serde(default)]
    import_contacts: bool,
    #[serde(default)]
    import_messages: bool,
    #[serde(default = "default_import_days")]
    import_days: i64,
    #[serde(default)]
    merge_brazil: bool,
    #[serde(default)]
    ignore_jids: Vec<String>,
}

fn default_delimiter() -> String {
    "\n".to_string()
}

fn default_import_days() -> i64 {
    60
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatwootConfigResponse {
    session_id: Uuid,
    url: String,
    account_id: String,
    inbox_id: Option<i64>,
    enabled: bool,
    auto_create: bool,
    sign_msg: bool,
    sign_delimiter: String,
    reopen_conv: bool,
    conv_pending: bool,
    import_contacts: bool,
    import_messages: bool,
    import_days: i64,
    merge_brazil: bool,
    ignore_jids: Vec<String>,
}

impl From<ChatwootConfig> for ChatwootConfigResponse {
    fn from(cfg: ChatwootConfig) -> Self {
        Self {
            session_id: cfg.session_id,
            url: cfg.url,
            account_id: cfg.account_id,
            inbox_id: cfg.inbox_id,
            enabled: cfg.enabled,
            auto_create: cfg.auto_create,
            sign_msg: cfg.sign_msg,
            sign_delimiter: cfg.sign_delimiter,
            reopen_conv: cfg.reopen_conv,
            conv_pending: cfg.conv_pending,
            import_contacts: cfg.import_contacts,
            import_messages: cfg.import_messages,
            import_days: cfg.import_days,
            merge_brazil: cfg.merge_brazil,
            ignore_jids: cfg.ignore_jids,
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

// --- Sessions ---

async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<Json<SessionResponse>> {
    let record = state
        .supervisor
        .create(&req.name, req.proxy_url.as_deref())?;
    Ok(Json(record.into()))
}

async fn list_sessions(State(state): State<AppState>) -> ApiResult<Json<Vec<SessionResponse>>> {
    let sessions = state.supervisor.list()?;
    Ok(Json(sessions.into_iter().map(Into::into).collect()))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionResponse>> {
    let id = parse_id(&id)?;
    Ok(Json(state.supervisor.get(id)?.into()))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&id)?;
    state.supervisor.delete(id).await?;
    Ok(Json(json!({"deleted": true})))
}

async fn connect_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&id)?;
    // The QR stream feeds the runtime status; poll GET /sessions/{id}/qr.
    let mut qr_rx = state.supervisor.connect(id).await?;
    tokio::spawn(async move { while qr_rx.recv().await.is_some() {} });
    let session_state = state.supervisor.state(id).await?;
    Ok(Json(json!({"state": session_state.as_str()})))
}

async fn disconnect_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&id)?;
    state.supervisor.disconnect(id).await?;
    Ok(Json(json!({"state": "disconnected"})))
}

async fn logout_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&id)?;
    state.supervisor.logout(id).await?;
    Ok(Json(json!({"state": "disconnected"})))
}

async fn get_qr(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&id)?;
    let status = state.supervisor.status(id).await?;
    Ok(Json(json!({
        "state": status.state.as_str(),
        "qr": status.current_qr,
        "codesCount": status.qr_codes_seen,
    })))
}

async fn pair_phone(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PairRequest>,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&id)?;
    let code = state.supervisor.pair_phone(id, &req.phone).await?;
    Ok(Json(json!({"pairingCode": code})))
}

async fn session_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&id)?;
    let status = state.supervisor.status(id).await?;
    Ok(Json(json!({
        "state": status.state.as_str(),
        "connected": status.state == crate::runtime::SessionState::Connected,
        "deviceJid": status.device_jid,
        "lastError": status.last_error,
    })))
}

async fn get_proxy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&id)?;
    Ok(Json(json!({"proxyUrl": state.supervisor.get_proxy(id)?})))
}

async fn set_proxy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ProxyRequest>,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&id)?;
    state
        .supervisor
        .set_proxy(id, req.proxy_url.as_deref())?;
    Ok(Json(json!({"proxyUrl": req.proxy_url})))
}

// --- Messages ---

async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<Json<crate::messages::SendResult>> {
    let id = parse_id(&id)?;
    Ok(Json(state.messages.send(id, req).await?))
}

async fn edit_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<EditRequest>,
) -> ApiResult<Json<crate::messages::SendResult>> {
    let id = parse_id(&id)?;
    Ok(Json(
        state
            .messages
            .edit(id, &req.to, &req.message_id, &req.body)
            .await?,
    ))
}

async fn revoke_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RevokeRequest>,
) -> ApiResult<Json<crate::messages::SendResult>> {
    let id = parse_id(&id)?;
    Ok(Json(
        state.messages.revoke(id, &req.to, &req.message_id).await?,
    ))
}

async fn mark_read(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<MarkReadRequest>,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&id)?;
    state
        .messages
        .mark_read(id, &req.chat, &req.message_ids)
        .await?;
    Ok(Json(json!({"read": req.message_ids.len()})))
}

async fn send_reaction(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ReactionRequest>,
) -> ApiResult<Json<crate::messages::SendResult>> {
    let id = parse_id(&id)?;
    Ok(Json(
        state
            .messages
            .react(id, &req.to, &req.message_id, &req.emoji)
            .await?,
    ))
}

async fn send_presence(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PresenceRequest>,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&id)?;
    state
        .messages
        .presence(id, req.chat.as_deref(), &req.state)
        .await?;
    Ok(Json(json!({"sent": true})))
}

async fn create_poll(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PollCreateRequest>,
) -> ApiResult<Json<crate::messages::SendResult>> {
    let id = parse_id(&id)?;
    Ok(Json(
        state
            .messages
            .poll_create(id, &req.to, &req.name, &req.options, req.selectable_count)
            .await?,
    ))
}

async fn vote_poll(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PollVoteRequest>,
) -> ApiResult<Json<crate::messages::SendResult>> {
    let id = parse_id(&id)?;
    Ok(Json(
        state
            .messages
            .poll_vote(id, &req.to, &req.poll_message_id, &req.options)
            .await?,
    ))
}

async fn poll_results(
    State(state): State<AppState>,
    Path((id, poll_id)): Path<(String, String)>,
) -> ApiResult<Json<crate::messages::PollResults>> {
    let id = parse_id(&id)?;
    Ok(Json(state.messages.poll_results(id, &poll_id).await?))
}

async fn download_media(
    State(state): State<AppState>,
    Path((id, message_id)): Path<(String, String)>,
) -> ApiResult<axum::response::Response> {
    let id = parse_id(&id)?;
    let media = state.messages.download_media(id, &message_id).await?;
    Ok((
        [(header::CONTENT_TYPE, media.mime_type)],
        media.data,
    )
        .into_response())
}

// --- Webhook subscriptions ---

async fn create_webhook(
    State(state): State<AppState>,
    Json(req): Json<WebhookRequest>,
) -> ApiResult<Json<WebhookResponse>> {
    SubscriptionRegistry::validate_events(&req.events)?;
    if let Some(session_id) = req.session_id {
        state.store.get_session(session_id)?;
    }
    let sub = state.store.create_subscription(
        req.session_id,
        req.url.trim(),
        req.secret.as_deref(),
        &req.events,
        req.enabled,
    )?;
    Ok(Json(sub.into()))
}

async fn list_webhooks(
    State(state): State<AppState>,
    Query(query): Query<WebhookListQuery>,
) -> ApiResult<Json<Vec<WebhookResponse>>> {
    let subs = state.store.list_subscriptions(query.session_id)?;
    Ok(Json(subs.into_iter().map(Into::into).collect()))
}

async fn get_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<WebhookResponse>> {
    let id = parse_id(&id)?;
    Ok(Json(state.store.get_subscription(id)?.into()))
}

async fn update_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<WebhookRequest>,
) -> ApiResult<Json<WebhookResponse>> {
    let id = parse_id(&id)?;
    SubscriptionRegistry::validate_events(&req.events)?;
    state.store.update_subscription(
        id,
        req.url.trim(),
        req.secret.as_deref(),
        &req.events,
        req.enabled,
    )?;
    Ok(Json(state.store.get_subscription(id)?.into()))
}

async fn delete_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&id)?;
    state.store.delete_subscription(id)?;
    Ok(Json(json!({"deleted": true})))
}

async fn test_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<TestWebhookRequest>,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&id)?;
    state.dispatcher.test_webhook(id, &req.event, req.data)?;
    Ok(Json(json!({"queued": true})))
}

// --- Chatwoot ---

async fn get_chatwoot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ChatwootConfigResponse>> {
    let id = parse_id(&id)?;
    let config = state
        .store
        .get_chatwoot_config(id)?
        .ok_or_else(|| GatewayError::NotFound(format!("chatwoot config for session {}", id)))?;
    Ok(Json(config.into()))
}

async fn put_chatwoot(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ChatwootConfigRequest>,
) -> ApiResult<Json<ChatwootConfigResponse>> {
    let id = parse_id(&id)?;
    state.store.get_session(id)?;
    if req.url.trim().is_empty() || req.token.trim().is_empty() {
        return Err(GatewayError::InvalidArgument(
            "'url' and 'token' are required".to_string(),
        )
        .into());
    }

    let mut config = ChatwootConfig::new(id, req.url.trim(), req.token.trim(), &req.account_id);
    config.inbox_id = req.inbox_id;
    config.enabled = req.enabled;
    config.auto_create = req.auto_create;
    config.sign_msg = req.sign_msg;
    config.sign_delimiter = req.sign_delimiter;
    config.reopen_conv = req.reopen_conv;
    config.conv_pending = req.conv_pending;
    config.import_contacts = req.import_contacts;
    config.import_messages = req.import_messages;
    config.import_days = req.import_days;
    config.merge_brazil = req.merge_brazil;
    config.ignore_jids = req.ignore_jids;

    state.store.put_chatwoot_config(&config)?;
    Ok(Json(config.into()))
}

async fn delete_chatwoot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&id)?;
    state.store.delete_chatwoot_config(id)?;
    Ok(Json(json!({"deleted": true})))
}

/// Inbound Chatwoot webhook. Always answers 200 for handled drops so
/// Chatwoot does not retry; real errors surface as their mapped status.
async fn chatwoot_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<ChatwootWebhook>,
) -> ApiResult<Json<Value>> {
    let id = parse_id(&id)?;
    let outcome = state.outbound.process(id, payload).await?;
    let body = match outcome {
        crate::chatwoot::OutboundOutcome::Sent { message_id } => {
            json!({"status": "sent", "messageId": message_id})
        }
        crate::chatwoot::OutboundOutcome::Dropped(reason) => {
            json!({"status": "ignored", "reason": reason})
        }
    };
    Ok(Json(body))
}
