//! HTTP API boundary.
//!
//! Thin request→use-case→response adapters over axum. Handlers validate
//! nothing beyond shape: domain validation lives in the use-cases, and every
//! error kind maps to its HTTP status via [`GatewayError::http_status`].
//! Error bodies are `{"error": <message>, "code": <kind>}`; no stack traces
//! cross this boundary.

mod routes;

pub use routes::router;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::info;

use crate::chatwoot::OutboundHandler;
use crate::error::{GatewayError, Result};
use crate::messages::MessageService;
use crate::runtime::SessionSupervisor;
use crate::store::Store;
use crate::webhooks::WebhookDispatcher;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub supervisor: Arc<SessionSupervisor>,
    pub messages: Arc<MessageService>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub outbound: Arc<OutboundHandler>,
}

/// Error wrapper implementing axum's response conversion.
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({
            "error": self.0.to_string(),
            "code": self.0.code(),
        });
        (status, Json(body)).into_response()
    }
}

/// Handler result alias.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Binds and serves the API until the shutdown future resolves.
pub async fn serve(
    state: AppState,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::Config(format!("failed to bind {}: {}", addr, e)))?;
    info!("HTTP API listening on {}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| GatewayError::Internal(format!("server error: {}", e)))
}
