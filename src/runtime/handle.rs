//! Handle through which the rest of the gateway talks to one session runtime.
//!
//! Control operations travel over the command channel and are applied by the
//! runner task; the send path bypasses the channel entirely: it reads the
//! state under a read lock and issues directly to the (thread-safe) client.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use uuid::Uuid;

use crate::client::WhatsAppClient;
use crate::error::{GatewayError, Result};

use super::state::SessionState;

/// Updates produced on the QR channel returned by `connect()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QrUpdate {
    /// A fresh QR code to display.
    Code(String),
    /// Login completed; the channel closes after this.
    PairSuccess { device_jid: String },
    /// Login failed; the channel closes after this.
    Error(String),
}

/// Mutable runtime status snapshot, shared between runner and handle.
#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub state: SessionState,
    pub device_jid: Option<String>,
    /// QR codes generated since the latest connect attempt.
    pub qr_codes_seen: u32,
    /// Latest QR code, for polling reads.
    pub current_qr: Option<String>,
    pub last_error: Option<String>,
}

impl Default for RuntimeStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Disconnected,
            device_jid: None,
            qr_codes_seen: 0,
            current_qr: None,
            last_error: None,
        }
    }
}

/// Commands accepted by a session runner task.
#[derive(Debug)]
pub enum RuntimeCommand {
    /// Start (or re-join) the login flow; QR updates flow to `qr_tx`.
    Connect { qr_tx: mpsc::Sender<QrUpdate> },
    /// Request a phone-pairing code.
    PairPhone {
        phone: String,
        reply: oneshot::Sender<Result<String>>,
    },
    /// Close the connection, keep the device registered.
    Disconnect,
    /// Revoke the device and close the connection.
    Logout,
    /// Terminate the runtime (session deletion).
    Shutdown,
}

/// Cloneable handle to a running session runtime.
#[derive(Clone)]
pub struct RuntimeHandle {
    pub session_id: Uuid,
    commands: mpsc::Sender<RuntimeCommand>,
    status: Arc<RwLock<RuntimeStatus>>,
    client: Arc<RwLock<Option<Arc<dyn WhatsAppClient>>>>,
}

impl RuntimeHandle {
    pub(crate) fn new(
        session_id: Uuid,
        commands: mpsc::Sender<RuntimeCommand>,
        status: Arc<RwLock<RuntimeStatus>>,
        client: Arc<RwLock<Option<Arc<dyn WhatsAppClient>>>>,
    ) -> Self {
        Self {
            session_id,
            commands,
            status,
            client,
        }
    }

    /// Sends a control command to the runner.
    pub async fn command(&self, command: RuntimeCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| GatewayError::ChannelClosed("session runtime".to_string()))
    }

    /// Current state.
    pub async fn state(&self) -> SessionState {
        self.status.read().await.state
    }

    /// Full status snapshot.
    pub async fn status(&self) -> RuntimeStatus {
        self.status.read().await.clone()
    }

    /// The client, gated on the `connected` state. Send-path operations use
    /// this: a read lock on state, then straight to the client.
    pub async fn client_for_send(&self) -> Result<Arc<dyn WhatsAppClient>> {
        {
            let status = self.status.read().await;
            if status.state != SessionState::Connected {
                return Err(GatewayError::FailedPrecondition(format!(
                    "session {} is not connected (state: {})",
                    self.session_id, status.state
                )));
            }
        }
        self.client.read().await.clone().ok_or_else(|| {
            GatewayError::FailedPrecondition(format!(
                "session {} has no active client",
                self.session_id
            ))
        })
    }
}
