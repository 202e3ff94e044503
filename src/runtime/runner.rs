//! Per-session runner task.
//!
//! Each session runtime is one task owning one client. The task serially
//! drains the client's event stream (preserving per-session ordering into the
//! pipeline), applies control commands, and drives reconnection with
//! exponential backoff (1 s doubling to a 60 s ceiling, indefinitely, until
//! logout or deletion).

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{ClientFactory, RawEvent, WhatsAppClient};
use crate::events::EventPipeline;
use crate::store::Store;

use super::handle::{QrUpdate, RuntimeCommand, RuntimeStatus};
use super::state::SessionState;

/// First reconnect delay after an unsolicited disconnect.
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Reconnect delay ceiling.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

pub(crate) struct SessionRunner {
    session_id: Uuid,
    store: Store,
    factory: Arc<dyn ClientFactory>,
    pipeline: Arc<EventPipeline>,
    status: Arc<RwLock<RuntimeStatus>>,
    client_slot: Arc<RwLock<Option<Arc<dyn WhatsAppClient>>>>,
    commands: mpsc::Receiver<RuntimeCommand>,
    qr_tx: Option<mpsc::Sender<QrUpdate>>,
}

impl SessionRunner {
    pub(crate) fn new(
        session_id: Uuid,
        store: Store,
        factory: Arc<dyn ClientFactory>,
        pipeline: Arc<EventPipeline>,
        status: Arc<RwLock<RuntimeStatus>>,
        client_slot: Arc<RwLock<Option<Arc<dyn WhatsAppClient>>>>,
        commands: mpsc::Receiver<RuntimeCommand>,
    ) -> Self {
        Self {
            session_id,
            store,
            factory,
            pipeline,
            status,
            client_slot,
            commands,
            qr_tx: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut events: Option<mpsc::Receiver<RawEvent>> = None;
        let mut backoff = INITIAL_RECONNECT_DELAY;
        let mut reconnect_at: Option<Instant> = None;

        info!(session_id = %self.session_id, "session runtime started");

        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(cmd) => {
                            let stop = self
                                .handle_command(cmd, &mut events, &mut backoff, &mut reconnect_at)
                                .await;
                            if stop {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                raw = Self::recv_event(&mut events) => {
                    match raw {
                        Some(raw) => {
                            self.handle_event(raw, &mut events, &mut backoff, &mut reconnect_at)
                                .await;
                        }
                        None => {
                            debug!(session_id = %self.session_id, "client event stream ended");
                            events = None;
                        }
                    }
                }

                _ = tokio::time::sleep_until(reconnect_at.unwrap_or_else(Instant::now)),
                    if reconnect_at.is_some() =>
                {
                    self.attempt_reconnect(&mut backoff, &mut reconnect_at).await;
                }
            }
        }

        // Terminated: release the device and stop.
        if let Some(client) = self.client_slot.write().await.take() {
            client.disconnect().await;
        }
        self.set_state(SessionState::Terminated).await;
        info!(session_id = %self.session_id, "session runtime terminated");
    }

    /// Receives from the client stream; pends forever while no client is
    /// attached so the select loop is not spun by an empty slot.
    async fn recv_event(events: &mut Option<mpsc::Receiver<RawEvent>>) -> Option<RawEvent> {
        match events.as_mut() {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    async fn state(&self) -> SessionState {
        self.status.read().await.state
    }

    async fn set_state(&self, state: SessionState) {
        let mut status = self.status.write().await;
        if status.state != state {
            debug!(
                session_id = %self.session_id,
                from = %status.state,
                to = %state,
                "session state transition"
            );
            status.state = state;
        }
    }

    async fn push_qr(&mut self, update: QrUpdate) {
        if let Some(tx) = &self.qr_tx {
            if tx.send(update).await.is_err() {
                // Subscriber went away; keep pairing, drop the channel.
                self.qr_tx = None;
            }
        }
    }

    /// Applies one control command. Returns `true` to terminate the runtime.
    async fn handle_command(
        &mut self,
        command: RuntimeCommand,
        events: &mut Option<mpsc::Receiver<RawEvent>>,
        backoff: &mut Duration,
        reconnect_at: &mut Option<Instant>,
    ) -> bool {
        match command {
            RuntimeCommand::Connect { qr_tx } => {
                self.handle_connect(qr_tx, events).await;
                false
            }

            RuntimeCommand::PairPhone { phone, reply } => {
                let state = self.state().await;
                if !state.accepts_pairing() {
                    let _ = reply.send(Err(crate::error::GatewayError::FailedPrecondition(
                        format!("pairing requires connecting/qr state, session is {}", state),
                    )));
                    return false;
                }
                let client = self.client_slot.read().await.clone();
                match client {
                    Some(client) => {
                        let result = client.pair_phone(&phone).await;
                        if result.is_ok() {
                            self.set_state(SessionState::Pairing).await;
                        }
                        let _ = reply.send(result);
                    }
                    None => {
                        let _ = reply.send(Err(crate::error::GatewayError::FailedPrecondition(
                            "no active client".to_string(),
                        )));
                    }
                }
                false
            }

            RuntimeCommand::Disconnect => {
                *reconnect_at = None;
                *backoff = INITIAL_RECONNECT_DELAY;
                if let Some(client) = self.client_slot.write().await.take() {
                    client.disconnect().await;
                }
                *events = None;
                self.qr_tx = None;
                self.set_state(SessionState::Disconnected).await;
                if let Err(e) = self.store.set_session_connected(self.session_id, false) {
                    warn!("failed to persist disconnect: {}", e);
                }
                false
            }

            RuntimeCommand::Logout => {
                *reconnect_at = None;
                *backoff = INITIAL_RECONNECT_DELAY;
                if let Some(client) = self.client_slot.write().await.take() {
                    if let Err(e) = client.logout().await {
                        warn!(session_id = %self.session_id, "logout request failed: {}", e);
                    }
                }
                *events = None;
                self.qr_tx = None;
                {
                    let mut status = self.status.write().await;
                    status.device_jid = None;
                }
                self.set_state(SessionState::Disconnected).await;
                if let Err(e) = self.store.set_session_device_jid(self.session_id, None) {
                    warn!("failed to clear device JID: {}", e);
                }
                if let Err(e) = self.store.set_session_connected(self.session_id, false) {
                    warn!("failed to persist logout: {}", e);
                }
                false
            }

            RuntimeCommand::Shutdown => true,
        }
    }

    async fn handle_connect(
        &mut self,
        qr_tx: mpsc::Sender<QrUpdate>,
        events: &mut Option<mpsc::Receiver<RawEvent>>,
    ) {
        match self.state().await {
            // Idempotent: already connected resolves immediately.
            SessionState::Connected => {
                let device_jid = self
                    .status
                    .read()
                    .await
                    .device_jid
                    .clone()
                    .unwrap_or_default();
                let _ = qr_tx.send(QrUpdate::PairSuccess { device_jid }).await;
            }

            // A login flow is already in progress: the new subscriber joins it.
            SessionState::Connecting
            | SessionState::Qr
            | SessionState::Pairing
            | SessionState::Reconnecting => {
                self.qr_tx = Some(qr_tx);
            }

            SessionState::Disconnected => {
                self.qr_tx = Some(qr_tx);
                {
                    let mut status = self.status.write().await;
                    status.qr_codes_seen = 0;
                    status.current_qr = None;
                    status.last_error = None;
                }

                let record = match self.store.get_session(self.session_id) {
                    Ok(record) => record,
                    Err(e) => {
                        self.push_qr(QrUpdate::Error(e.to_string())).await;
                        self.qr_tx = None;
                        return;
                    }
                };

                let client = self
                    .factory
                    .create(self.session_id, record.proxy_url.as_deref());
                if let Some(rx) = client.take_events() {
                    *events = Some(rx);
                }
                *self.client_slot.write().await = Some(Arc::clone(&client));
                self.set_state(SessionState::Connecting).await;

                if let Err(e) = client.connect().await {
                    warn!(session_id = %self.session_id, "connect failed: {}", e);
                    {
                        let mut status = self.status.write().await;
                        status.last_error = Some(e.to_string());
                    }
                    self.set_state(SessionState::Disconnected).await;
                    self.push_qr(QrUpdate::Error(e.to_string())).await;
                    self.qr_tx = None;
                    *self.client_slot.write().await = None;
                    *events = None;
                }
            }

            SessionState::Terminated => {
                let _ = qr_tx
                    .send(QrUpdate::Error("session terminated".to_string()))
                    .await;
            }
        }
    }

    /// Applies one raw client event: pipeline first (serial, in arrival
    /// order), then the state machine side effects.
    async fn handle_event(
        &mut self,
        raw: RawEvent,
        events: &mut Option<mpsc::Receiver<RawEvent>>,
        backoff: &mut Duration,
        reconnect_at: &mut Option<Instant>,
    ) {
        self.pipeline.process(self.session_id, &raw).await;

        match raw {
            RawEvent::Qr { codes } => {
                if matches!(
                    self.state().await,
                    SessionState::Connecting | SessionState::Qr
                ) {
                    self.set_state(SessionState::Qr).await;
                }
                {
                    let mut status = self.status.write().await;
                    status.qr_codes_seen += codes.len() as u32;
                    status.current_qr = codes.last().cloned();
                }
                for code in codes {
                    self.push_qr(QrUpdate::Code(code)).await;
                }
            }

            RawEvent::PairSuccess { device_jid } => {
                {
                    let mut status = self.status.write().await;
                    status.device_jid = Some(device_jid.clone());
                    status.current_qr = None;
                }
                self.set_state(SessionState::Connected).await;
                if let Err(e) = self
                    .store
                    .set_session_device_jid(self.session_id, Some(&device_jid))
                {
                    warn!("failed to persist device JID: {}", e);
                }
                if let Err(e) = self.store.set_session_connected(self.session_id, true) {
                    warn!("failed to persist connect: {}", e);
                }
                *backoff = INITIAL_RECONNECT_DELAY;
                *reconnect_at = None;
                self.push_qr(QrUpdate::PairSuccess { device_jid }).await;
                self.qr_tx = None;
            }

            RawEvent::PairError { message } => {
                {
                    let mut status = self.status.write().await;
                    status.last_error = Some(message.clone());
                }
                self.set_state(SessionState::Disconnected).await;
                self.push_qr(QrUpdate::Error(message)).await;
                self.qr_tx = None;
            }

            RawEvent::Connected => {
                self.set_state(SessionState::Connected).await;
                if let Err(e) = self.store.set_session_connected(self.session_id, true) {
                    warn!("failed to persist connect: {}", e);
                }
                *backoff = INITIAL_RECONNECT_DELAY;
                *reconnect_at = None;
            }

            RawEvent::Disconnected | RawEvent::StreamError { .. } => {
                match self.state().await {
                    SessionState::Connected => {
                        self.set_state(SessionState::Reconnecting).await;
                        if let Err(e) = self.store.set_session_connected(self.session_id, false)
                        {
                            warn!("failed to persist disconnect: {}", e);
                        }
                        *reconnect_at = Some(Instant::now() + *backoff);
                        info!(
                            session_id = %self.session_id,
                            "connection lost, reconnecting in {:?}", backoff
                        );
                    }
                    SessionState::Reconnecting => {
                        // Re-login failed after the socket came back.
                        *backoff = (*backoff * 2).min(MAX_RECONNECT_DELAY);
                        *reconnect_at = Some(Instant::now() + *backoff);
                    }
                    _ => {}
                }
            }

            RawEvent::LoggedOut { .. } => {
                *reconnect_at = None;
                *backoff = INITIAL_RECONNECT_DELAY;
                {
                    let mut status = self.status.write().await;
                    status.device_jid = None;
                }
                self.set_state(SessionState::Disconnected).await;
                if let Some(client) = self.client_slot.write().await.take() {
                    client.disconnect().await;
                }
                *events = None;
                if let Err(e) = self.store.set_session_device_jid(self.session_id, None) {
                    warn!("failed to clear device JID: {}", e);
                }
                if let Err(e) = self.store.set_session_connected(self.session_id, false) {
                    warn!("failed to persist logout: {}", e);
                }
            }

            _ => {}
        }
    }

    async fn attempt_reconnect(&mut self, backoff: &mut Duration, reconnect_at: &mut Option<Instant>) {
        let client = self.client_slot.read().await.clone();
        let Some(client) = client else {
            *reconnect_at = None;
            return;
        };

        match client.connect().await {
            Ok(()) => {
                // Socket is back; the Connected event finishes the transition.
                *reconnect_at = None;
            }
            Err(e) => {
                *backoff = (*backoff * 2).min(MAX_RECONNECT_DELAY);
                *reconnect_at = Some(Instant::now() + *backoff);
                warn!(
                    session_id = %self.session_id,
                    "reconnect attempt failed ({}), next try in {:?}", e, backoff
                );
            }
        }
    }
}
