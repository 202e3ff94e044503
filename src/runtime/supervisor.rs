//! Session supervisor: the one component that knows every runtime.
//!
//! Owns a map from session id to runtime handle (command channel + shared
//! status + task join handle). All cross-session operations go through here;
//! per-session operations take the map lock only long enough to clone a
//! handle, never across an await on session work.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::client::{ClientFactory, OutgoingContent, SendReceipt, WhatsAppClient};
use crate::error::{GatewayError, Result};
use crate::events::EventPipeline;
use crate::store::{SessionRecord, Store};

use super::handle::{QrUpdate, RuntimeCommand, RuntimeHandle, RuntimeStatus};
use super::runner::SessionRunner;
use super::state::SessionState;

/// Capacity of each runtime's command channel.
const COMMAND_BUFFER_SIZE: usize = 16;
/// Capacity of a QR subscription channel.
const QR_BUFFER_SIZE: usize = 8;

struct RuntimeEntry {
    handle: RuntimeHandle,
    task: JoinHandle<()>,
}

/// Supervisor over all session runtimes.
pub struct SessionSupervisor {
    store: Store,
    factory: Arc<dyn ClientFactory>,
    pipeline: Arc<EventPipeline>,
    runtimes: RwLock<HashMap<Uuid, RuntimeEntry>>,
}

impl SessionSupervisor {
    pub fn new(
        store: Store,
        factory: Arc<dyn ClientFactory>,
        pipeline: Arc<EventPipeline>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            factory,
            pipeline,
            runtimes: RwLock::new(HashMap::new()),
        })
    }

    // ------------------------------------------------------------------
    // Session CRUD
    // ------------------------------------------------------------------

    /// Creates a session record. Does not connect.
    pub fn create(&self, name: &str, proxy_url: Option<&str>) -> Result<SessionRecord> {
        let name = name.trim();
        if name.is_empty() {
            return Err(GatewayError::InvalidArgument(
                "session name must not be empty".to_string(),
            ));
        }
        self.store.create_session(name, proxy_url)
    }

    pub fn get(&self, id: Uuid) -> Result<SessionRecord> {
        self.store.get_session(id)
    }

    pub fn list(&self) -> Result<Vec<SessionRecord>> {
        self.store.list_sessions()
    }

    /// Stops the runtime (if any) and deletes the session. Idempotent on the
    /// runtime side; the row deletion reports `NotFound` for unknown ids.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let entry = self.runtimes.write().await.remove(&id);
        if let Some(entry) = entry {
            let _ = entry.handle.command(RuntimeCommand::Shutdown).await;
            // One event boundary: the runner drains its current select arm.
            if tokio::time::timeout(std::time::Duration::from_secs(5), entry.task)
                .await
                .is_err()
            {
                warn!(session_id = %id, "session runtime did not stop in time");
            }
        }
        self.store.delete_session(id)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Starts (or re-joins) the login flow. Returns the QR channel: up to a
    /// handful of code updates followed by a pair-success or error sentinel.
    pub async fn connect(&self, id: Uuid) -> Result<mpsc::Receiver<QrUpdate>> {
        // Existence check up front so unknown ids fail fast.
        self.store.get_session(id)?;
        let handle = self.ensure_runtime(id).await;
        let (qr_tx, qr_rx) = mpsc::channel(QR_BUFFER_SIZE);
        handle.command(RuntimeCommand::Connect { qr_tx }).await?;
        Ok(qr_rx)
    }

    /// Requests a phone-pairing code. Only valid while connecting/qr.
    pub async fn pair_phone(&self, id: Uuid, phone: &str) -> Result<String> {
        let phone = phone.trim();
        if phone.is_empty() {
            return Err(GatewayError::InvalidArgument(
                "phone must not be empty".to_string(),
            ));
        }
        let handle = self.handle(id).await.ok_or_else(|| {
            GatewayError::FailedPrecondition(format!("session {} is not connecting", id))
        })?;
        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .command(RuntimeCommand::PairPhone {
                phone: phone.to_string(),
                reply: reply_tx,
            })
            .await?;
        reply_rx
            .await
            .map_err(|_| GatewayError::ChannelClosed("pairing reply".to_string()))?
    }

    /// Closes the connection, keeping the device registered. Idempotent.
    pub async fn disconnect(&self, id: Uuid) -> Result<()> {
        self.store.get_session(id)?;
        if let Some(handle) = self.handle(id).await {
            handle.command(RuntimeCommand::Disconnect).await?;
        }
        Ok(())
    }

    /// Revokes the device registration. Idempotent.
    pub async fn logout(&self, id: Uuid) -> Result<()> {
        self.store.get_session(id)?;
        if let Some(handle) = self.handle(id).await {
            handle.command(RuntimeCommand::Logout).await?;
        } else {
            // No runtime: clear the persisted pairing directly.
            self.store.set_session_device_jid(id, None)?;
            self.store.set_session_connected(id, false)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Live state, `disconnected` when no runtime exists.
    pub async fn state(&self, id: Uuid) -> Result<SessionState> {
        self.store.get_session(id)?;
        match self.handle(id).await {
            Some(handle) => Ok(handle.state().await),
            None => Ok(SessionState::Disconnected),
        }
    }

    pub async fn is_connected(&self, id: Uuid) -> Result<bool> {
        Ok(self.state(id).await? == SessionState::Connected)
    }

    /// Runtime status snapshot (state, device, QR info).
    pub async fn status(&self, id: Uuid) -> Result<RuntimeStatus> {
        self.store.get_session(id)?;
        match self.handle(id).await {
            Some(handle) => Ok(handle.status().await),
            None => {
                let record = self.store.get_session(id)?;
                Ok(RuntimeStatus {
                    device_jid: record.device_jid,
                    ..Default::default()
                })
            }
        }
    }

    pub fn get_proxy(&self, id: Uuid) -> Result<Option<String>> {
        Ok(self.store.get_session(id)?.proxy_url)
    }

    /// Applies on the next connect; the running client keeps its binding.
    pub fn set_proxy(&self, id: Uuid, proxy_url: Option<&str>) -> Result<()> {
        self.store.set_session_proxy(id, proxy_url)
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// The session's client, for send-path operations. Fails with
    /// `FailedPrecondition` unless the session is connected.
    pub async fn client_for(&self, id: Uuid) -> Result<Arc<dyn WhatsAppClient>> {
        self.store.get_session(id)?;
        let handle = self.handle(id).await.ok_or_else(|| {
            GatewayError::FailedPrecondition(format!("session {} is not connected", id))
        })?;
        handle.client_for_send().await
    }

    /// Convenience used by the Chatwoot outbound path.
    pub async fn send_text(&self, id: Uuid, to_jid: &str, body: &str) -> Result<SendReceipt> {
        let client = self.client_for(id).await?;
        client
            .send(
                to_jid,
                OutgoingContent::Text {
                    body: body.to_string(),
                },
            )
            .await
    }

    /// Stops every runtime. Used on process shutdown.
    pub async fn shutdown_all(&self) {
        let entries: Vec<RuntimeEntry> = {
            let mut runtimes = self.runtimes.write().await;
            runtimes.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            let _ = entry.handle.command(RuntimeCommand::Shutdown).await;
            let _ =
                tokio::time::timeout(std::time::Duration::from_secs(5), entry.task).await;
        }
        info!("all session runtimes stopped");
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn handle(&self, id: Uuid) -> Option<RuntimeHandle> {
        self.runtimes.read().await.get(&id).map(|e| e.handle.clone())
    }

    /// Returns the runtime handle for a session, spawning the runner task if
    /// none is alive.
    async fn ensure_runtime(&self, id: Uuid) -> RuntimeHandle {
        let mut runtimes = self.runtimes.write().await;
        if let Some(entry) = runtimes.get(&id) {
            if !entry.task.is_finished() {
                return entry.handle.clone();
            }
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let status = Arc::new(RwLock::new(RuntimeStatus::default()));
        let client_slot = Arc::new(RwLock::new(None));

        let runner = SessionRunner::new(
            id,
            self.store.clone(),
            Arc::clone(&self.factory),
            Arc::clone(&self.pipeline),
            Arc::clone(&status),
            Arc::clone(&client_slot),
            cmd_rx,
        );
        let task = tokio::spawn(runner.run());

        let handle = RuntimeHandle::new(id, cmd_tx, status, client_slot);
        runtimes.insert(
            id,
            RuntimeEntry {
                handle: handle.clone(),
                task,
            },
        );
        handle
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MediaDownload, RawEvent, RawMessage};
    use crate::events::{EventPublisher, EventSink};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Scriptable in-memory client.
    struct MockClient {
        events_tx: mpsc::Sender<RawEvent>,
        events_rx: StdMutex<Option<mpsc::Receiver<RawEvent>>>,
        connects: AtomicUsize,
        fail_first_connects: usize,
        sent: StdMutex<Vec<(String, String)>>,
    }

    impl MockClient {
        fn new(fail_first_connects: usize) -> Arc<Self> {
            let (tx, rx) = mpsc::channel(64);
            Arc::new(Self {
                events_tx: tx,
                events_rx: StdMutex::new(Some(rx)),
                connects: AtomicUsize::new(0),
                fail_first_connects,
                sent: StdMutex::new(Vec::new()),
            })
        }

        async fn push(&self, event: RawEvent) {
            self.events_tx.send(event).await.unwrap();
        }

        fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WhatsAppClient for MockClient {
        async fn connect(&self) -> Result<()> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first_connects {
                return Err(GatewayError::Unavailable("mock connect failure".into()));
            }
            Ok(())
        }

        async fn disconnect(&self) {}

        async fn logout(&self) -> Result<()> {
            Ok(())
        }

        async fn pair_phone(&self, _phone: &str) -> Result<String> {
            Ok("ABCD-1234".to_string())
        }

        async fn send(&self, to: &str, content: OutgoingContent) -> Result<SendReceipt> {
            let body = match content {
                OutgoingContent::Text { body } => body,
                other => format!("{:?}", other),
            };
            self.sent.lock().unwrap().push((to.to_string(), body));
            Ok(SendReceipt {
                message_id: "WAMID.MOCK".to_string(),
                timestamp: 1707900000,
            })
        }

        async fn mark_read(&self, _chat: &str, _ids: &[String]) -> Result<()> {
            Ok(())
        }

        async fn set_presence(&self, _chat: Option<&str>, _state: &str) -> Result<()> {
            Ok(())
        }

        async fn download_media(&self, _message_id: &str) -> Result<MediaDownload> {
            Ok(MediaDownload {
                data: vec![1, 2, 3],
                mime_type: "image/jpeg".to_string(),
                filename: None,
            })
        }

        fn take_events(&self) -> Option<mpsc::Receiver<RawEvent>> {
            self.events_rx.lock().unwrap().take()
        }
    }

    struct MockFactory {
        fail_first_connects: usize,
        created: StdMutex<HashMap<Uuid, Arc<MockClient>>>,
    }

    impl MockFactory {
        fn new() -> Arc<Self> {
            Self::failing(0)
        }

        fn failing(fail_first_connects: usize) -> Arc<Self> {
            Arc::new(Self {
                fail_first_connects,
                created: StdMutex::new(HashMap::new()),
            })
        }

        fn client(&self, id: Uuid) -> Arc<MockClient> {
            self.created.lock().unwrap().get(&id).unwrap().clone()
        }
    }

    impl ClientFactory for MockFactory {
        fn create(&self, session_id: Uuid, _proxy_url: Option<&str>) -> Arc<dyn WhatsAppClient> {
            let client = MockClient::new(self.fail_first_connects);
            self.created
                .lock()
                .unwrap()
                .insert(session_id, Arc::clone(&client));
            client
        }
    }

    /// Sink recording event types in arrival order.
    struct OrderSink {
        seen: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl EventSink for OrderSink {
        fn name(&self) -> &str {
            "order"
        }

        async fn deliver(&self, event: &crate::events::Event) {
            self.seen
                .lock()
                .unwrap()
                .push(event.event_type.as_str().to_string());
        }
    }

    async fn setup(
        factory: Arc<MockFactory>,
    ) -> (Arc<SessionSupervisor>, Store, Arc<OrderSink>) {
        let store = Store::open_in_memory().unwrap();
        let publisher = Arc::new(EventPublisher::new());
        let sink = Arc::new(OrderSink {
            seen: StdMutex::new(Vec::new()),
        });
        publisher.register(sink.clone()).await;
        let pipeline = Arc::new(EventPipeline::new(publisher));
        let supervisor = SessionSupervisor::new(store.clone(), factory, pipeline);
        (supervisor, store, sink)
    }

    async fn recv_qr(rx: &mut mpsc::Receiver<QrUpdate>) -> QrUpdate {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("qr update within deadline")
            .expect("qr channel open")
    }

    async fn wait_for_state(
        supervisor: &SessionSupervisor,
        id: Uuid,
        want: SessionState,
    ) -> bool {
        for _ in 0..100 {
            if supervisor.state(id).await.unwrap() == want {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_create_does_not_connect() {
        let factory = MockFactory::new();
        let (supervisor, store, _) = setup(factory.clone()).await;
        let session = supervisor.create("alice", None).unwrap();

        assert_eq!(
            supervisor.state(session.id).await.unwrap(),
            SessionState::Disconnected
        );
        assert!(!store.get_session(session.id).unwrap().is_connected);
        assert!(factory.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_qr_pairing_flow() {
        let factory = MockFactory::new();
        let (supervisor, store, _) = setup(factory.clone()).await;
        let session = supervisor.create("alice", None).unwrap();

        let mut qr_rx = supervisor.connect(session.id).await.unwrap();
        assert!(wait_for_state(&supervisor, session.id, SessionState::Connecting).await);

        let client = factory.client(session.id);
        client
            .push(RawEvent::Qr {
                codes: vec!["2@code1".to_string()],
            })
            .await;
        assert_eq!(recv_qr(&mut qr_rx).await, QrUpdate::Code("2@code1".to_string()));
        assert!(wait_for_state(&supervisor, session.id, SessionState::Qr).await);

        client
            .push(RawEvent::PairSuccess {
                device_jid: "5511999999999:12@s.whatsapp.net".to_string(),
            })
            .await;
        assert_eq!(
            recv_qr(&mut qr_rx).await,
            QrUpdate::PairSuccess {
                device_jid: "5511999999999:12@s.whatsapp.net".to_string()
            }
        );
        assert!(wait_for_state(&supervisor, session.id, SessionState::Connected).await);

        let record = store.get_session(session.id).unwrap();
        assert!(record.is_connected);
        assert_eq!(
            record.device_jid.as_deref(),
            Some("5511999999999:12@s.whatsapp.net")
        );
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let factory = MockFactory::new();
        let (supervisor, _, _) = setup(factory.clone()).await;
        let session = supervisor.create("alice", None).unwrap();

        let _qr1 = supervisor.connect(session.id).await.unwrap();
        assert!(wait_for_state(&supervisor, session.id, SessionState::Connecting).await);
        let client = factory.client(session.id);
        client
            .push(RawEvent::PairSuccess {
                device_jid: "AA:BB".to_string(),
            })
            .await;
        assert!(wait_for_state(&supervisor, session.id, SessionState::Connected).await);

        // Second connect resolves immediately with the pair sentinel and
        // creates no second client.
        let mut qr2 = supervisor.connect(session.id).await.unwrap();
        assert_eq!(
            recv_qr(&mut qr2).await,
            QrUpdate::PairSuccess {
                device_jid: "AA:BB".to_string()
            }
        );
        assert_eq!(client.connect_count(), 1);
        assert_eq!(factory.created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_unknown_session() {
        let (supervisor, _, _) = setup(MockFactory::new()).await;
        let err = supervisor.connect(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_pair_phone_requires_login_flow() {
        let factory = MockFactory::new();
        let (supervisor, _, _) = setup(factory.clone()).await;
        let session = supervisor.create("alice", None).unwrap();

        // Not connecting yet.
        let err = supervisor
            .pair_phone(session.id, "+5511999999999")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::FailedPrecondition(_)));

        let _qr = supervisor.connect(session.id).await.unwrap();
        assert!(wait_for_state(&supervisor, session.id, SessionState::Connecting).await);
        let code = supervisor
            .pair_phone(session.id, "+5511999999999")
            .await
            .unwrap();
        assert_eq!(code, "ABCD-1234");
        assert!(wait_for_state(&supervisor, session.id, SessionState::Pairing).await);
    }

    #[tokio::test]
    async fn test_send_requires_connected() {
        let factory = MockFactory::new();
        let (supervisor, _, _) = setup(factory.clone()).await;
        let session = supervisor.create("alice", None).unwrap();

        let err = supervisor
            .send_text(session.id, "x@s.whatsapp.net", "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::FailedPrecondition(_)));

        let _qr = supervisor.connect(session.id).await.unwrap();
        assert!(wait_for_state(&supervisor, session.id, SessionState::Connecting).await);
        factory
            .client(session.id)
            .push(RawEvent::PairSuccess {
                device_jid: "AA:BB".to_string(),
            })
            .await;
        assert!(wait_for_state(&supervisor, session.id, SessionState::Connected).await);

        let receipt = supervisor
            .send_text(session.id, "x@s.whatsapp.net", "hi")
            .await
            .unwrap();
        assert_eq!(receipt.message_id, "WAMID.MOCK");
        assert_eq!(
            factory.client(session.id).sent.lock().unwrap()[0],
            ("x@s.whatsapp.net".to_string(), "hi".to_string())
        );
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect_lifecycle() {
        let factory = MockFactory::new();
        let (supervisor, store, _) = setup(factory.clone()).await;
        let session = supervisor.create("alice", None).unwrap();

        let _qr = supervisor.connect(session.id).await.unwrap();
        assert!(wait_for_state(&supervisor, session.id, SessionState::Connecting).await);
        factory
            .client(session.id)
            .push(RawEvent::PairSuccess {
                device_jid: "AA:BB".to_string(),
            })
            .await;
        assert!(wait_for_state(&supervisor, session.id, SessionState::Connected).await);

        supervisor.disconnect(session.id).await.unwrap();
        assert!(wait_for_state(&supervisor, session.id, SessionState::Disconnected).await);
        assert!(!store.get_session(session.id).unwrap().is_connected);
        // Device stays registered across a plain disconnect.
        assert!(store.get_session(session.id).unwrap().device_jid.is_some());

        // Disconnect again: idempotent.
        supervisor.disconnect(session.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_unsolicited_disconnect_triggers_reconnect() {
        let factory = MockFactory::new();
        let (supervisor, _, _) = setup(factory.clone()).await;
        let session = supervisor.create("alice", None).unwrap();

        let _qr = supervisor.connect(session.id).await.unwrap();
        assert!(wait_for_state(&supervisor, session.id, SessionState::Connecting).await);
        let client = factory.client(session.id);
        client
            .push(RawEvent::PairSuccess {
                device_jid: "AA:BB".to_string(),
            })
            .await;
        assert!(wait_for_state(&supervisor, session.id, SessionState::Connected).await);
        assert_eq!(client.connect_count(), 1);

        client.push(RawEvent::Disconnected).await;
        assert!(wait_for_state(&supervisor, session.id, SessionState::Reconnecting).await);

        // The 1 s backoff elapses and the runner redials the same client.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(client.connect_count() >= 2);

        // The bridge restores the WhatsApp session.
        client.push(RawEvent::Connected).await;
        assert!(wait_for_state(&supervisor, session.id, SessionState::Connected).await);
    }

    #[tokio::test]
    async fn test_logout_clears_device() {
        let factory = MockFactory::new();
        let (supervisor, store, _) = setup(factory.clone()).await;
        let session = supervisor.create("alice", None).unwrap();

        let _qr = supervisor.connect(session.id).await.unwrap();
        assert!(wait_for_state(&supervisor, session.id, SessionState::Connecting).await);
        factory
            .client(session.id)
            .push(RawEvent::PairSuccess {
                device_jid: "AA:BB".to_string(),
            })
            .await;
        assert!(wait_for_state(&supervisor, session.id, SessionState::Connected).await);

        supervisor.logout(session.id).await.unwrap();
        assert!(wait_for_state(&supervisor, session.id, SessionState::Disconnected).await);
        assert!(store.get_session(session.id).unwrap().device_jid.is_none());
    }

    #[tokio::test]
    async fn test_delete_stops_runtime_and_removes_row() {
        let factory = MockFactory::new();
        let (supervisor, store, _) = setup(factory.clone()).await;
        let session = supervisor.create("alice", None).unwrap();
        let _qr = supervisor.connect(session.id).await.unwrap();
        assert!(wait_for_state(&supervisor, session.id, SessionState::Connecting).await);

        supervisor.delete(session.id).await.unwrap();
        assert!(matches!(
            store.get_session(session.id),
            Err(GatewayError::NotFound(_))
        ));
        assert!(supervisor.runtimes.read().await.is_empty());

        // Second delete reports the missing row.
        assert!(matches!(
            supervisor.delete(session.id).await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_events_flow_through_pipeline_in_order() {
        let factory = MockFactory::new();
        let (supervisor, _, sink) = setup(factory.clone()).await;
        let session = supervisor.create("alice", None).unwrap();

        let _qr = supervisor.connect(session.id).await.unwrap();
        assert!(wait_for_state(&supervisor, session.id, SessionState::Connecting).await);
        let client = factory.client(session.id);
        client
            .push(RawEvent::PairSuccess {
                device_jid: "AA:BB".to_string(),
            })
            .await;
        assert!(wait_for_state(&supervisor, session.id, SessionState::Connected).await);

        // Receipt(A), Disconnected, Connected, Receipt(B).
        let receipt = |id: &str| {
            RawEvent::Receipt(crate::client::RawReceipt {
                message_ids: vec![id.to_string()],
                chat: "x@s.whatsapp.net".to_string(),
                sender: "x@s.whatsapp.net".to_string(),
                timestamp: 1,
                receipt_type: "delivery".to_string(),
            })
        };
        client.push(receipt("A")).await;
        client.push(RawEvent::Disconnected).await;
        client.push(RawEvent::Connected).await;
        client.push(receipt("B")).await;

        let ok = async {
            for _ in 0..100 {
                if sink.seen.lock().unwrap().len() >= 5 {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            false
        }
        .await;
        assert!(ok, "expected all events to reach the sink");

        let seen = sink.seen.lock().unwrap().clone();
        // PairSuccess, Receipt, Disconnected, Connected, Receipt, in order.
        assert_eq!(
            seen,
            vec![
                "PairSuccess",
                "Receipt",
                "Disconnected",
                "Connected",
                "Receipt"
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_initial_connect_reports_error() {
        let factory = MockFactory::failing(1);
        let (supervisor, _, _) = setup(factory.clone()).await;
        let session = supervisor.create("alice", None).unwrap();

        let mut qr_rx = supervisor.connect(session.id).await.unwrap();
        match recv_qr(&mut qr_rx).await {
            QrUpdate::Error(msg) => assert!(msg.contains("mock connect failure")),
            other => panic!("expected error update, got {:?}", other),
        }
        assert!(wait_for_state(&supervisor, session.id, SessionState::Disconnected).await);
    }

    #[tokio::test]
    async fn test_message_events_marked_from_raw() {
        // Sanity: a Message raw event reaches the pipeline as Message.
        let factory = MockFactory::new();
        let (supervisor, _, sink) = setup(factory.clone()).await;
        let session = supervisor.create("alice", None).unwrap();
        let _qr = supervisor.connect(session.id).await.unwrap();
        assert!(wait_for_state(&supervisor, session.id, SessionState::Connecting).await);

        factory
            .client(session.id)
            .push(RawEvent::Message(RawMessage {
                id: "ID1".to_string(),
                chat: "x@s.whatsapp.net".to_string(),
                sender: "x@s.whatsapp.net".to_string(),
                kind: "text".to_string(),
                text: Some("oi".to_string()),
                timestamp: 1,
                ..Default::default()
            }))
            .await;

        let ok = async {
            for _ in 0..100 {
                if sink
                    .seen
                    .lock()
                    .unwrap()
                    .iter()
                    .any(|t| t == "Message")
                {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            false
        }
        .await;
        assert!(ok);
    }
}
