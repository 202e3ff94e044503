//! End-to-end tests for the gateway.
//!
//! These exercise the full inbound path (session runtime → event pipeline →
//! webhook delivery / Chatwoot bridge) against scripted local HTTP endpoints
//! and a scriptable mock protocol client. No external services required.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use uuid::Uuid;

use zpwoot::chatwoot::ChatwootBridge;
use zpwoot::client::{
    ClientFactory, MediaDownload, OutgoingContent, RawEvent, RawMessage, RawReceipt, SendReceipt,
    WhatsAppClient,
};
use zpwoot::config::WebhookDeliveryConfig;
use zpwoot::error::Result;
use zpwoot::events::{EventPipeline, EventPublisher};
use zpwoot::runtime::{QrUpdate, SessionState, SessionSupervisor};
use zpwoot::store::{ChatwootConfig, Store, SyncStatus};
use zpwoot::webhooks::{signature, WebhookDispatcher};

// ============================================================================
// Mock protocol client
// ============================================================================

struct MockClient {
    events_tx: mpsc::Sender<RawEvent>,
    events_rx: StdMutex<Option<mpsc::Receiver<RawEvent>>>,
}

impl MockClient {
    fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(64);
        Arc::new(Self {
            events_tx: tx,
            events_rx: StdMutex::new(Some(rx)),
        })
    }

    async fn push(&self, event: RawEvent) {
        self.events_tx.send(event).await.unwrap();
    }
}

#[async_trait]
impl WhatsAppClient for MockClient {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) {}

    async fn logout(&self) -> Result<()> {
        Ok(())
    }

    async fn pair_phone(&self, _phone: &str) -> Result<String> {
        Ok("ABCD-1234".to_string())
    }

    async fn send(&self, _to: &str, _content: OutgoingContent) -> Result<SendReceipt> {
        Ok(SendReceipt {
            message_id: "WAMID.SENT".to_string(),
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
            data: vec![],
            mime_type: "application/octet-stream".to_string(),
            filename: None,
        })
    }

    fn take_events(&self) -> Option<mpsc::Receiver<RawEvent>> {
        self.events_rx.lock().unwrap().take()
    }
}

struct MockFactory {
    created: StdMutex<HashMap<Uuid, Arc<MockClient>>>,
}

impl MockFactory {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            created: StdMutex::new(HashMap::new()),
        })
    }

    fn client(&self, id: Uuid) -> Arc<MockClient> {
        self.created.lock().unwrap().get(&id).unwrap().clone()
    }
}

impl ClientFactory for MockFactory {
    fn create(&self, session_id: Uuid, _proxy_url: Option<&str>) -> Arc<dyn WhatsAppClient> {
        let client = MockClient::new();
        self.created
            .lock()
            .unwrap()
            .insert(session_id, Arc::clone(&client));
        client
    }
}

// ============================================================================
// Scripted HTTP endpoints
// ============================================================================

#[derive(Clone)]
struct CapturedRequest {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: String,
}

/// Minimal HTTP server: records requests, answers from a routing closure.
async fn spawn_http_server(
    respond: impl Fn(&CapturedRequest, usize) -> (u16, String) + Send + Sync + 'static,
) -> (String, Arc<AtomicUsize>, Arc<StdMutex<Vec<CapturedRequest>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(StdMutex::new(Vec::new()));

    let hits_task = Arc::clone(&hits);
    let requests_task = Arc::clone(&requests);
    let respond = Arc::new(respond);
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let mut buf = vec![0u8; 65536];
            let mut total = 0usize;
            loop {
                match stream.read(&mut buf[total..]).await {
                    Ok(0) => break,
                    Ok(n) => {
                        total += n;
                        let data = &buf[..total];
                        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                            let head = String::from_utf8_lossy(&data[..pos]);
                            let content_length = head
                                .lines()
                                .find_map(|line| {
                                    line.to_ascii_lowercase()
                                        .strip_prefix("content-length:")
                                        .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                                })
                                .unwrap_or(0);
                            if total >= pos + 4 + content_length {
                                break;
                            }
                        }
                    }
                    Err(_) => break,
                }
            }
            if total == 0 {
                continue;
            }

            let raw = String::from_utf8_lossy(&buf[..total]).to_string();
            let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw.as_str(), ""));
            let mut lines = head.lines();
            let request_line = lines.next().unwrap_or_default();
            let mut parts = request_line.split_whitespace();
            let method = parts.next().unwrap_or_default().to_string();
            let path = parts.next().unwrap_or_default().to_string();
            let headers = lines
                .filter_map(|line| {
                    line.split_once(':')
                        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                })
                .collect();

            let captured = CapturedRequest {
                method,
                path,
                headers,
                body: body.to_string(),
            };
            let n = hits_task.fetch_add(1, Ordering::SeqCst);
            let (status, response_body) = respond(&captured, n);
            requests_task.lock().unwrap().push(captured);

            let reason = if status < 300 { "OK" } else { "Error" };
            let response = format!(
                "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                reason,
                response_body.len(),
                response_body
            );
            let _ = stream.write_all(response.as_bytes()).await;
        }
    });

    (format!("http://{}", addr), hits, requests)
}

// ============================================================================
// Harness
// ============================================================================

struct Gateway {
    store: Store,
    supervisor: Arc<SessionSupervisor>,
    factory: Arc<MockFactory>,
    dispatcher: Arc<WebhookDispatcher>,
}

async fn gateway(delivery: WebhookDeliveryConfig) -> Gateway {
    let store = Store::open_in_memory().unwrap();
    let publisher = Arc::new(EventPublisher::new());
    let dispatcher = WebhookDispatcher::start(store.clone(), &delivery);
    publisher.register(dispatcher.clone()).await;
    publisher.register(ChatwootBridge::new(store.clone())).await;
    let pipeline = Arc::new(EventPipeline::new(publisher));
    let factory = MockFactory::new();
    let supervisor = SessionSupervisor::new(store.clone(), factory.clone(), pipeline);
    Gateway {
        store,
        supervisor,
        factory,
        dispatcher,
    }
}

fn delivery_config(workers: usize) -> WebhookDeliveryConfig {
    WebhookDeliveryConfig {
        queue_capacity: 64,
        workers,
        max_attempts: 3,
        timeout_secs: 5,
    }
}

/// Connects and pairs a session against the mock client.
async fn pair_session(gw: &Gateway, name: &str) -> (Uuid, Arc<MockClient>) {
    let session = gw.supervisor.create(name, None).unwrap();
    let mut qr_rx = gw.supervisor.connect(session.id).await.unwrap();

    // Wait for the runner to create the client.
    let mut client = None;
    for _ in 0..100 {
        if let Some(c) = gw.factory.created.lock().unwrap().get(&session.id).cloned() {
            client = Some(c);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let client = client.expect("client created by connect");

    client
        .push(RawEvent::Qr {
            codes: vec!["2@qr-code".to_string()],
        })
        .await;
    assert_eq!(
        recv_qr(&mut qr_rx).await,
        QrUpdate::Code("2@qr-code".to_string())
    );

    client
        .push(RawEvent::PairSuccess {
            device_jid: "AA:BB".to_string(),
        })
        .await;
    assert_eq!(
        recv_qr(&mut qr_rx).await,
        QrUpdate::PairSuccess {
            device_jid: "AA:BB".to_string()
        }
    );
    assert!(wait_for(|| async {
        gw.supervisor.state(session.id).await.unwrap() == SessionState::Connected
    })
    .await);

    (session.id, client)
}

async fn recv_qr(rx: &mut mpsc::Receiver<QrUpdate>) -> QrUpdate {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("qr update within deadline")
        .expect("qr channel open")
}

async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

fn text_message(id: &str, from: &str, text: &str) -> RawEvent {
    RawEvent::Message(RawMessage {
        id: id.to_string(),
        chat: from.to_string(),
        sender: from.to_string(),
        from_me: false,
        timestamp: 1707900000,
        kind: "text".to_string(),
        text: Some(text.to_string()),
        ..Default::default()
    })
}

// ============================================================================
// Scenarios
// ============================================================================

/// Pair a session, receive a message, observe the signed webhook POST with
/// the enriched payload.
#[tokio::test]
async fn pair_and_receive_message_webhook() {
    let (url, hits, requests) = spawn_http_server(|_, _| (200, "{}".to_string())).await;

    let gw = gateway(delivery_config(2)).await;
    let (session_id, client) = pair_session(&gw, "alice").await;
    gw.store
        .create_subscription(
            Some(session_id),
            &url,
            Some("shh"),
            &["Message".to_string()],
            true,
        )
        .unwrap();

    client
        .push(text_message("ID1", "5511999999999@s.whatsapp.net", "oi"))
        .await;

    assert!(wait_for(|| async { hits.load(Ordering::SeqCst) >= 1 }).await);

    let request = requests.lock().unwrap()[0].clone();
    let payload: Value = serde_json::from_str(&request.body).unwrap();
    assert_eq!(payload["event"], "Message");
    assert_eq!(payload["sessionId"], session_id.to_string());
    assert!(payload["timestamp"].is_i64());
    assert_eq!(payload["data"]["message_id"], "ID1");
    assert_eq!(payload["data"]["from_me"], false);
    assert_eq!(payload["data"]["chat"], "5511999999999@s.whatsapp.net");
    assert_eq!(payload["data"]["sender"], "5511999999999@s.whatsapp.net");
    assert_eq!(payload["data"]["message_type"], "text");
    assert_eq!(payload["data"]["text"], "oi");

    // Signature verifies over the exact body.
    let sig = request
        .headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("x-webhook-signature"))
        .map(|(_, v)| v.clone())
        .expect("signature header present");
    assert!(signature::verify("shh", request.body.as_bytes(), &sig));

    // Catalogue headers present.
    let header = |name: &str| {
        request
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    };
    assert_eq!(header("x-webhook-event").as_deref(), Some("Message"));
    assert_eq!(
        header("x-webhook-session").as_deref(),
        Some(session_id.to_string().as_str())
    );
    assert_eq!(header("user-agent").as_deref(), Some("zpwoot-webhook/1.0"));

    gw.dispatcher.shutdown();
}

/// Subscriber answers 503 twice then 200: three POSTs, stats 3/1/2.
#[tokio::test]
async fn webhook_retry_until_success() {
    let (url, hits, _) = spawn_http_server(|_, n| {
        if n < 2 {
            (503, "{}".to_string())
        } else {
            (200, "{}".to_string())
        }
    })
    .await;

    let gw = gateway(delivery_config(2)).await;
    let (session_id, client) = pair_session(&gw, "alice").await;
    let sub = gw
        .store
        .create_subscription(Some(session_id), &url, None, &["Message".to_string()], true)
        .unwrap();

    client
        .push(text_message("ID1", "5511999999999@s.whatsapp.net", "oi"))
        .await;

    // Attempts at ~t, t+2s, t+4s.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while hits.load(Ordering::SeqCst) < 3 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(hits.load(Ordering::SeqCst), 3);

    let stats = gw.store.get_subscription(sub.id).unwrap().stats;
    assert_eq!(stats.total, 3);
    assert_eq!(stats.success, 1);
    assert_eq!(stats.failure, 2);

    gw.dispatcher.shutdown();
}

/// AppState events from the adapter never produce a webhook request.
#[tokio::test]
async fn app_state_events_are_dropped() {
    let (url, hits, _) = spawn_http_server(|_, _| (200, "{}".to_string())).await;

    let gw = gateway(delivery_config(2)).await;
    let (session_id, client) = pair_session(&gw, "alice").await;
    gw.store
        .create_subscription(
            Some(session_id),
            &url,
            None,
            &["Message".to_string(), "Receipt".to_string()],
            true,
        )
        .unwrap();

    client
        .push(RawEvent::Other {
            tag: "AppState".to_string(),
            data: json!({"index": 1}),
        })
        .await;
    client
        .push(text_message("ID1", "x@s.whatsapp.net", "after"))
        .await;

    assert!(wait_for(|| async { hits.load(Ordering::SeqCst) >= 1 }).await);
    // Only the Message made it through.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    gw.dispatcher.shutdown();
}

/// With a single worker, the subscriber observes Receipt(A),
/// Disconnected, Connected, Receipt(B) in order.
#[tokio::test]
async fn disconnect_reconnect_event_ordering() {
    let (url, hits, requests) = spawn_http_server(|_, _| (200, "{}".to_string())).await;

    let gw = gateway(delivery_config(1)).await;
    let (session_id, client) = pair_session(&gw, "alice").await;
    gw.store
        .create_subscription(
            Some(session_id),
            &url,
            None,
            &[
                "Receipt".to_string(),
                "Connected".to_string(),
                "Disconnected".to_string(),
            ],
            true,
        )
        .unwrap();

    let receipt = |id: &str| {
        RawEvent::Receipt(RawReceipt {
            message_ids: vec![id.to_string()],
            chat: "x@s.whatsapp.net".to_string(),
            sender: "x@s.whatsapp.net".to_string(),
            timestamp: 1707900000,
            receipt_type: "delivery".to_string(),
        })
    };

    client.push(receipt("A")).await;
    client.push(RawEvent::Disconnected).await;
    client.push(RawEvent::Connected).await;
    client.push(receipt("B")).await;

    assert!(wait_for(|| async { hits.load(Ordering::SeqCst) >= 4 }).await);

    let order: Vec<(String, Vec<String>)> = requests
        .lock()
        .unwrap()
        .iter()
        .map(|r| {
            let payload: Value = serde_json::from_str(&r.body).unwrap();
            let ids = payload["data"]["message_ids"]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            (payload["event"].as_str().unwrap().to_string(), ids)
        })
        .collect();

    assert_eq!(order[0], ("Receipt".to_string(), vec!["A".to_string()]));
    assert_eq!(order[1].0, "Disconnected");
    assert_eq!(order[2].0, "Connected");
    assert_eq!(order[3], ("Receipt".to_string(), vec!["B".to_string()]));

    gw.dispatcher.shutdown();
}

/// Brazil merge: both 13- and 14-digit contacts exist; the bridge merges
/// them (base = 14-digit) and posts to the surviving contact's conversation.
#[tokio::test]
async fn brazil_contact_merge_flow() {
    let (cw_url, _, cw_requests) = spawn_http_server(|req, _| {
        let path = req.path.clone();
        if path.starts_with("/api/v1/accounts/1/contacts/search") {
            if path.contains("9988888888") {
                // 14-digit variant
                (
                    200,
                    json!({"payload": [{"id": 2, "name": "Maria", "phone_number": "+55119988888888"}]})
                        .to_string(),
                )
            } else {
                // 13-digit variant
                (
                    200,
                    json!({"payload": [{"id": 1, "name": "Maria", "phone_number": "+5511988888888"}]})
                        .to_string(),
                )
            }
        } else if path == "/api/v1/accounts/1/actions/contact_merge" {
            (
                200,
                json!({"payload": {"contact": {"id": 2, "phone_number": "+55119988888888"}}})
                    .to_string(),
            )
        } else if path == "/api/v1/accounts/1/contacts/2/conversations" {
            (200, json!({"payload": []}).to_string())
        } else if path == "/api/v1/accounts/1/conversations" {
            (
                200,
                json!({"id": 7, "inbox_id": 5, "status": "open"}).to_string(),
            )
        } else if path == "/api/v1/accounts/1/conversations/7/messages" {
            (200, json!({"id": 99, "content": "oi"}).to_string())
        } else {
            (404, json!({"error": "unexpected route"}).to_string())
        }
    })
    .await;

    let gw = gateway(delivery_config(2)).await;
    let (session_id, client) = pair_session(&gw, "alice").await;

    let mut config = ChatwootConfig::new(session_id, &cw_url, "tok", "1");
    config.enabled = true;
    config.merge_brazil = true;
    config.inbox_id = Some(5);
    gw.store.put_chatwoot_config(&config).unwrap();

    client
        .push(text_message("MSG1", "5511988888888@s.whatsapp.net", "oi"))
        .await;

    assert!(
        wait_for(|| async {
            matches!(
                gw.store.get_mapping(session_id, "MSG1").unwrap(),
                Some(m) if m.sync_status == SyncStatus::Synced
            )
        })
        .await,
        "mapping should reach synced"
    );

    let mapping = gw.store.get_mapping(session_id, "MSG1").unwrap().unwrap();
    assert_eq!(mapping.cw_message_id, Some(99));
    assert_eq!(mapping.cw_conversation_id, Some(7));

    let requests = cw_requests.lock().unwrap().clone();
    let merge = requests
        .iter()
        .find(|r| r.path.ends_with("/actions/contact_merge"))
        .expect("contact_merge called");
    let merge_body: Value = serde_json::from_str(&merge.body).unwrap();
    assert_eq!(merge_body["base_contact_id"], 2);
    assert_eq!(merge_body["mergee_contact_id"], 1);

    let message_post = requests
        .iter()
        .find(|r| r.path.ends_with("/conversations/7/messages"))
        .expect("message posted");
    let message_body: Value = serde_json::from_str(&message_post.body).unwrap();
    assert_eq!(message_body["content"], "oi");
    assert_eq!(message_body["message_type"], "incoming");

    gw.dispatcher.shutdown();
}

/// Invariant 4: the same WhatsApp message observed twice produces exactly one
/// Chatwoot POST.
#[tokio::test]
async fn duplicate_message_single_chatwoot_post() {
    let message_posts = Arc::new(AtomicUsize::new(0));
    let posts_counter = Arc::clone(&message_posts);
    let (cw_url, _, _) = spawn_http_server(move |req, _| {
        let path = req.path.clone();
        if path.starts_with("/api/v1/accounts/1/contacts/search") {
            (
                200,
                json!({"payload": [{"id": 1, "phone_number": "+5511988888888"}]}).to_string(),
            )
        } else if path == "/api/v1/accounts/1/contacts/1/conversations" {
            (
                200,
                json!({"payload": [{"id": 7, "inbox_id": 5, "status": "open"}]}).to_string(),
            )
        } else if path == "/api/v1/accounts/1/conversations/7/messages" {
            posts_counter.fetch_add(1, Ordering::SeqCst);
            (200, json!({"id": 99}).to_string())
        } else {
            (404, "{}".to_string())
        }
    })
    .await;

    let gw = gateway(delivery_config(2)).await;
    let (session_id, client) = pair_session(&gw, "alice").await;

    let mut config = ChatwootConfig::new(session_id, &cw_url, "tok", "1");
    config.enabled = true;
    config.inbox_id = Some(5);
    gw.store.put_chatwoot_config(&config).unwrap();

    client
        .push(text_message("MSG1", "5511988888888@s.whatsapp.net", "oi"))
        .await;
    assert!(
        wait_for(|| async {
            matches!(
                gw.store.get_mapping(session_id, "MSG1").unwrap(),
                Some(m) if m.sync_status == SyncStatus::Synced
            )
        })
        .await
    );

    // At-least-once redelivery of the same message.
    client
        .push(text_message("MSG1", "5511988888888@s.whatsapp.net", "oi"))
        .await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(message_posts.load(Ordering::SeqCst), 1);

    gw.dispatcher.shutdown();
}

/// Scoped subscriptions win; the global pool only sees events no scoped
/// subscription matched.
#[tokio::test]
async fn global_webhook_fallback() {
    let (scoped_url, scoped_hits, _) = spawn_http_server(|_, _| (200, "{}".to_string())).await;
    let (global_url, global_hits, _) = spawn_http_server(|_, _| (200, "{}".to_string())).await;

    let gw = gateway(delivery_config(2)).await;
    let (session_id, client) = pair_session(&gw, "alice").await;
    gw.store
        .create_subscription(
            Some(session_id),
            &scoped_url,
            None,
            &["Message".to_string()],
            true,
        )
        .unwrap();
    gw.store
        .create_subscription(
            None,
            &global_url,
            None,
            &["Message".to_string(), "Receipt".to_string()],
            true,
        )
        .unwrap();

    // Message: scoped matches, global stays silent.
    client
        .push(text_message("ID1", "x@s.whatsapp.net", "oi"))
        .await;
    assert!(wait_for(|| async { scoped_hits.load(Ordering::SeqCst) >= 1 }).await);

    // Receipt: no scoped match, falls back to global.
    client
        .push(RawEvent::Receipt(RawReceipt {
            message_ids: vec!["A".to_string()],
            chat: "x@s.whatsapp.net".to_string(),
            sender: "x@s.whatsapp.net".to_string(),
            timestamp: 1707900000,
            receipt_type: "read".to_string(),
        }))
        .await;
    assert!(wait_for(|| async { global_hits.load(Ordering::SeqCst) >= 1 }).await);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(scoped_hits.load(Ordering::SeqCst), 1);
    assert_eq!(global_hits.load(Ordering::SeqCst), 1);

    gw.dispatcher.shutdown();
}
