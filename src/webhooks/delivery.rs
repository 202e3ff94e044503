//! Webhook delivery: one process-wide bounded queue feeding a worker pool.
//!
//! Submitting never blocks the event pipeline: a full queue drops the task
//! with a warning; the gateway prefers liveness over guaranteed delivery
//! when overwhelmed. Each HTTP attempt gets its own timeout; failures retry
//! with linear backoff (`attempt × 2 s`) through the same queue, up to
//! `max_attempts`. There is no dead-letter store: a final failure is logged
//! and forgotten.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde_json::Map;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WebhookDeliveryConfig;
use crate::error::{GatewayError, Result};
use crate::events::{Event, EventSink, EventType};
use crate::store::{Store, WebhookSubscription};

use super::registry::SubscriptionRegistry;
use super::signature;

/// User-Agent header on every delivery.
const USER_AGENT: &str = "zpwoot-webhook/1.0";

/// Session id used by test injections.
const TEST_SESSION_ID: &str = "test-session";

/// One delivery attempt in flight or queued.
struct DeliveryTask {
    subscription: WebhookSubscription,
    event: Arc<Event>,
    attempt: u32,
}

/// Everything a worker needs, cloneable per task.
#[derive(Clone)]
struct WorkerContext {
    http: reqwest::Client,
    store: Store,
    queue_tx: mpsc::Sender<DeliveryTask>,
    max_attempts: u32,
    timeout: Duration,
}

/// The webhook delivery subsystem.
pub struct WebhookDispatcher {
    queue_tx: mpsc::Sender<DeliveryTask>,
    registry: SubscriptionRegistry,
    store: Store,
    shutdown_tx: watch::Sender<bool>,
}

impl WebhookDispatcher {
    /// Builds the queue, spawns the worker pool, and returns the dispatcher.
    pub fn start(store: Store, config: &WebhookDeliveryConfig) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel::<DeliveryTask>(config.queue_capacity);
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();

        let ctx = WorkerContext {
            http,
            store: store.clone(),
            queue_tx: queue_tx.clone(),
            max_attempts: config.max_attempts,
            timeout: Duration::from_secs(config.timeout_secs),
        };

        for worker_id in 0..config.workers {
            tokio::spawn(Self::run_worker(
                worker_id,
                Arc::clone(&queue_rx),
                ctx.clone(),
                shutdown_rx.clone(),
            ));
        }

        info!(
            "Webhook dispatcher started ({} workers, queue capacity {})",
            config.workers, config.queue_capacity
        );

        Arc::new(Self {
            queue_tx,
            registry: SubscriptionRegistry::new(store.clone()),
            store,
            shutdown_tx,
        })
    }

    /// Signals the workers to stop after their in-flight attempt.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Synthesizes a test event for one subscription and dispatches it
    /// through the normal delivery path.
    pub fn test_webhook(
        &self,
        subscription_id: Uuid,
        event_type: &str,
        data: Map<String, serde_json::Value>,
    ) -> Result<()> {
        let subscription = self.store.get_subscription(subscription_id)?;
        let event_type = EventType::parse(event_type).ok_or_else(|| {
            GatewayError::InvalidArgument(format!("unknown event type '{}'", event_type))
        })?;

        let event = Event {
            id: format!("test-{}", subscription_id),
            session_id: TEST_SESSION_ID.to_string(),
            event_type,
            timestamp: chrono::Utc::now(),
            data,
        };

        self.enqueue(DeliveryTask {
            subscription,
            event: Arc::new(event),
            attempt: 1,
        })
        .map_err(|_| GatewayError::ResourceExhausted("webhook queue full".to_string()))
    }

    fn enqueue(&self, task: DeliveryTask) -> std::result::Result<(), ()> {
        match self.queue_tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(task)) => {
                warn!(
                    subscription = %task.subscription.id,
                    event_type = %task.event.event_type,
                    "webhook queue full, dropping delivery"
                );
                Err(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("webhook queue closed, dropping delivery");
                Err(())
            }
        }
    }

    async fn run_worker(
        worker_id: usize,
        queue_rx: Arc<Mutex<mpsc::Receiver<DeliveryTask>>>,
        ctx: WorkerContext,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        debug!("Webhook worker {} started", worker_id);
        loop {
            let task = tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                task = async { queue_rx.lock().await.recv().await } => {
                    match task {
                        Some(task) => task,
                        None => break,
                    }
                }
            };
            Self::deliver_task(&ctx, task).await;
        }
        debug!("Webhook worker {} stopped", worker_id);
    }

    /// Executes one HTTP attempt and drives the retry state machine.
    async fn deliver_task(ctx: &WorkerContext, task: DeliveryTask) {
        let body = task.event.payload().to_string();

        let mut request = ctx
            .http
            .post(&task.subscription.url)
            .header(CONTENT_TYPE, "application/json")
            .header("X-Webhook-Event", task.event.event_type.as_str())
            .header("X-Webhook-Session", &task.event.session_id)
            .header(
                "X-Webhook-Timestamp",
                task.event.timestamp.timestamp().to_string(),
            )
            .timeout(ctx.timeout)
            .body(body.clone());

        if let Some(secret) = task.subscription.secret.as_deref() {
            if !secret.is_empty() {
                request = request.header(
                    "X-Webhook-Signature",
                    signature::sign(secret, body.as_bytes()),
                );
            }
        }

        let started = Instant::now();
        let response = request.send().await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        let outcome = match &response {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => Err(format!("status {}", resp.status().as_u16())),
            Err(e) if e.is_timeout() => Err("timeout".to_string()),
            Err(e) => Err(e.to_string()),
        };

        if let Err(e) = ctx
            .store
            .record_delivery(task.subscription.id, outcome.is_ok(), latency_ms)
        {
            debug!("failed to record delivery stats: {}", e);
        }

        match outcome {
            Ok(()) => {
                debug!(
                    subscription = %task.subscription.id,
                    event_type = %task.event.event_type,
                    attempt = task.attempt,
                    latency_ms = latency_ms as u64,
                    "webhook delivered"
                );
            }
            Err(reason) => {
                if task.attempt < ctx.max_attempts {
                    // Linear backoff through the same queue; the sleep runs
                    // off-worker so the pool stays busy.
                    let delay = Duration::from_secs(u64::from(task.attempt) * 2);
                    let next = DeliveryTask {
                        subscription: task.subscription,
                        event: task.event,
                        attempt: task.attempt + 1,
                    };
                    warn!(
                        subscription = %next.subscription.id,
                        attempt = task.attempt,
                        "webhook delivery failed ({}), retrying in {:?}",
                        reason, delay
                    );
                    let queue_tx = ctx.queue_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if queue_tx.try_send(next).is_err() {
                            warn!("webhook queue full at reschedule, dropping retry");
                        }
                    });
                } else {
                    warn!(
                        subscription = %task.subscription.id,
                        event_type = %task.event.event_type,
                        attempts = task.attempt,
                        "webhook delivery failed permanently ({})",
                        reason
                    );
                }
            }
        }
    }
}

#[async_trait]
impl EventSink for WebhookDispatcher {
    fn name(&self) -> &str {
        "webhooks"
    }

    async fn deliver(&self, event: &Event) {
        let Ok(session_id) = Uuid::parse_str(&event.session_id) else {
            debug!("event with non-uuid session id, skipping webhook fan-out");
            return;
        };

        let subscriptions = match self
            .registry
            .subscriptions_for_event(session_id, event.event_type)
        {
            Ok(subs) => subs,
            Err(e) => {
                warn!("subscription lookup failed: {}", e);
                return;
            }
        };
        if subscriptions.is_empty() {
            return;
        }

        let event = Arc::new(event.clone());
        for subscription in subscriptions {
            let _ = self.enqueue(DeliveryTask {
                subscription,
                event: Arc::clone(&event),
                attempt: 1,
            });
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
