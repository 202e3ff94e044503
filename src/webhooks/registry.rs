//! Subscription selection for outgoing events.
//!
//! Selection rule: the session-scoped enabled subscriptions whose filter
//! contains the event type win; the global pool is consulted only when no
//! session-scoped subscription matched. This is a fallback, not a union.

use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::events::EventType;
use crate::store::{Store, WebhookSubscription};

/// Read-mostly view over the subscription table.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    store: Store,
}

impl SubscriptionRegistry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Subscriptions that should receive one event.
    pub fn subscriptions_for_event(
        &self,
        session_id: Uuid,
        event_type: EventType,
    ) -> Result<Vec<WebhookSubscription>> {
        let name = event_type.as_str();
        let scoped: Vec<_> = self
            .store
            .enabled_subscriptions(Some(session_id))?
            .into_iter()
            .filter(|sub| sub.wants(name))
            .collect();
        if !scoped.is_empty() {
            return Ok(scoped);
        }
        Ok(self
            .store
            .enabled_subscriptions(None)?
            .into_iter()
            .filter(|sub| sub.wants(name))
            .collect())
    }

    /// Validates a subscription's event filter: non-empty, every name in the
    /// catalogue.
    pub fn validate_events(events: &[String]) -> Result<()> {
        if events.is_empty() {
            return Err(GatewayError::InvalidArgument(
                "events must not be empty".to_string(),
            ));
        }
        for name in events {
            if EventType::parse(name).is_none() {
                return Err(GatewayError::InvalidArgument(format!(
                    "unknown event type '{}'",
                    name
                )));
            }
        }
        Ok(())
    }
}
