//! Webhook delivery subsystem.
//!
//! Subscriptions live in the store ([`crate::store::WebhookSubscription`]);
//! the [`registry`] selects which of them receive an event (session scope
//! first, global fallback); [`delivery`] owns the bounded queue and worker
//! pool that perform the signed HTTP POSTs with bounded retry.

pub mod delivery;
pub mod registry;
pub mod signature;

pub use delivery::WebhookDispatcher;
pub use registry::SubscriptionRegistry;
