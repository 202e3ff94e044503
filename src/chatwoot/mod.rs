//! Chatwoot bridge: bidirectional mirror between WhatsApp sessions and
//! Chatwoot inboxes.
//!
//! - [`bridge`]: inbound path (WhatsApp → Chatwoot): contact/conversation
//!   reconciliation, content formatting, mapping-table dedup.
//! - [`outbound`]: outbound path (Chatwoot webhook → WhatsApp send).
//! - [`api`]: the Chatwoot REST client.
//! - [`markdown`] / [`phone`]: dialect conversion and Brazilian number
//!   normalization shared by both paths.

pub mod api;
pub mod bridge;
pub mod markdown;
pub mod outbound;
pub mod phone;

pub use api::ChatwootApi;
pub use bridge::ChatwootBridge;
pub use outbound::{ChatwootWebhook, OutboundHandler, OutboundOutcome, TextSender};
