//! Session runtimes: one long-lived task per WhatsApp session.
//!
//! The [`SessionSupervisor`] owns the map from session id to runtime handle
//! and is the only cross-session component. Each runtime serially drains its
//! client's event stream into the event pipeline (per-session ordering),
//! applies control commands, and reconnects with exponential backoff after
//! unsolicited disconnects.

mod handle;
mod runner;
mod state;
mod supervisor;

pub use handle::{QrUpdate, RuntimeStatus};
pub use state::SessionState;
pub use supervisor::SessionSupervisor;
