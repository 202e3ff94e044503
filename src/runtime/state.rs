//! Session lifecycle states.

use serde::Serialize;

/// Connection lifecycle state of one session runtime.
///
/// `Terminated` is terminal and only reached by explicit deletion; every
/// other state can be left again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Qr,
    Pairing,
    Connected,
    Reconnecting,
    Terminated,
}

impl SessionState {
    /// Stable lowercase name for API responses and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Qr => "qr",
            SessionState::Pairing => "pairing",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Terminated => "terminated",
        }
    }

    /// States in which a login flow is in progress and a pairing code may be
    /// requested.
    pub fn accepts_pairing(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Qr)
    }

    /// States in which the client connection is being actively maintained.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Reconnecting)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
