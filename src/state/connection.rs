//! VPN connection state types.

use std::time::Instant;

use crate::core::supervisor::ProcessHandle;

/// VPN connection state machine.
///
/// Derived state: the supervised process being alive and having printed its
/// completion marker is the source of truth, and any process exit forces
/// the state back to `Disconnected`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No client process for this connection.
    #[default]
    Disconnected,
    /// Client started, transport being established.
    Connecting,
    /// Server asked for additional authentication.
    Authenticating,
    /// Tunnel is up.
    Connected,
}

impl ConnectionState {
    /// True while a connect attempt is still unresolved.
    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::Connecting | Self::Authenticating)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
        };
        f.write_str(label)
    }
}

/// Runtime bookkeeping for an active or pending connection.
#[derive(Clone, Debug)]
pub struct ConnectionRecord {
    /// Profile name the connection belongs to.
    pub profile_id: String,
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Opaque reference to the supervised process.
    pub process_handle: ProcessHandle,
    /// When the connect attempt started.
    pub started_at: Instant,
}
