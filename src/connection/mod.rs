//! Coordinator connection: WebSocket client with reconnect and keepalive.

pub mod manager;

pub use manager::ConnectionManager;

/// Lifecycle of the coordinator connection. Loops forever; there is no
/// terminal state short of shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
        };
        write!(f, "{s}")
    }
}
