//! Configuration types for udrpc.

/// RPC endpoint configuration.
///
/// Controls flow control, packet-loss handling and resource sizing.
/// The request window size is a crate constant
/// ([`SESSION_REQ_WINDOW`](crate::session::SESSION_REQ_WINDOW)) because
/// request-number low bits must index a slot directly.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Per-session credits: the number of packets a client may have
    /// outstanding to its peer.
    /// Default: 8
    pub session_credits: usize,
    /// Packet-loss scan interval in milliseconds. Converted to
    /// cycle-counter ticks at endpoint construction.
    /// Default: 50
    pub pkt_loss_epoch_ms: u64,
    /// Age after which an unacknowledged request is deemed lost.
    /// Default: 500
    pub pkt_loss_timeout_ms: u64,
    /// Consecutive timeouts tolerated per request before the session is
    /// failed. Zero disables retransmission entirely.
    /// Default: 5
    pub max_retries: u32,
    /// Maximum concurrently connected sessions.
    /// Default: 256
    pub max_sessions: usize,
    /// Initial huge-page reservation for the message-buffer allocator.
    /// Default: 16 MiB
    pub initial_alloc_bytes: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            session_credits: 8,
            pkt_loss_epoch_ms: 50,
            pkt_loss_timeout_ms: 500,
            max_retries: 5,
            max_sessions: 256,
            initial_alloc_bytes: 16 * 1024 * 1024,
        }
    }
}

impl RpcConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-session credits.
    pub fn with_session_credits(mut self, session_credits: usize) -> Self {
        self.session_credits = session_credits;
        self
    }

    /// Set the packet-loss scan epoch.
    pub fn with_pkt_loss_epoch_ms(mut self, ms: u64) -> Self {
        self.pkt_loss_epoch_ms = ms;
        self
    }

    /// Set the packet-loss timeout.
    pub fn with_pkt_loss_timeout_ms(mut self, ms: u64) -> Self {
        self.pkt_loss_timeout_ms = ms;
        self
    }

    /// Set the maximum retransmission attempts.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the maximum number of sessions.
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Set the initial huge-page reservation.
    pub fn with_initial_alloc_bytes(mut self, bytes: usize) -> Self {
        self.initial_alloc_bytes = bytes;
        self
    }
}
