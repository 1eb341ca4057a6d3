//! Configuration and protocol constants for udrpc.

/// Number of request slots (and therefore credits) per session.
pub const SESSION_CREDITS: usize = 8;

/// Capacity of the per-endpoint unexpected-packet window: the maximum
/// number of multi-packet messages that may be in reassembly at once.
pub const UNEXP_PKT_WINDOW: usize = 32;

/// Maximum number of packets in a single message.
pub const MAX_PKTS_PER_MSG: usize = 16;

/// Maximum hostname length in management endpoints, including NUL.
pub const MAX_HOSTNAME_LEN: usize = 64;

/// RPC configuration.
///
/// Controls timer, retry, and queue-depth parameters. Protocol-structural
/// values (slot counts, window capacity) are compile-time constants above.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Session management retransmission interval in milliseconds.
    /// Default: 50
    pub sm_rto_ms: u64,
    /// Maximum session management retransmissions before the peer is
    /// declared lost.
    /// Default: 100
    pub sm_max_retries: u32,
    /// Datapath retransmission timeout in microseconds.
    /// Default: 20000 (20ms)
    pub dp_rto_us: u64,
    /// Maximum datapath retransmissions before the session is declared
    /// lost.
    /// Default: 500
    pub dp_max_retries: u32,
    /// Maximum number of sessions per endpoint.
    /// Default: 256
    pub max_sessions: usize,
    /// Number of receive buffers the transport keeps posted.
    /// Default: 64
    pub recv_ring_depth: usize,
    /// Maximum packets handed to the transport per event-loop iteration.
    /// Default: 32
    pub tx_burst: usize,
    /// Requested kernel socket buffer size for the datapath socket.
    /// Default: 1 MiB
    pub socket_buf_size: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            sm_rto_ms: 50,
            sm_max_retries: 100,
            dp_rto_us: 20_000,
            dp_max_retries: 500,
            max_sessions: 256,
            recv_ring_depth: 64,
            tx_burst: 32,
            socket_buf_size: 1 << 20,
        }
    }
}

impl RpcConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the session management retransmission interval.
    pub fn with_sm_rto_ms(mut self, sm_rto_ms: u64) -> Self {
        self.sm_rto_ms = sm_rto_ms;
        self
    }

    /// Set the maximum session management retransmissions.
    pub fn with_sm_max_retries(mut self, sm_max_retries: u32) -> Self {
        self.sm_max_retries = sm_max_retries;
        self
    }

    /// Set the datapath retransmission timeout.
    pub fn with_dp_rto_us(mut self, dp_rto_us: u64) -> Self {
        self.dp_rto_us = dp_rto_us;
        self
    }

    /// Set the maximum datapath retransmissions.
    pub fn with_dp_max_retries(mut self, dp_max_retries: u32) -> Self {
        self.dp_max_retries = dp_max_retries;
        self
    }

    /// Set the maximum number of sessions.
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Set the transport receive ring depth.
    pub fn with_recv_ring_depth(mut self, recv_ring_depth: usize) -> Self {
        self.recv_ring_depth = recv_ring_depth;
        self
    }

    /// Set the per-iteration transmit burst size.
    pub fn with_tx_burst(mut self, tx_burst: usize) -> Self {
        self.tx_burst = tx_burst;
        self
    }

    /// Set the requested kernel socket buffer size.
    pub fn with_socket_buf_size(mut self, socket_buf_size: usize) -> Self {
        self.socket_buf_size = socket_buf_size;
        self
    }
}
