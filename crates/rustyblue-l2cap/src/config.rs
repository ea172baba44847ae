//! Engine configuration
//!
//! Timeouts and defaults used by the L2CAP manager. All durations are kept
//! in milliseconds so the structure can be loaded from a config file when
//! the `serde` feature is enabled.

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::l2cap::constants::L2CAP_DEFAULT_MTU;

/// Configuration for an [`L2capManager`](crate::l2cap::L2capManager)
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct L2capConfig {
    /// MTU assumed for a channel until a Configure exchange says otherwise
    #[cfg_attr(feature = "serde", serde(default = "default_mtu"))]
    pub default_mtu: u16,

    /// Time allowed for an outbound channel to reach CONNECTED
    #[cfg_attr(feature = "serde", serde(default = "default_connect_timeout_ms"))]
    pub connect_timeout_ms: u64,

    /// Time allowed for the peer to acknowledge a Disconnect Request
    #[cfg_attr(feature = "serde", serde(default = "default_disconnect_timeout_ms"))]
    pub disconnect_timeout_ms: u64,

    /// Idle grace period for links this side created
    #[cfg_attr(feature = "serde", serde(default = "default_idle_timeout_initiator_ms"))]
    pub idle_timeout_initiator_ms: u64,

    /// Idle grace period for links the peer created
    #[cfg_attr(feature = "serde", serde(default = "default_idle_timeout_acceptor_ms"))]
    pub idle_timeout_acceptor_ms: u64,

    /// Upper bound accepted by `listen`
    #[cfg_attr(feature = "serde", serde(default = "default_max_backlog"))]
    pub max_backlog: usize,

    /// Received SDUs a channel holds for the application before further
    /// frames are dropped
    #[cfg_attr(feature = "serde", serde(default = "default_rx_queue_limit"))]
    pub rx_queue_limit: usize,
}

const fn default_mtu() -> u16 {
    L2CAP_DEFAULT_MTU
}

const fn default_connect_timeout_ms() -> u64 {
    5_000
}

const fn default_disconnect_timeout_ms() -> u64 {
    5_000
}

const fn default_idle_timeout_initiator_ms() -> u64 {
    4_000
}

const fn default_idle_timeout_acceptor_ms() -> u64 {
    2_000
}

const fn default_max_backlog() -> usize {
    32
}

const fn default_rx_queue_limit() -> usize {
    256
}

impl Default for L2capConfig {
    fn default() -> Self {
        Self {
            default_mtu: default_mtu(),
            connect_timeout_ms: default_connect_timeout_ms(),
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
            idle_timeout_initiator_ms: default_idle_timeout_initiator_ms(),
            idle_timeout_acceptor_ms: default_idle_timeout_acceptor_ms(),
            max_backlog: default_max_backlog(),
            rx_queue_limit: default_rx_queue_limit(),
        }
    }
}

impl L2capConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    /// Idle grace period for a link, longer when this side initiated it
    pub fn idle_timeout(&self, is_initiator: bool) -> Duration {
        if is_initiator {
            Duration::from_millis(self.idle_timeout_initiator_ms)
        } else {
            Duration::from_millis(self.idle_timeout_acceptor_ms)
        }
    }
}
