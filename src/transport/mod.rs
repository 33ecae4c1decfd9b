//! uTP transport layer - engine context, sockets and connections
//!
//! A [`UtpContext`] owns one engine behind one lock. Sockets created from it
//! share that lock, and a packet I/O loop ([`UtpDriver`] or an application's
//! own) feeds the engine with received datagrams and timer ticks. Connection
//! events come back through the callback bridge and wake tasks blocked in
//! [`UtpConn`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::UtpOption;

pub mod bridge;
pub mod conn;
pub mod context;
pub mod driver;
pub mod metrics;
pub mod socket;

pub use bridge::{ConnState, Datagram};
pub use conn::{UtpConn, UtpListener};
pub use context::UtpContext;
pub use driver::{DriverConfig, UtpDriver};
pub use metrics::BindingStats;
pub use socket::UtpSocket;

/// Engine context configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// How often the packet loop drives engine timers
    pub tick_interval_ms: u64,
    /// Default dial timeout
    pub dial_timeout_ms: u64,
    /// Engine send buffer in bytes (engine default when unset)
    pub send_buffer: Option<i32>,
    /// Engine receive buffer in bytes (engine default when unset)
    pub recv_buffer: Option<i32>,
    /// Target queuing delay in microseconds (engine default when unset)
    pub target_delay_us: Option<i32>,
    /// Enable the engine's normal log output
    pub log_normal: bool,
    /// Enable the engine's MTU discovery log output
    pub log_mtu: bool,
    /// Enable the engine's debug log output
    pub log_debug: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: crate::DEFAULT_TICK_INTERVAL_MS,
            dial_timeout_ms: crate::DEFAULT_DIAL_TIMEOUT_MS,
            send_buffer: None,
            recv_buffer: None,
            target_delay_us: None,
            log_normal: false,
            log_mtu: false,
            log_debug: false,
        }
    }
}

impl ContextConfig {
    /// Timer interval as a duration, never zero
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// Dial timeout as a duration
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// Options applied to the engine when a context is created
    ///
    /// Log switches are only sent when enabled, buffer sizes and target delay
    /// only when set.
    pub fn engine_options(&self) -> Vec<(UtpOption, i32)> {
        let mut options = Vec::new();
        for (enabled, option) in [
            (self.log_normal, UtpOption::LogNormal),
            (self.log_mtu, UtpOption::LogMtu),
            (self.log_debug, UtpOption::LogDebug),
        ] {
            if enabled {
                options.push((option, 1));
            }
        }
        for (value, option) in [
            (self.send_buffer, UtpOption::SendBuffer),
            (self.recv_buffer, UtpOption::RecvBuffer),
            (self.target_delay_us, UtpOption::TargetDelay),
        ] {
            if let Some(value) = value {
                options.push((option, value));
            }
        }
        options
    }
}
