//! Protocol engine seam
//!
//! The uTP wire protocol (handshake, selective acks, congestion control,
//! retransmission) lives in an external engine. The binding talks to it only
//! through [`Engine`], and the engine talks back only through
//! [`EngineCallbacks`], which it receives as an argument of every entry point
//! that may fire events. Callbacks therefore cannot re-enter the engine.

use std::fmt;

use serde::{Deserialize, Serialize};
use socket2::SockAddr;

#[cfg(feature = "libutp")]
pub mod libutp;

/// Engine protocol version requested at context creation
pub const UTP_VERSION: i32 = 2;

/// Identity of one engine socket
///
/// Only meaningful to the engine that issued it. The binding never copies it
/// out of [`crate::transport::UtpSocket`] once the socket is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "utp#{:x}", self.0)
    }
}

/// Context and socket option identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UtpOption {
    /// Normal log verbosity
    LogNormal,
    /// MTU discovery logging
    LogMtu,
    /// Debug logging
    LogDebug,
    /// Send buffer size in bytes
    SendBuffer,
    /// Receive buffer size in bytes
    RecvBuffer,
    /// Target queuing delay in microseconds
    TargetDelay,
    /// Any other engine option id, forwarded untouched
    Raw(i32),
}

impl UtpOption {
    /// Numeric option id understood by the engine
    pub fn code(self) -> i32 {
        match self {
            UtpOption::LogNormal => 16,
            UtpOption::LogMtu => 17,
            UtpOption::LogDebug => 18,
            UtpOption::SendBuffer => 19,
            UtpOption::RecvBuffer => 20,
            UtpOption::TargetDelay => 21,
            UtpOption::Raw(code) => code,
        }
    }

    /// Option for a numeric id
    pub fn from_code(code: i32) -> Self {
        match code {
            16 => UtpOption::LogNormal,
            17 => UtpOption::LogMtu,
            18 => UtpOption::LogDebug,
            19 => UtpOption::SendBuffer,
            20 => UtpOption::RecvBuffer,
            21 => UtpOption::TargetDelay,
            other => UtpOption::Raw(other),
        }
    }
}

/// Socket state transitions reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEvent {
    /// Outgoing connection completed
    Connect,
    /// Send buffer has room again
    Writable,
    /// Remote end finished sending
    Eof,
    /// Engine is releasing the socket
    Destroying,
}

/// Errors delivered through the engine's error callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SocketErrorCode {
    /// Remote refused the connection
    ConnectionRefused,
    /// Connection reset by the remote
    ConnectionReset,
    /// Connection timed out
    TimedOut,
    /// Code the binding does not know
    Other(i32),
}

impl SocketErrorCode {
    /// Map the engine's numeric error code
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => SocketErrorCode::ConnectionRefused,
            1 => SocketErrorCode::ConnectionReset,
            2 => SocketErrorCode::TimedOut,
            other => SocketErrorCode::Other(other),
        }
    }
}

impl fmt::Display for SocketErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketErrorCode::ConnectionRefused => f.write_str("connection refused"),
            SocketErrorCode::ConnectionReset => f.write_str("connection reset"),
            SocketErrorCode::TimedOut => f.write_str("connection timed out"),
            SocketErrorCode::Other(code) => write!(f, "engine error {code}"),
        }
    }
}

/// Raw packet counters of one context, bucketed by packet size
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextStats {
    /// Received packet buckets
    pub recv: [u32; 5],
    /// Sent packet buckets
    pub send: [u32; 5],
}

/// Counters of one socket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketStats {
    /// Payload bytes received
    pub bytes_recv: u64,
    /// Payload bytes transmitted
    pub bytes_xmit: u64,
    /// Retransmits
    pub rexmit: u32,
    /// Fast retransmits
    pub fast_rexmit: u32,
    /// Packets transmitted
    pub nxmit: u32,
    /// Packets received
    pub nrecv: u32,
    /// Duplicate packets received
    pub nduprecv: u32,
    /// Current MTU estimate
    pub mtu_guess: u32,
}

/// Events the engine raises while one of its entry points runs
///
/// Implementations must only record what happened. Any engine call a
/// callback needs has to be deferred until the entry point returns.
pub trait EngineCallbacks {
    /// Engine wants a datagram sent
    fn on_sendto(&mut self, to: &SockAddr, packet: &[u8]);

    /// Should an incoming connection from `from` be refused?
    fn on_firewall(&mut self, from: &SockAddr) -> bool;

    /// Incoming connection was accepted as `socket`
    fn on_accept(&mut self, socket: SocketId, from: &SockAddr);

    /// Socket changed state
    fn on_state_change(&mut self, socket: SocketId, event: SocketEvent);

    /// Ordered payload arrived on `socket`
    fn on_read(&mut self, socket: SocketId, data: &[u8]);

    /// Socket failed
    fn on_error(&mut self, socket: SocketId, code: SocketErrorCode);

    /// Bytes currently buffered and unread for `socket`
    fn read_buffer_size(&mut self, socket: SocketId) -> usize;
}

/// Entry points of a uTP engine context
///
/// An engine is single threaded: the binding serialises every call behind
/// the owning context's lock. Creating the value initialises the engine
/// context; dropping it destroys the context.
pub trait Engine: Send {
    /// Set a context option, returning the engine's result code
    fn set_option(&mut self, option: UtpOption, value: i32) -> i32;

    /// Read a context option, negative on failure
    fn get_option(&mut self, option: UtpOption) -> i32;

    /// Feed one inbound datagram; true when the engine recognised it
    fn process_udp(&mut self, packet: &[u8], from: &SockAddr, callbacks: &mut dyn EngineCallbacks) -> bool;

    /// Drive retransmission and teardown timers
    fn check_timeouts(&mut self, callbacks: &mut dyn EngineCallbacks);

    /// Send acknowledgements batched during the last burst of packets
    fn issue_deferred_acks(&mut self, callbacks: &mut dyn EngineCallbacks);

    /// Aggregate packet counters
    fn context_stats(&mut self) -> ContextStats;

    /// Allocate a socket, `None` when the engine cannot
    fn create_socket(&mut self) -> Option<SocketId>;

    /// Set a socket option, returning the engine's result code
    fn set_sockopt(&mut self, socket: SocketId, option: UtpOption, value: i32) -> i32;

    /// Read a socket option, negative on failure
    fn get_sockopt(&mut self, socket: SocketId, option: UtpOption) -> i32;

    /// Start connecting `socket` to `to`
    fn connect(&mut self, socket: SocketId, to: &SockAddr, callbacks: &mut dyn EngineCallbacks) -> i32;

    /// Queue bytes for sending; returns the number accepted or a negative code
    fn write(&mut self, socket: SocketId, data: &[u8], callbacks: &mut dyn EngineCallbacks) -> isize;

    /// Application consumed everything delivered so far
    fn read_drained(&mut self, socket: SocketId, callbacks: &mut dyn EngineCallbacks);

    /// Request graceful shutdown of `socket`
    fn close(&mut self, socket: SocketId, callbacks: &mut dyn EngineCallbacks);

    /// Remote address of `socket`, if known
    fn peer_addr(&mut self, socket: SocketId) -> Option<SockAddr>;

    /// Socket counters, `None` when the engine does not track them
    fn socket_stats(&mut self, socket: SocketId) -> Option<SocketStats>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_codes_round_trip() {
        for option in [
            UtpOption::LogNormal,
            UtpOption::LogMtu,
            UtpOption::LogDebug,
            UtpOption::SendBuffer,
            UtpOption::RecvBuffer,
            UtpOption::TargetDelay,
            UtpOption::Raw(99),
        ] {
            assert_eq!(UtpOption::from_code(option.code()), option);
        }
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(SocketErrorCode::from_code(0), SocketErrorCode::ConnectionRefused);
        assert_eq!(SocketErrorCode::from_code(2), SocketErrorCode::TimedOut);
        assert_eq!(SocketErrorCode::from_code(-3), SocketErrorCode::Other(-3));
        assert_eq!(SocketErrorCode::ConnectionReset.to_string(), "connection reset");
    }
}
