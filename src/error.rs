//! Error types for the uTP binding

use std::time::Duration;
use thiserror::Error;

use crate::engine::SocketErrorCode;

/// Errors surfaced by the binding layer
#[derive(Debug, Error)]
pub enum UtpError {
    /// Network label outside `""`, `utp`, `utp4`, `utp6`
    #[error("unknown network {0}")]
    UnknownNetwork(String),

    /// System name or address resolution failed
    #[error("failed to resolve {address}: {reason}")]
    Resolution {
        /// Text that was being resolved
        address: String,
        /// Resolver failure description
        reason: String,
    },

    /// Missing or unusable address
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Negative result code returned by an engine entry point
    #[error("engine {op} failed with code {code}")]
    Engine {
        /// Engine entry point that failed
        op: &'static str,
        /// Result code, verbatim
        code: i32,
    },

    /// Error reported by the engine through its error callback
    #[error("connection error: {0}")]
    Connection(SocketErrorCode),

    /// Operation requires an established connection
    #[error("not connected")]
    NotConnected,

    /// Socket or connection was already closed
    #[error("socket already closed")]
    AlreadyClosed,

    /// Context was already destroyed
    #[error("transport context already closed")]
    ContextClosed,

    /// No engine signal arrived within the caller's bound
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Configuration could not be loaded
    #[error("configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    /// UDP I/O failure in the packet driver
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl UtpError {
    /// Map an engine result code, passing non-negative values through
    pub(crate) fn check(op: &'static str, code: i32) -> Result<i32> {
        if code < 0 {
            Err(UtpError::Engine { op, code })
        } else {
            Ok(code)
        }
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, UtpError>;
