//! uTP binding - connections over an external uTP protocol engine
//!
//! This crate binds a uTP (Micro Transport Protocol) engine into async Rust.
//! The engine implements the wire protocol; the binding supplies everything
//! around it:
//! - address resolution and conversion to and from native socket addresses
//! - a lock-serialised engine context fed by a UDP packet loop
//! - sockets with handles released exactly once
//! - connections with blocking-style dial, read, write and close
//!
//! Any engine implementing [`engine::Engine`] can be used. With the `libutp`
//! feature the C libutp library is available as [`engine::libutp::LibUtp`].

#![warn(missing_docs)]

pub mod addr;
pub mod config;
pub mod engine;
pub mod error;
pub mod transport;

use tracing::info;

pub use addr::{resolve, Network, UtpAddr};
pub use config::UtpConfig;
pub use engine::{ContextStats, Engine, EngineCallbacks, SocketErrorCode, SocketEvent, SocketId, SocketStats, UtpOption};
pub use error::{Result, UtpError};
pub use transport::{
    BindingStats, ConnState, ContextConfig, DriverConfig, UtpConn, UtpContext, UtpDriver, UtpListener, UtpSocket,
};

/// Default engine timer interval in milliseconds
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 500;

/// Default dial timeout in milliseconds
pub const DEFAULT_DIAL_TIMEOUT_MS: u64 = 10_000;

/// Builder for a context with its packet driver attached
pub struct UtpBuilder {
    config: UtpConfig,
}

impl UtpBuilder {
    /// Create a new builder with default config
    pub fn new() -> Self {
        Self {
            config: UtpConfig::default(),
        }
    }

    /// Set custom configuration
    pub fn with_config(mut self, config: UtpConfig) -> Self {
        self.config = config;
        self
    }

    /// Create the context around `engine` and start its packet driver
    ///
    /// Must run inside a tokio runtime.
    pub fn build(self, engine: impl Engine + 'static) -> Result<Utp> {
        let context = UtpContext::new(engine, self.config.context.clone())?;
        let driver = match UtpDriver::spawn(&context, self.config.driver.clone()) {
            Ok(driver) => driver,
            Err(e) => {
                context.close()?;
                return Err(e);
            }
        };
        Ok(Utp {
            context,
            driver,
            config: self.config,
        })
    }
}

impl Default for UtpBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Running uTP endpoint: a context plus the driver feeding it
pub struct Utp {
    context: UtpContext,
    driver: UtpDriver,
    config: UtpConfig,
}

impl Utp {
    /// Engine context
    pub fn context(&self) -> &UtpContext {
        &self.context
    }

    /// UDP address the driver is bound to
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.driver.local_addr()
    }

    /// Get current configuration
    pub fn config(&self) -> &UtpConfig {
        &self.config
    }

    /// Dial `raddr` with the configured dial timeout
    pub async fn dial(&self, raddr: &UtpAddr) -> Result<UtpConn> {
        UtpConn::dial(&self.context, None, raddr, self.config.context.dial_timeout()).await
    }

    /// Start accepting incoming connections
    pub fn listen(&self) -> Result<UtpListener> {
        UtpListener::bind(&self.context)
    }

    /// Stop the driver and destroy the engine
    pub async fn shutdown(self) -> Result<()> {
        let local = self.driver.local_addr();
        self.driver.shutdown().await;
        self.context.close()?;
        info!("uTP endpoint on {} shut down", local);
        Ok(())
    }
}
