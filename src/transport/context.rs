//! Transport context - one engine instance behind one lock

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use socket2::SockAddr;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::addr::UtpAddr;
use crate::engine::{ContextStats, Engine, SocketId, UtpOption};
use crate::error::{Result, UtpError};
use crate::transport::bridge::{Accepted, ConnState, Datagram, Deferred, EventBridge, SocketSignal};
use crate::transport::metrics::{BindingMetrics, BindingStats};
use crate::transport::socket::UtpSocket;
use crate::transport::ContextConfig;

/// Engine plus the bridge that receives its callbacks
struct EngineCore {
    engine: Box<dyn Engine>,
    bridge: EventBridge,
}

impl EngineCore {
    fn run_deferred(&mut self) {
        loop {
            let pending = self.bridge.take_deferred();
            if pending.is_empty() {
                return;
            }
            for call in pending {
                match call {
                    Deferred::Close(socket) => {
                        trace!("Running deferred close of {}", socket);
                        self.engine.close(socket, &mut self.bridge);
                    }
                }
            }
        }
    }
}

struct ContextInner {
    core: Mutex<Option<EngineCore>>,
    signals: Arc<DashMap<SocketId, Arc<SocketSignal>>>,
    outbound: Mutex<Option<mpsc::UnboundedReceiver<Datagram>>>,
    local_addr: RwLock<Option<UtpAddr>>,
    metrics: Arc<BindingMetrics>,
    config: ContextConfig,
}

/// Handle to one engine context
///
/// Cloning is cheap and every clone refers to the same engine. Sockets keep a
/// clone, so the engine outlives every socket created from it unless
/// [`UtpContext::close`] destroys it explicitly.
#[derive(Clone)]
pub struct UtpContext {
    inner: Arc<ContextInner>,
}

impl UtpContext {
    /// Wrap an initialised engine and apply the configured options
    pub fn new(engine: impl Engine + 'static, config: ContextConfig) -> Result<Self> {
        Self::from_boxed(Box::new(engine), config)
    }

    /// Same as [`UtpContext::new`] for an already boxed engine
    pub fn from_boxed(mut engine: Box<dyn Engine>, config: ContextConfig) -> Result<Self> {
        for (option, value) in config.engine_options() {
            UtpError::check("set_option", engine.set_option(option, value))?;
        }

        let signals = Arc::new(DashMap::new());
        let metrics = Arc::new(BindingMetrics::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let bridge = EventBridge::new(signals.clone(), tx, metrics.clone());

        info!(
            "Created uTP context (tick={:?}, dial_timeout={:?})",
            config.tick_interval(),
            config.dial_timeout()
        );

        Ok(Self {
            inner: Arc::new(ContextInner {
                core: Mutex::new(Some(EngineCore { engine, bridge })),
                signals,
                outbound: Mutex::new(Some(rx)),
                local_addr: RwLock::new(None),
                metrics,
                config,
            }),
        })
    }

    /// Run `op` with exclusive access to the engine
    ///
    /// This is the only path into the engine. Deferred follow-up calls queued
    /// by callbacks run before the lock is released.
    pub(crate) fn enter<R>(&self, op: impl FnOnce(&mut dyn Engine, &mut EventBridge) -> R) -> Result<R> {
        let mut guard = self.inner.core.lock();
        let core = guard.as_mut().ok_or(UtpError::ContextClosed)?;
        let result = op(core.engine.as_mut(), &mut core.bridge);
        core.run_deferred();
        Ok(result)
    }

    /// Destroy the engine
    ///
    /// One-shot: the first call releases the engine and wakes every task
    /// waiting on one of its sockets; later calls return `Ok(())` and do
    /// nothing. Every other operation fails with `ContextClosed` afterwards.
    pub fn close(&self) -> Result<()> {
        let core = self.inner.core.lock().take();
        let Some(core) = core else {
            debug!("uTP context already closed");
            return Ok(());
        };
        drop(core);

        for entry in self.inner.signals.iter() {
            entry.value().mark_closed();
        }
        self.inner.signals.clear();
        info!("Closed uTP context");
        Ok(())
    }

    /// True once [`UtpContext::close`] has run
    pub fn is_closed(&self) -> bool {
        self.inner.core.lock().is_none()
    }

    /// Set a context option
    pub fn set_option(&self, option: UtpOption, value: i32) -> Result<i32> {
        let code = self.enter(|engine, _| engine.set_option(option, value))?;
        UtpError::check("set_option", code)
    }

    /// Read a context option
    pub fn get_option(&self, option: UtpOption) -> Result<i32> {
        let code = self.enter(|engine, _| engine.get_option(option))?;
        UtpError::check("get_option", code)
    }

    /// Hand one received datagram to the engine
    ///
    /// Returns whether the engine recognised it as uTP traffic.
    pub fn pump(&self, packet: &[u8], from: SocketAddr) -> Result<bool> {
        let source = SockAddr::from(from);
        let consumed = self.enter(|engine, bridge| engine.process_udp(packet, &source, bridge))?;
        self.inner.metrics.record_pumped(consumed);
        if !consumed {
            trace!("Engine ignored {} byte datagram from {}", packet.len(), from);
        }
        Ok(consumed)
    }

    /// Drive retransmission and teardown timers
    ///
    /// Call every [`ContextConfig::tick_interval`].
    pub fn tick(&self) -> Result<()> {
        self.enter(|engine, bridge| engine.check_timeouts(bridge))
    }

    /// Send acknowledgements batched during the last burst of [`pump`](Self::pump) calls
    pub fn flush_deferred_acks(&self) -> Result<()> {
        self.enter(|engine, bridge| engine.issue_deferred_acks(bridge))
    }

    /// Engine packet counters
    pub fn stats(&self) -> Result<ContextStats> {
        self.enter(|engine, _| engine.context_stats())
    }

    /// Binding-side counters
    pub fn binding_stats(&self) -> BindingStats {
        self.inner.metrics.snapshot(self.inner.signals.len())
    }

    /// Allocate a new socket on this context
    pub fn create_socket(&self) -> Result<UtpSocket> {
        let (id, signal) = self.enter(|engine, bridge| {
            let id = engine.create_socket().ok_or(UtpError::Engine {
                op: "create_socket",
                code: -1,
            })?;
            Ok::<_, UtpError>((id, bridge.register(id, ConnState::Unconnected)))
        })??;

        debug!("Created {}", id);
        Ok(UtpSocket::new(self.clone(), id, signal))
    }

    /// Take the queue of datagrams the engine wants sent
    ///
    /// Exactly one packet I/O loop may own it; later calls return `None`.
    pub fn take_outbound(&self) -> Option<mpsc::UnboundedReceiver<Datagram>> {
        self.inner.outbound.lock().take()
    }

    /// Hand the outbound queue back so another driver can take it
    pub(crate) fn restore_outbound(&self, outbound: mpsc::UnboundedReceiver<Datagram>) {
        *self.inner.outbound.lock() = Some(outbound);
    }

    /// Address the packet I/O loop is bound to
    pub fn local_addr(&self) -> Option<UtpAddr> {
        self.inner.local_addr.read().clone()
    }

    /// Record the address the packet I/O loop is bound to
    pub fn set_local_addr(&self, addr: UtpAddr) {
        *self.inner.local_addr.write() = Some(addr);
    }

    /// Configuration this context was created with
    pub fn config(&self) -> &ContextConfig {
        &self.inner.config
    }

    pub(crate) fn metrics(&self) -> &BindingMetrics {
        &self.inner.metrics
    }

    /// Start routing incoming connections to a new receiver
    ///
    /// Replaces any previous listener.
    pub(crate) fn listen(&self) -> Result<mpsc::UnboundedReceiver<Accepted>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.enter(|_, bridge| bridge.set_incoming(Some(tx)))?;
        Ok(rx)
    }

    /// Forget the listener if its receiver is gone
    pub(crate) fn stop_listening(&self) {
        if let Err(e) = self.enter(|_, bridge| bridge.drop_closed_listener()) {
            trace!("Listener stop on closed context: {}", e);
        }
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if self.core.get_mut().take().is_some() {
            warn!("uTP context dropped without close, releasing engine");
        }
    }
}
