//! Transport socket - one engine socket owned by a context

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::addr::UtpAddr;
use crate::engine::{SocketErrorCode, SocketId, SocketStats, UtpOption};
use crate::error::{Result, UtpError};
use crate::transport::bridge::{ConnState, SocketSignal};
use crate::transport::context::UtpContext;

/// Engine socket identity, released exactly once
///
/// Not `Clone`: the id leaves the handle only while the owning socket's lock
/// is held, and `release` empties it for good.
#[derive(Debug)]
struct SocketHandle {
    id: Option<SocketId>,
}

impl SocketHandle {
    fn live(&self) -> Result<SocketId> {
        self.id.ok_or(UtpError::AlreadyClosed)
    }

    fn release(&mut self) -> Option<SocketId> {
        self.id.take()
    }
}

/// One uTP connection or connection attempt
///
/// Calls that reach the engine take the context lock first and the socket
/// lock second. A closed socket fails every such call with `AlreadyClosed`
/// before either lock is taken.
pub struct UtpSocket {
    ctx: UtpContext,
    handle: Mutex<SocketHandle>,
    closed: AtomicBool,
    signal: Arc<SocketSignal>,
}

impl UtpSocket {
    pub(crate) fn new(ctx: UtpContext, id: SocketId, signal: Arc<SocketSignal>) -> Self {
        Self {
            ctx,
            handle: Mutex::new(SocketHandle { id: Some(id) }),
            closed: AtomicBool::new(false),
            signal,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(UtpError::AlreadyClosed)
        } else {
            Ok(())
        }
    }

    /// Start connecting to `remote`
    ///
    /// Completion is asynchronous; watch [`UtpSocket::state`] or use
    /// [`crate::transport::UtpConn::dial`].
    pub fn connect(&self, remote: Option<&UtpAddr>) -> Result<()> {
        self.ensure_open()?;
        let remote = remote.ok_or_else(|| UtpError::InvalidAddress("no address given".into()))?;
        let to = remote.to_engine_sockaddr()?;

        let code = self.ctx.enter(|engine, bridge| {
            let handle = self.handle.lock();
            let id = handle.live()?;
            self.signal.mark_connecting();
            let code = engine.connect(id, &to, bridge);
            debug!("{} connecting to {} (code {})", id, remote, code);
            Ok::<_, UtpError>(code)
        })??;

        if code < 0 {
            self.signal.apply_error(SocketErrorCode::Other(code));
        }
        UtpError::check("connect", code).map(|_| ())
    }

    /// Queue bytes for sending
    ///
    /// The engine may accept fewer bytes than offered when its send window
    /// is full. That is not an error: retrying the remainder is up to the
    /// caller, typically after a writable signal.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        if buf.is_empty() {
            return Ok(0);
        }

        let written = self.ctx.enter(|engine, bridge| {
            let handle = self.handle.lock();
            Ok::<_, UtpError>(engine.write(handle.live()?, buf, bridge))
        })??;

        if written < 0 {
            return Err(UtpError::Engine {
                op: "write",
                code: i32::try_from(written).unwrap_or(i32::MIN),
            });
        }
        let written = written as usize;
        self.ctx.metrics().record_bytes_written(written);
        trace!("Queued {} of {} bytes", written, buf.len());
        Ok(written)
    }

    /// Set a per-socket option
    pub fn set_sockopt(&self, option: UtpOption, value: i32) -> Result<i32> {
        self.ensure_open()?;
        let code = self.ctx.enter(|engine, _| {
            let handle = self.handle.lock();
            Ok::<_, UtpError>(engine.set_sockopt(handle.live()?, option, value))
        })??;
        UtpError::check("setsockopt", code)
    }

    /// Read a per-socket option
    pub fn get_sockopt(&self, option: UtpOption) -> Result<i32> {
        self.ensure_open()?;
        let code = self.ctx.enter(|engine, _| {
            let handle = self.handle.lock();
            Ok::<_, UtpError>(engine.get_sockopt(handle.live()?, option))
        })??;
        UtpError::check("getsockopt", code)
    }

    /// Engine counters for this socket
    pub fn stats(&self) -> Result<Option<SocketStats>> {
        self.ensure_open()?;
        self.ctx.enter(|engine, _| {
            let handle = self.handle.lock();
            Ok::<_, UtpError>(engine.socket_stats(handle.live()?))
        })?
    }

    /// Remote address as known to the engine
    pub fn peer_addr(&self) -> Result<Option<UtpAddr>> {
        self.ensure_open()?;
        let peer = self.ctx.enter(|engine, _| {
            let handle = self.handle.lock();
            Ok::<_, UtpError>(engine.peer_addr(handle.live()?))
        })??;
        Ok(peer.as_ref().and_then(UtpAddr::from_engine_sockaddr))
    }

    /// Tell the engine everything delivered so far has been consumed
    pub(crate) fn read_drained(&self) -> Result<()> {
        self.ensure_open()?;
        self.ctx.enter(|engine, bridge| {
            let handle = self.handle.lock();
            engine.read_drained(handle.live()?, bridge);
            Ok::<_, UtpError>(())
        })?
    }

    /// Request graceful shutdown
    ///
    /// Idempotent: only the first call reaches the engine. Tasks waiting on
    /// this socket are woken and see it closing.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.signal.mark_closing();

        let result = self.ctx.enter(|engine, bridge| {
            let mut handle = self.handle.lock();
            if let Some(id) = handle.release() {
                engine.close(id, bridge);
                debug!("Closed {}", id);
            }
        });

        match result {
            // The engine went away with its context; nothing left to release.
            Err(UtpError::ContextClosed) => {
                self.handle.lock().release();
                self.signal.mark_closed();
                Ok(())
            }
            other => other,
        }
    }

    /// True once [`UtpSocket::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Connection state from the callback bridge
    pub fn state(&self) -> ConnState {
        self.signal.state()
    }

    /// Context that owns this socket
    pub fn context(&self) -> &UtpContext {
        &self.ctx
    }

    pub(crate) fn signal(&self) -> &Arc<SocketSignal> {
        &self.signal
    }
}

impl Drop for UtpSocket {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!("Close on drop failed: {}", e);
        }
    }
}

impl std::fmt::Debug for UtpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UtpSocket")
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}
