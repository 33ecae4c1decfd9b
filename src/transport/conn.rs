//! Stream connections over uTP sockets
//!
//! [`UtpConn`] gives application code ordinary connection semantics on top of
//! a [`UtpSocket`]: dial, read, write, close and addresses. Reads and writes
//! wait on the socket's signal, which the packet I/O loop feeds while it pumps
//! the engine, so any number of tasks can use connections of one context.

use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::addr::{resolve, UtpAddr};
use crate::error::{Result, UtpError};
use crate::transport::bridge::{Accepted, ConnState, SocketSignal};
use crate::transport::context::UtpContext;
use crate::transport::socket::UtpSocket;

async fn within<T>(limit: Option<Duration>, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| UtpError::Timeout(limit))?,
        None => fut.await,
    }
}

// Outcome for a waiter once the connection left the established state.
fn interrupted<T>(state: ConnState) -> Option<Result<T>> {
    match state {
        ConnState::Established => None,
        ConnState::Errored(code) => Some(Err(UtpError::Connection(code))),
        _ => Some(Err(UtpError::AlreadyClosed)),
    }
}

// Requested local address reconciled with the one the context is bound to.
fn local_for_dial(bound: Option<UtpAddr>, requested: Option<&UtpAddr>) -> Result<UtpAddr> {
    let (bound, requested) = match (bound, requested) {
        (None, requested) => return Ok(requested.cloned().unwrap_or_else(|| UtpAddr::unspecified(0))),
        (Some(bound), None) => return Ok(bound),
        (Some(bound), Some(requested)) => (bound, requested),
    };

    let port_ok = requested.port() == 0 || requested.port() == bound.port();
    let ip_ok = requested.is_wildcard() || bound.is_wildcard() || same_ip(&requested, &bound);
    if !(port_ok && ip_ok) {
        return Err(UtpError::InvalidAddress(format!(
            "local address {requested} does not match bound address {bound}"
        )));
    }

    if requested.is_wildcard() {
        return Ok(bound);
    }
    Ok(requested.clone().with_port(bound.port()))
}

fn same_ip(a: &UtpAddr, b: &UtpAddr) -> bool {
    let canonical = |addr: &UtpAddr| addr.ip().map(|ip| ip.to_canonical());
    canonical(a) == canonical(b)
}

/// Established uTP connection
#[derive(Debug)]
pub struct UtpConn {
    socket: UtpSocket,
    local: UtpAddr,
    remote: UtpAddr,
    read_timeout: Mutex<Option<Duration>>,
    write_timeout: Mutex<Option<Duration>>,
}

impl UtpConn {
    fn new(socket: UtpSocket, local: UtpAddr, remote: UtpAddr) -> Self {
        Self {
            socket,
            local,
            remote,
            read_timeout: Mutex::new(None),
            write_timeout: Mutex::new(None),
        }
    }

    /// Connect to `raddr` and wait until the engine reports the outcome
    ///
    /// All sockets of a context share the packet loop's UDP socket, so
    /// `laddr` cannot pick a different one. When the context has a bound
    /// address, `laddr` must match its port (or be 0) and its IP (or be a
    /// wildcard); anything else is `InvalidAddress`. `laddr` defaults to the
    /// bound address. Without a signal inside `timeout` the attempt is closed
    /// and `Timeout` returned; the context stays usable and safe to close.
    pub async fn dial(ctx: &UtpContext, laddr: Option<&UtpAddr>, raddr: &UtpAddr, timeout: Duration) -> Result<Self> {
        let local = local_for_dial(ctx.local_addr(), laddr)?;

        let socket = ctx.create_socket()?;
        let started = Instant::now();
        ctx.metrics().record_dial_started();
        debug!("Dialing {} from {}", raddr, local);

        if let Err(e) = socket.connect(Some(raddr)) {
            ctx.metrics().record_dial_failed();
            return Err(e);
        }

        let established = socket.signal().wait_until(|st| match st.conn {
            ConnState::Unconnected | ConnState::Connecting => None,
            ConnState::Established => Some(Ok(())),
            ConnState::Errored(code) => Some(Err(UtpError::Connection(code))),
            ConnState::Closing | ConnState::Closed => Some(Err(UtpError::AlreadyClosed)),
        });

        match tokio::time::timeout(timeout, established).await {
            Ok(Ok(())) => {
                let latency = started.elapsed();
                ctx.metrics().record_dial_established(latency);
                info!("Connected to {} in {:?}", raddr, latency);
                Ok(Self::new(socket, local, raddr.clone()))
            }
            Ok(Err(e)) => {
                ctx.metrics().record_dial_failed();
                warn!("Dial to {} failed: {}", raddr, e);
                if let Err(close_err) = socket.close() {
                    debug!("Close after failed dial: {}", close_err);
                }
                Err(e)
            }
            Err(_) => {
                ctx.metrics().record_dial_timed_out();
                warn!("Dial to {} timed out after {:?}", raddr, timeout);
                if let Err(close_err) = socket.close() {
                    debug!("Close after dial timeout: {}", close_err);
                }
                Err(UtpError::Timeout(timeout))
            }
        }
    }

    /// Resolve textual addresses on `network` and [`dial`](Self::dial)
    pub async fn dial_str(
        ctx: &UtpContext,
        network: &str,
        laddr: Option<&str>,
        raddr: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let local = laddr.map(|text| resolve(network, text)).transpose()?;
        let remote = resolve(network, raddr)?;
        Self::dial(ctx, local.as_ref(), &remote, timeout).await
    }

    /// Local end point
    pub fn local_addr(&self) -> &UtpAddr {
        &self.local
    }

    /// Remote end point
    pub fn remote_addr(&self) -> &UtpAddr {
        &self.remote
    }

    /// Current connection state
    pub fn state(&self) -> ConnState {
        self.socket.state()
    }

    /// Underlying socket, for options and statistics
    pub fn socket(&self) -> &UtpSocket {
        &self.socket
    }

    /// Bound every later [`read`](Self::read); `None` waits forever
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        *self.read_timeout.lock() = timeout;
    }

    /// Bound every later [`write`](Self::write); `None` waits forever
    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        *self.write_timeout.lock() = timeout;
    }

    fn ensure_established(&self) -> Result<()> {
        match self.socket.state() {
            ConnState::Established => Ok(()),
            _ => Err(UtpError::NotConnected),
        }
    }

    /// Read buffered bytes, waiting for data if none are buffered
    ///
    /// Returns `Ok(0)` once the remote has finished sending and everything
    /// before that has been read.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_established()?;
        if buf.is_empty() {
            return Ok(0);
        }

        let signal: &SocketSignal = self.socket.signal();
        let limit = *self.read_timeout.lock();
        let (n, drained) = within(
            limit,
            signal.wait_until(|st| {
                if !st.recv.is_empty() {
                    return Some(Ok(SocketSignal::take_into(st, &mut *buf)));
                }
                if st.eof {
                    return Some(Ok((0, false)));
                }
                interrupted(st.conn)
            }),
        )
        .await?;

        if drained {
            // The bytes are already copied out; a socket closed in the
            // meantime only means nobody needs the window reopened.
            if let Err(e) = self.socket.read_drained() {
                trace!("Skipping read_drained: {}", e);
            }
        }
        Ok(n)
    }

    /// Queue bytes for sending
    ///
    /// Waits for a writable signal while the engine's send window is full,
    /// then returns how many bytes were queued. That may be fewer than
    /// `buf.len()`; writing the rest is the caller's job.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.ensure_established()?;
        if buf.is_empty() {
            return Ok(0);
        }

        let limit = *self.write_timeout.lock();
        within(limit, self.write_when_writable(buf)).await
    }

    async fn write_when_writable(&self, buf: &[u8]) -> Result<usize> {
        let signal = self.socket.signal();
        loop {
            let epoch = signal.writable_epoch();
            let written = self.socket.write(buf)?;
            if written > 0 {
                return Ok(written);
            }

            trace!("Send window full, waiting for writable");
            signal
                .wait_until(|st| {
                    if st.writable_epoch != epoch {
                        return Some(Ok(()));
                    }
                    interrupted(st.conn)
                })
                .await?;
        }
    }

    /// Close the connection; idempotent
    pub fn close(&self) -> Result<()> {
        self.socket.close()
    }
}

/// Accepts incoming uTP connections on a context
///
/// While a listener exists the context admits incoming connections; without
/// one they are refused. Binding a second listener replaces the first.
pub struct UtpListener {
    ctx: UtpContext,
    incoming: mpsc::UnboundedReceiver<Accepted>,
}

impl UtpListener {
    /// Start accepting connections on `ctx`
    pub fn bind(ctx: &UtpContext) -> Result<Self> {
        let incoming = ctx.listen()?;
        info!("Listening for uTP connections on {}", crate::addr::display_opt(ctx.local_addr().as_ref()));
        Ok(Self {
            ctx: ctx.clone(),
            incoming,
        })
    }

    /// Wait for the next incoming connection
    pub async fn accept(&mut self) -> Result<UtpConn> {
        let accepted = self.incoming.recv().await.ok_or(UtpError::AlreadyClosed)?;
        let local = self.ctx.local_addr().unwrap_or_else(|| UtpAddr::unspecified(0));
        let socket = UtpSocket::new(self.ctx.clone(), accepted.socket, accepted.signal);
        Ok(UtpConn::new(socket, local, accepted.peer))
    }

    /// Address incoming connections arrive on
    pub fn local_addr(&self) -> Option<UtpAddr> {
        self.ctx.local_addr()
    }
}

impl Drop for UtpListener {
    fn drop(&mut self) {
        self.incoming.close();
        // Connections accepted but never picked up still own engine sockets.
        while let Ok(accepted) = self.incoming.try_recv() {
            drop(UtpSocket::new(self.ctx.clone(), accepted.socket, accepted.signal));
        }
        self.ctx.stop_listening();
    }
}
