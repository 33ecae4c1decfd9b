//! Callback bridge between the engine and waiting application tasks
//!
//! The engine reports connection events synchronously from inside its entry
//! points. [`EventBridge`] receives them while the context lock is held,
//! records them on per-socket [`SocketSignal`]s and wakes whoever waits there.
//! It never calls the engine; follow-up calls are queued as [`Deferred`] and
//! run by the context once the entry point has returned.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use socket2::SockAddr;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};

use crate::addr::UtpAddr;
use crate::engine::{EngineCallbacks, SocketErrorCode, SocketEvent, SocketId};
use crate::transport::metrics::BindingMetrics;

/// Connection state as seen by the binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnState {
    /// Socket created, no connect issued
    Unconnected,
    /// Connect issued, waiting for the engine
    Connecting,
    /// Connection usable for reads and writes
    Established,
    /// Close requested, engine tearing down
    Closing,
    /// Engine released the socket or the context went away
    Closed,
    /// Engine reported an error
    Errored(SocketErrorCode),
}

/// Datagram the engine wants on the wire
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Destination
    pub to: SocketAddr,
    /// Packet bytes
    pub payload: Bytes,
}

/// Incoming connection handed to a listener
#[derive(Debug)]
pub(crate) struct Accepted {
    pub socket: SocketId,
    pub peer: UtpAddr,
    pub signal: Arc<SocketSignal>,
}

/// Engine call a callback asked for, run after the entry point returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Deferred {
    /// Close a socket nobody will accept
    Close(SocketId),
}

#[derive(Debug)]
pub(crate) struct SignalState {
    pub conn: ConnState,
    pub recv: BytesMut,
    pub eof: bool,
    pub writable_epoch: u64,
}

/// Per-socket state shared by the I/O loop and waiting tasks
#[derive(Debug)]
pub struct SocketSignal {
    state: Mutex<SignalState>,
    notify: Notify,
}

impl SocketSignal {
    pub(crate) fn new(conn: ConnState) -> Self {
        Self {
            state: Mutex::new(SignalState {
                conn,
                recv: BytesMut::new(),
                eof: false,
                writable_epoch: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnState {
        self.state.lock().conn
    }

    /// Bytes delivered by the engine and not yet read
    pub fn buffered(&self) -> usize {
        self.state.lock().recv.len()
    }

    pub(crate) fn writable_epoch(&self) -> u64 {
        self.state.lock().writable_epoch
    }

    /// Apply a change and wake every waiter
    pub(crate) fn publish<R>(&self, change: impl FnOnce(&mut SignalState) -> R) -> R {
        let result = change(&mut self.state.lock());
        self.notify.notify_waiters();
        result
    }

    /// Wait until `check` yields a value
    ///
    /// `check` runs under the signal lock and must not block or touch the
    /// engine.
    pub(crate) async fn wait_until<T>(&self, mut check: impl FnMut(&mut SignalState) -> Option<T>) -> T {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = check(&mut self.state.lock()) {
                return value;
            }
            notified.await;
        }
    }

    pub(crate) fn mark_connecting(&self) {
        self.publish(|st| {
            if st.conn == ConnState::Unconnected {
                st.conn = ConnState::Connecting;
            }
        });
    }

    pub(crate) fn mark_closing(&self) {
        self.publish(|st| {
            st.conn = match st.conn {
                ConnState::Connecting | ConnState::Established => ConnState::Closing,
                ConnState::Unconnected => ConnState::Closed,
                other => other,
            };
        });
    }

    pub(crate) fn mark_closed(&self) {
        self.publish(|st| {
            if !matches!(st.conn, ConnState::Errored(_)) {
                st.conn = ConnState::Closed;
            }
        });
    }

    fn apply_event(&self, event: SocketEvent) -> ConnState {
        self.publish(|st| {
            match event {
                SocketEvent::Connect => {
                    if matches!(st.conn, ConnState::Unconnected | ConnState::Connecting) {
                        st.conn = ConnState::Established;
                    }
                }
                SocketEvent::Writable => st.writable_epoch = st.writable_epoch.wrapping_add(1),
                SocketEvent::Eof => st.eof = true,
                SocketEvent::Destroying => {
                    if !matches!(st.conn, ConnState::Errored(_)) {
                        st.conn = ConnState::Closed;
                    }
                }
            }
            st.conn
        })
    }

    pub(crate) fn apply_error(&self, code: SocketErrorCode) {
        self.publish(|st| {
            if matches!(st.conn, ConnState::Connecting | ConnState::Established) {
                st.conn = ConnState::Errored(code);
            }
        });
    }

    fn deliver(&self, data: &[u8]) {
        self.publish(|st| st.recv.extend_from_slice(data));
    }

    /// Copy buffered bytes into `buf`; true in the second slot when drained
    pub(crate) fn take_into(st: &mut SignalState, buf: &mut [u8]) -> (usize, bool) {
        let n = buf.len().min(st.recv.len());
        buf[..n].copy_from_slice(&st.recv[..n]);
        st.recv.advance(n);
        (n, st.recv.is_empty())
    }
}

/// Receives engine callbacks for one context
pub(crate) struct EventBridge {
    signals: Arc<DashMap<SocketId, Arc<SocketSignal>>>,
    outbound: mpsc::UnboundedSender<Datagram>,
    incoming: Option<mpsc::UnboundedSender<Accepted>>,
    deferred: Vec<Deferred>,
    metrics: Arc<BindingMetrics>,
}

impl EventBridge {
    pub fn new(
        signals: Arc<DashMap<SocketId, Arc<SocketSignal>>>,
        outbound: mpsc::UnboundedSender<Datagram>,
        metrics: Arc<BindingMetrics>,
    ) -> Self {
        Self {
            signals,
            outbound,
            incoming: None,
            deferred: Vec::new(),
            metrics,
        }
    }

    pub fn register(&mut self, socket: SocketId, state: ConnState) -> Arc<SocketSignal> {
        let signal = Arc::new(SocketSignal::new(state));
        self.signals.insert(socket, signal.clone());
        signal
    }

    pub fn set_incoming(&mut self, incoming: Option<mpsc::UnboundedSender<Accepted>>) {
        self.incoming = incoming;
    }

    pub fn drop_closed_listener(&mut self) {
        if self.incoming.as_ref().is_some_and(|tx| tx.is_closed()) {
            self.incoming = None;
        }
    }

    fn accepting(&self) -> bool {
        self.incoming.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    pub fn take_deferred(&mut self) -> Vec<Deferred> {
        std::mem::take(&mut self.deferred)
    }

    fn signal(&self, socket: SocketId) -> Option<Arc<SocketSignal>> {
        self.signals.get(&socket).map(|entry| entry.value().clone())
    }
}

impl EngineCallbacks for EventBridge {
    fn on_sendto(&mut self, to: &SockAddr, packet: &[u8]) {
        let Some(to) = to.as_socket() else {
            warn!("Dropping outbound datagram to non-IP address");
            return;
        };
        let datagram = Datagram {
            to,
            payload: Bytes::copy_from_slice(packet),
        };
        if self.outbound.send(datagram).is_err() {
            trace!("No packet driver attached, dropping datagram to {}", to);
            return;
        }
        self.metrics.record_datagram_emitted(packet.len());
    }

    fn on_firewall(&mut self, from: &SockAddr) -> bool {
        let refuse = !self.accepting();
        if refuse {
            debug!("Refusing incoming connection from {:?}, no listener", from.as_socket());
        }
        refuse
    }

    fn on_accept(&mut self, socket: SocketId, from: &SockAddr) {
        let peer = UtpAddr::from_engine_sockaddr(from).unwrap_or_default();
        let signal = self.register(socket, ConnState::Established);

        let delivered = match &self.incoming {
            Some(tx) => tx
                .send(Accepted {
                    socket,
                    peer: peer.clone(),
                    signal,
                })
                .is_ok(),
            None => false,
        };

        if delivered {
            debug!("Accepted {} from {}", socket, peer);
            self.metrics.record_accepted();
        } else {
            debug!("Listener gone, closing {} from {}", socket, peer);
            self.deferred.push(Deferred::Close(socket));
        }
    }

    fn on_state_change(&mut self, socket: SocketId, event: SocketEvent) {
        let Some(signal) = self.signal(socket) else {
            trace!("State change {:?} for unknown {}", event, socket);
            return;
        };
        let state = signal.apply_event(event);
        trace!("{} {:?} -> {:?}", socket, event, state);

        if event == SocketEvent::Destroying {
            self.signals.remove(&socket);
        }
    }

    fn on_read(&mut self, socket: SocketId, data: &[u8]) {
        match self.signal(socket) {
            Some(signal) => {
                signal.deliver(data);
                self.metrics.record_bytes_delivered(data.len());
            }
            None => warn!("Dropping {} bytes read for unknown {}", data.len(), socket),
        }
    }

    fn on_error(&mut self, socket: SocketId, code: SocketErrorCode) {
        debug!("{} reported {}", socket, code);
        if let Some(signal) = self.signal(socket) {
            signal.apply_error(code);
        }
    }

    fn read_buffer_size(&mut self, socket: SocketId) -> usize {
        self.signal(socket).map_or(0, |signal| signal.buffered())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};

    fn bridge() -> (EventBridge, mpsc::UnboundedReceiver<Datagram>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bridge = EventBridge::new(Arc::new(DashMap::new()), tx, Arc::new(BindingMetrics::new()));
        (bridge, rx)
    }

    #[test]
    fn test_connect_then_destroy() {
        let (mut bridge, _rx) = bridge();
        let signal = bridge.register(SocketId(1), ConnState::Unconnected);
        signal.mark_connecting();
        bridge.on_state_change(SocketId(1), SocketEvent::Connect);
        assert_eq!(signal.state(), ConnState::Established);

        bridge.on_state_change(SocketId(1), SocketEvent::Destroying);
        assert_eq!(signal.state(), ConnState::Closed);
        assert!(bridge.signal(SocketId(1)).is_none());
    }

    #[test]
    fn test_error_is_terminal() {
        let (mut bridge, _rx) = bridge();
        let signal = bridge.register(SocketId(2), ConnState::Connecting);
        bridge.on_error(SocketId(2), SocketErrorCode::ConnectionRefused);
        assert_eq!(signal.state(), ConnState::Errored(SocketErrorCode::ConnectionRefused));

        bridge.on_state_change(SocketId(2), SocketEvent::Connect);
        bridge.on_state_change(SocketId(2), SocketEvent::Destroying);
        assert_eq!(signal.state(), ConnState::Errored(SocketErrorCode::ConnectionRefused));
    }

    #[test]
    fn test_error_ignored_before_connect() {
        let (mut bridge, _rx) = bridge();
        let signal = bridge.register(SocketId(3), ConnState::Unconnected);
        bridge.on_error(SocketId(3), SocketErrorCode::TimedOut);
        assert_eq!(signal.state(), ConnState::Unconnected);
    }

    #[test]
    fn test_reads_buffer_and_report_size() {
        let (mut bridge, _rx) = bridge();
        let signal = bridge.register(SocketId(4), ConnState::Established);
        bridge.on_read(SocketId(4), b"hello ");
        bridge.on_read(SocketId(4), b"world");
        assert_eq!(bridge.read_buffer_size(SocketId(4)), 11);

        let mut buf = [0u8; 8];
        let (n, drained) = SocketSignal::take_into(&mut signal.state.lock(), &mut buf);
        assert_eq!((n, drained), (8, false));
        assert_eq!(&buf, b"hello wo");
        assert_eq!(signal.buffered(), 3);
    }

    #[test]
    fn test_sendto_reaches_outbound_queue() {
        let (mut bridge, mut rx) = bridge();
        let to = SocketAddr::from((Ipv4Addr::LOCALHOST, 6881));
        bridge.on_sendto(&SockAddr::from(to), b"syn");

        let datagram = rx.try_recv().unwrap();
        assert_eq!(datagram.to, to);
        assert_eq!(&datagram.payload[..], b"syn");
    }

    #[test]
    fn test_accept_without_listener_defers_close() {
        let (mut bridge, _rx) = bridge();
        let from = SockAddr::from(SocketAddr::from((Ipv4Addr::LOCALHOST, 1)));
        assert!(bridge.on_firewall(&from));

        bridge.on_accept(SocketId(9), &from);
        assert_eq!(bridge.take_deferred(), vec![Deferred::Close(SocketId(9))]);
        assert!(bridge.take_deferred().is_empty());
    }

    #[test]
    fn test_accept_with_listener() {
        let (mut bridge, _rx) = bridge();
        let (tx, mut incoming) = mpsc::unbounded_channel();
        bridge.set_incoming(Some(tx));

        let from = SockAddr::from(SocketAddr::from((Ipv4Addr::LOCALHOST, 2)));
        assert!(!bridge.on_firewall(&from));
        bridge.on_accept(SocketId(10), &from);

        let accepted = incoming.try_recv().unwrap();
        assert_eq!(accepted.socket, SocketId(10));
        assert_eq!(accepted.peer.port(), 2);
        assert_eq!(accepted.signal.state(), ConnState::Established);
        assert!(bridge.take_deferred().is_empty());
    }

    #[tokio::test]
    async fn test_wait_until_wakes_on_publish() {
        let signal = Arc::new(SocketSignal::new(ConnState::Connecting));
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move {
                signal
                    .wait_until(|st| (st.conn == ConnState::Established).then_some(()))
                    .await
            })
        };
        tokio::task::yield_now().await;
        signal.apply_event(SocketEvent::Connect);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
