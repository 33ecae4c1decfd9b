//! Scriptable in-memory engine for integration tests
//!
//! `FakeEngine` records every entry point it sees and counts overlapping
//! entries, so tests can prove the binding serialises engine access. Inbound
//! "packets" are tiny commands that make the engine fire callbacks:
//!
//! | first byte | effect                                    |
//! |------------|-------------------------------------------|
//! | `A`        | incoming connection (firewall, accept)    |
//! | `C` + id   | connect completes                          |
//! | `D` + id   | payload after the id is delivered          |
//! | `W` + id   | socket writable                            |
//! | `E` + id   | end of stream                              |
//! | `X` + id   | connection reset                           |

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::SockAddr;
use utp_bind::{
    ContextConfig, ContextStats, Engine, EngineCallbacks, SocketErrorCode, SocketEvent, SocketId, SocketStats,
    UtpContext, UtpOption,
};

/// How the engine answers `connect`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    /// Fire the connect event immediately
    Establish,
    /// Report connection refused
    Refuse,
    /// Send a SYN and never answer
    Silent,
    /// Return this code from `connect`
    Fail(i32),
}

/// One recorded entry point
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    SetOption(UtpOption, i32),
    GetOption(UtpOption),
    ProcessUdp(usize),
    CheckTimeouts,
    IssueDeferredAcks,
    ContextStats,
    CreateSocket(SocketId),
    SetSockopt(SocketId, UtpOption, i32),
    GetSockopt(SocketId, UtpOption),
    Connect(SocketId, SocketAddr),
    Write(SocketId, usize),
    ReadDrained(SocketId),
    Close(SocketId),
    PeerAddr(SocketId),
    SocketStats(SocketId),
}

/// State shared between a test and its engine
pub struct FakeState {
    pub calls: Mutex<Vec<Call>>,
    pub overlaps: AtomicUsize,
    pub destroyed: AtomicBool,
    pub connect_mode: Mutex<ConnectMode>,
    /// Most bytes one write accepts; `Some(0)` means the window is full
    pub write_limit: Mutex<Option<usize>>,
    /// Time spent inside each write
    pub write_delay: Mutex<Duration>,
    inside: AtomicBool,
}

impl FakeState {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn set_connect_mode(&self, mode: ConnectMode) {
        *self.connect_mode.lock() = mode;
    }

    pub fn set_write_limit(&self, limit: Option<usize>) {
        *self.write_limit.lock() = limit;
    }

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock() = delay;
    }

    pub fn closed(&self, socket: SocketId) -> bool {
        self.calls.lock().contains(&Call::Close(socket))
    }
}

/// Flags overlapping entry points for as long as it lives
struct EntryGuard(Arc<FakeState>);

impl Drop for EntryGuard {
    fn drop(&mut self) {
        self.0.inside.store(false, Ordering::SeqCst);
    }
}

pub struct FakeEngine {
    state: Arc<FakeState>,
    next: u64,
    options: HashMap<i32, i32>,
    sockopts: HashMap<(SocketId, i32), i32>,
    peers: HashMap<SocketId, SockAddr>,
    written: HashMap<SocketId, u64>,
}

impl FakeEngine {
    pub fn new() -> (Self, Arc<FakeState>) {
        let state = Arc::new(FakeState {
            calls: Mutex::new(Vec::new()),
            overlaps: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
            connect_mode: Mutex::new(ConnectMode::Establish),
            write_limit: Mutex::new(None),
            write_delay: Mutex::new(Duration::ZERO),
            inside: AtomicBool::new(false),
        });
        let engine = Self {
            state: state.clone(),
            next: 0,
            options: HashMap::new(),
            sockopts: HashMap::new(),
            peers: HashMap::new(),
            written: HashMap::new(),
        };
        (engine, state)
    }

    fn enter(&self, call: Call) -> EntryGuard {
        if self.state.inside.swap(true, Ordering::SeqCst) {
            self.state.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.state.calls.lock().push(call);
        EntryGuard(self.state.clone())
    }

    fn allocate(&mut self) -> SocketId {
        self.next += 1;
        SocketId(self.next)
    }
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        assert!(!self.state.destroyed.swap(true, Ordering::SeqCst), "engine destroyed twice");
    }
}

fn socket_arg(packet: &[u8]) -> Option<(SocketId, &[u8])> {
    let id: [u8; 8] = packet.get(1..9)?.try_into().ok()?;
    Some((SocketId(u64::from_be_bytes(id)), &packet[9..]))
}

impl Engine for FakeEngine {
    fn set_option(&mut self, option: UtpOption, value: i32) -> i32 {
        let _entry = self.enter(Call::SetOption(option, value));
        if matches!(option, UtpOption::Raw(_)) {
            return -1;
        }
        self.options.insert(option.code(), value);
        0
    }

    fn get_option(&mut self, option: UtpOption) -> i32 {
        let _entry = self.enter(Call::GetOption(option));
        self.options.get(&option.code()).copied().unwrap_or(-1)
    }

    fn process_udp(&mut self, packet: &[u8], from: &SockAddr, callbacks: &mut dyn EngineCallbacks) -> bool {
        let _entry = self.enter(Call::ProcessUdp(packet.len()));
        match packet.first() {
            Some(b'A') => {
                if !callbacks.on_firewall(from) {
                    let id = self.allocate();
                    self.peers.insert(id, from.clone());
                    callbacks.on_accept(id, from);
                }
                true
            }
            Some(b'C') | Some(b'D') | Some(b'W') | Some(b'E') | Some(b'X') => {
                let Some((id, rest)) = socket_arg(packet) else {
                    return false;
                };
                match packet[0] {
                    b'C' => callbacks.on_state_change(id, SocketEvent::Connect),
                    b'D' => callbacks.on_read(id, rest),
                    b'W' => callbacks.on_state_change(id, SocketEvent::Writable),
                    b'E' => callbacks.on_state_change(id, SocketEvent::Eof),
                    _ => callbacks.on_error(id, SocketErrorCode::ConnectionReset),
                }
                true
            }
            _ => false,
        }
    }

    fn check_timeouts(&mut self, _callbacks: &mut dyn EngineCallbacks) {
        let _entry = self.enter(Call::CheckTimeouts);
    }

    fn issue_deferred_acks(&mut self, _callbacks: &mut dyn EngineCallbacks) {
        let _entry = self.enter(Call::IssueDeferredAcks);
    }

    fn context_stats(&mut self) -> ContextStats {
        let _entry = self.enter(Call::ContextStats);
        ContextStats {
            recv: [1, 0, 0, 0, 0],
            send: [0, 2, 0, 0, 0],
        }
    }

    fn create_socket(&mut self) -> Option<SocketId> {
        let id = self.allocate();
        let _entry = self.enter(Call::CreateSocket(id));
        Some(id)
    }

    fn set_sockopt(&mut self, socket: SocketId, option: UtpOption, value: i32) -> i32 {
        let _entry = self.enter(Call::SetSockopt(socket, option, value));
        self.sockopts.insert((socket, option.code()), value);
        0
    }

    fn get_sockopt(&mut self, socket: SocketId, option: UtpOption) -> i32 {
        let _entry = self.enter(Call::GetSockopt(socket, option));
        self.sockopts.get(&(socket, option.code())).copied().unwrap_or(-1)
    }

    fn connect(&mut self, socket: SocketId, to: &SockAddr, callbacks: &mut dyn EngineCallbacks) -> i32 {
        let target = to.as_socket().expect("fake engine only speaks IP");
        let _entry = self.enter(Call::Connect(socket, target));
        let mode = *self.state.connect_mode.lock();
        if let ConnectMode::Fail(code) = mode {
            return code;
        }

        self.peers.insert(socket, to.clone());
        callbacks.on_sendto(to, b"SYN");
        match mode {
            ConnectMode::Establish => callbacks.on_state_change(socket, SocketEvent::Connect),
            ConnectMode::Refuse => callbacks.on_error(socket, SocketErrorCode::ConnectionRefused),
            ConnectMode::Silent | ConnectMode::Fail(_) => {}
        }
        0
    }

    fn write(&mut self, socket: SocketId, data: &[u8], callbacks: &mut dyn EngineCallbacks) -> isize {
        let _entry = self.enter(Call::Write(socket, data.len()));
        let delay = *self.state.write_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let accepted = match *self.state.write_limit.lock() {
            Some(limit) => data.len().min(limit),
            None => data.len(),
        };
        if accepted > 0 {
            if let Some(peer) = self.peers.get(&socket) {
                callbacks.on_sendto(peer, &data[..accepted]);
            }
            *self.written.entry(socket).or_default() += accepted as u64;
        }
        accepted as isize
    }

    fn read_drained(&mut self, socket: SocketId, _callbacks: &mut dyn EngineCallbacks) {
        let _entry = self.enter(Call::ReadDrained(socket));
    }

    fn close(&mut self, socket: SocketId, callbacks: &mut dyn EngineCallbacks) {
        let _entry = self.enter(Call::Close(socket));
        self.peers.remove(&socket);
        callbacks.on_state_change(socket, SocketEvent::Destroying);
    }

    fn peer_addr(&mut self, socket: SocketId) -> Option<SockAddr> {
        let _entry = self.enter(Call::PeerAddr(socket));
        self.peers.get(&socket).cloned()
    }

    fn socket_stats(&mut self, socket: SocketId) -> Option<SocketStats> {
        let _entry = self.enter(Call::SocketStats(socket));
        self.written.get(&socket).map(|&bytes| SocketStats {
            bytes_xmit: bytes,
            ..Default::default()
        })
    }
}

/// Context around a fresh fake engine
pub fn context() -> (UtpContext, Arc<FakeState>) {
    context_with(ContextConfig::default())
}

pub fn context_with(config: ContextConfig) -> (UtpContext, Arc<FakeState>) {
    let (engine, state) = FakeEngine::new();
    let ctx = UtpContext::new(engine, config).expect("fake engine accepts every option");
    state.clear_calls();
    (ctx, state)
}

/// Inbound command packets understood by [`FakeEngine`]
pub mod packet {
    use utp_bind::SocketId;

    fn with_id(tag: u8, socket: SocketId, rest: &[u8]) -> Vec<u8> {
        let mut packet = vec![tag];
        packet.extend_from_slice(&socket.0.to_be_bytes());
        packet.extend_from_slice(rest);
        packet
    }

    pub fn accept() -> Vec<u8> {
        vec![b'A']
    }

    pub fn connected(socket: SocketId) -> Vec<u8> {
        with_id(b'C', socket, &[])
    }

    pub fn data(socket: SocketId, payload: &[u8]) -> Vec<u8> {
        with_id(b'D', socket, payload)
    }

    pub fn writable(socket: SocketId) -> Vec<u8> {
        with_id(b'W', socket, &[])
    }

    pub fn eof(socket: SocketId) -> Vec<u8> {
        with_id(b'E', socket, &[])
    }

    pub fn reset(socket: SocketId) -> Vec<u8> {
        with_id(b'X', socket, &[])
    }
}

/// Source address used for pumped test packets
pub fn peer() -> SocketAddr {
    "127.0.0.1:6881".parse().expect("valid literal")
}

/// Id of the socket most recently created through `create_socket`
pub fn last_created(state: &FakeState) -> SocketId {
    state
        .calls()
        .iter()
        .rev()
        .find_map(|call| match call {
            Call::CreateSocket(id) => Some(*id),
            _ => None,
        })
        .expect("a socket was created")
}
