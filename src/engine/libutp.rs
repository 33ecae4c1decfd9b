//! libutp backend
//!
//! Links the C libutp library (`-lutp`) and exposes one `utp_context` as an
//! [`Engine`]. libutp reports events through one C callback per context; the
//! trampoline here forwards them to the [`EngineCallbacks`] passed into the
//! entry point that is currently running.

#![allow(non_camel_case_types)]

use std::ffi::{c_void, CStr};
use std::mem;
use std::ptr;

use libc::{c_char, c_int, size_t, sockaddr, sockaddr_storage, socklen_t, ssize_t};
use socket2::SockAddr;
use tracing::{debug, trace, warn};

use super::{
    ContextStats, Engine, EngineCallbacks, SocketErrorCode, SocketEvent, SocketId, SocketStats, UtpOption,
    UTP_VERSION,
};
use crate::error::{Result, UtpError};

#[repr(C)]
struct utp_context {
    _opaque: [u8; 0],
}

#[repr(C)]
struct utp_socket {
    _opaque: [u8; 0],
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
union callback_arg1 {
    address: *const sockaddr,
    send: c_int,
    sample_ms: c_int,
    error_code: c_int,
    state: c_int,
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
union callback_arg2 {
    address_len: socklen_t,
    kind: c_int,
}

#[repr(C)]
#[allow(dead_code)]
struct utp_callback_arguments {
    context: *mut utp_context,
    socket: *mut utp_socket,
    len: size_t,
    flags: u32,
    callback_type: c_int,
    buf: *const u8,
    arg1: callback_arg1,
    arg2: callback_arg2,
}

#[repr(C)]
struct utp_context_stats {
    nraw_recv: [u32; 5],
    nraw_send: [u32; 5],
}

#[repr(C)]
struct utp_socket_stats {
    nbytes_recv: u64,
    nbytes_xmit: u64,
    rexmit: u32,
    fastrexmit: u32,
    nxmit: u32,
    nrecv: u32,
    nduprecv: u32,
    mtu_guess: u32,
}

type utp_callback_t = unsafe extern "C" fn(*mut utp_callback_arguments) -> u64;

// Callback ids
const UTP_ON_FIREWALL: c_int = 0;
const UTP_ON_ACCEPT: c_int = 1;
const UTP_ON_ERROR: c_int = 3;
const UTP_ON_READ: c_int = 4;
const UTP_ON_STATE_CHANGE: c_int = 6;
const UTP_GET_READ_BUFFER_SIZE: c_int = 7;
const UTP_LOG: c_int = 14;
const UTP_SENDTO: c_int = 15;

// State change codes
const UTP_STATE_CONNECT: c_int = 1;
const UTP_STATE_WRITABLE: c_int = 2;
const UTP_STATE_EOF: c_int = 3;
const UTP_STATE_DESTROYING: c_int = 4;

#[link(name = "utp")]
extern "C" {
    fn utp_init(version: c_int) -> *mut utp_context;
    fn utp_destroy(ctx: *mut utp_context);
    fn utp_set_callback(ctx: *mut utp_context, callback_name: c_int, proc_: Option<utp_callback_t>);
    fn utp_context_set_userdata(ctx: *mut utp_context, userdata: *mut c_void) -> *mut c_void;
    fn utp_context_get_userdata(ctx: *mut utp_context) -> *mut c_void;
    fn utp_context_set_option(ctx: *mut utp_context, opt: c_int, val: c_int) -> c_int;
    fn utp_context_get_option(ctx: *mut utp_context, opt: c_int) -> c_int;
    fn utp_process_udp(
        ctx: *mut utp_context,
        buf: *const u8,
        len: size_t,
        to: *const sockaddr,
        tolen: socklen_t,
    ) -> c_int;
    fn utp_check_timeouts(ctx: *mut utp_context);
    fn utp_issue_deferred_acks(ctx: *mut utp_context);
    fn utp_get_context_stats(ctx: *mut utp_context) -> *mut utp_context_stats;
    fn utp_create_socket(ctx: *mut utp_context) -> *mut utp_socket;
    fn utp_setsockopt(s: *mut utp_socket, opt: c_int, val: c_int) -> c_int;
    fn utp_getsockopt(s: *mut utp_socket, opt: c_int) -> c_int;
    fn utp_connect(s: *mut utp_socket, to: *const sockaddr, tolen: socklen_t) -> c_int;
    fn utp_write(s: *mut utp_socket, buf: *mut c_void, count: size_t) -> ssize_t;
    fn utp_read_drained(s: *mut utp_socket);
    fn utp_getpeername(s: *mut utp_socket, addr: *mut sockaddr, addrlen: *mut socklen_t) -> c_int;
    fn utp_get_stats(s: *mut utp_socket) -> *mut utp_socket_stats;
    fn utp_close(s: *mut utp_socket);
}

/// Receiver of the entry point currently running, reached through the
/// context's userdata pointer
struct CallbackSlot {
    active: Option<*mut (dyn EngineCallbacks + 'static)>,
}

fn socket_id(socket: *mut utp_socket) -> SocketId {
    SocketId(socket as usize as u64)
}

fn socket_ptr(socket: SocketId) -> *mut utp_socket {
    socket.0 as usize as *mut utp_socket
}

unsafe fn sockaddr_from_raw(addr: *const sockaddr, len: socklen_t) -> Option<SockAddr> {
    if addr.is_null() || len as usize > mem::size_of::<sockaddr_storage>() {
        return None;
    }
    let mut storage: sockaddr_storage = mem::zeroed();
    ptr::copy_nonoverlapping(addr as *const u8, &mut storage as *mut sockaddr_storage as *mut u8, len as usize);
    Some(SockAddr::new(storage, len))
}

unsafe extern "C" fn on_callback(args: *mut utp_callback_arguments) -> u64 {
    let Some(args) = args.as_ref() else {
        return 0;
    };

    if args.callback_type == UTP_LOG {
        if !args.buf.is_null() {
            let line = CStr::from_ptr(args.buf as *const c_char);
            debug!(target: "libutp", "{}", line.to_string_lossy());
        }
        return 0;
    }

    let slot = utp_context_get_userdata(args.context) as *mut CallbackSlot;
    let Some(callbacks) = slot.as_ref().and_then(|slot| slot.active) else {
        trace!("libutp callback {} outside an entry point", args.callback_type);
        return 0;
    };
    let callbacks = &mut *callbacks;
    let socket = socket_id(args.socket);

    match args.callback_type {
        UTP_SENDTO => {
            let Some(to) = sockaddr_from_raw(args.arg1.address, args.arg2.address_len) else {
                warn!("libutp sendto without a usable address");
                return 0;
            };
            let packet = if args.buf.is_null() { &[][..] } else { std::slice::from_raw_parts(args.buf, args.len) };
            callbacks.on_sendto(&to, packet);
            0
        }
        UTP_ON_FIREWALL => match sockaddr_from_raw(args.arg1.address, args.arg2.address_len) {
            Some(from) => u64::from(callbacks.on_firewall(&from)),
            None => 1,
        },
        UTP_ON_ACCEPT => {
            if let Some(from) = sockaddr_from_raw(args.arg1.address, args.arg2.address_len) {
                callbacks.on_accept(socket, &from);
            }
            0
        }
        UTP_ON_STATE_CHANGE => {
            let event = match args.arg1.state {
                UTP_STATE_CONNECT => SocketEvent::Connect,
                UTP_STATE_WRITABLE => SocketEvent::Writable,
                UTP_STATE_EOF => SocketEvent::Eof,
                UTP_STATE_DESTROYING => SocketEvent::Destroying,
                other => {
                    trace!("Ignoring libutp state {} on {}", other, socket);
                    return 0;
                }
            };
            callbacks.on_state_change(socket, event);
            0
        }
        UTP_ON_READ => {
            if !args.buf.is_null() && args.len > 0 {
                callbacks.on_read(socket, std::slice::from_raw_parts(args.buf, args.len));
            }
            0
        }
        UTP_ON_ERROR => {
            callbacks.on_error(socket, SocketErrorCode::from_code(args.arg1.error_code));
            0
        }
        UTP_GET_READ_BUFFER_SIZE => callbacks.read_buffer_size(socket) as u64,
        other => {
            trace!("Unhandled libutp callback {}", other);
            0
        }
    }
}

/// One libutp context
pub struct LibUtp {
    ctx: *mut utp_context,
    // Owned; also reachable from C through the context userdata
    slot: *mut CallbackSlot,
}

// The context is only touched through `&mut self`, and the binding keeps
// every engine behind its context lock.
unsafe impl Send for LibUtp {}

impl LibUtp {
    /// Initialise a libutp context
    pub fn new() -> Result<Self> {
        let ctx = unsafe { utp_init(UTP_VERSION) };
        if ctx.is_null() {
            return Err(UtpError::Engine { op: "utp_init", code: -1 });
        }

        let slot = Box::into_raw(Box::new(CallbackSlot { active: None }));
        unsafe {
            utp_context_set_userdata(ctx, slot as *mut c_void);
            for callback in [
                UTP_ON_FIREWALL,
                UTP_ON_ACCEPT,
                UTP_ON_ERROR,
                UTP_ON_READ,
                UTP_ON_STATE_CHANGE,
                UTP_GET_READ_BUFFER_SIZE,
                UTP_LOG,
                UTP_SENDTO,
            ] {
                utp_set_callback(ctx, callback, Some(on_callback));
            }
        }
        debug!("Initialised libutp context (version {})", UTP_VERSION);
        Ok(Self { ctx, slot })
    }

    /// Run `op` with `callbacks` reachable from the trampoline
    fn with_callbacks<R>(&mut self, callbacks: &mut dyn EngineCallbacks, op: impl FnOnce(*mut utp_context) -> R) -> R {
        // The slot is cleared before `callbacks` goes out of scope.
        let raw: *mut (dyn EngineCallbacks + '_) = callbacks;
        let erased: *mut (dyn EngineCallbacks + 'static) = unsafe { mem::transmute(raw) };
        unsafe { (*self.slot).active = Some(erased) };
        let result = op(self.ctx);
        unsafe { (*self.slot).active = None };
        result
    }
}

impl Drop for LibUtp {
    fn drop(&mut self) {
        unsafe {
            (*self.slot).active = None;
            utp_destroy(self.ctx);
            drop(Box::from_raw(self.slot));
        }
        debug!("Destroyed libutp context");
    }
}

impl Engine for LibUtp {
    fn set_option(&mut self, option: UtpOption, value: i32) -> i32 {
        unsafe { utp_context_set_option(self.ctx, option.code(), value) }
    }

    fn get_option(&mut self, option: UtpOption) -> i32 {
        unsafe { utp_context_get_option(self.ctx, option.code()) }
    }

    fn process_udp(&mut self, packet: &[u8], from: &SockAddr, callbacks: &mut dyn EngineCallbacks) -> bool {
        self.with_callbacks(callbacks, |ctx| unsafe {
            utp_process_udp(ctx, packet.as_ptr(), packet.len(), from.as_ptr() as *const sockaddr, from.len()) != 0
        })
    }

    fn check_timeouts(&mut self, callbacks: &mut dyn EngineCallbacks) {
        self.with_callbacks(callbacks, |ctx| unsafe { utp_check_timeouts(ctx) })
    }

    fn issue_deferred_acks(&mut self, callbacks: &mut dyn EngineCallbacks) {
        self.with_callbacks(callbacks, |ctx| unsafe { utp_issue_deferred_acks(ctx) })
    }

    fn context_stats(&mut self) -> ContextStats {
        let raw = unsafe { utp_get_context_stats(self.ctx) };
        match unsafe { raw.as_ref() } {
            Some(stats) => ContextStats {
                recv: stats.nraw_recv,
                send: stats.nraw_send,
            },
            None => ContextStats::default(),
        }
    }

    fn create_socket(&mut self) -> Option<SocketId> {
        let socket = unsafe { utp_create_socket(self.ctx) };
        (!socket.is_null()).then(|| socket_id(socket))
    }

    fn set_sockopt(&mut self, socket: SocketId, option: UtpOption, value: i32) -> i32 {
        unsafe { utp_setsockopt(socket_ptr(socket), option.code(), value) }
    }

    fn get_sockopt(&mut self, socket: SocketId, option: UtpOption) -> i32 {
        unsafe { utp_getsockopt(socket_ptr(socket), option.code()) }
    }

    fn connect(&mut self, socket: SocketId, to: &SockAddr, callbacks: &mut dyn EngineCallbacks) -> i32 {
        self.with_callbacks(callbacks, |_| unsafe {
            utp_connect(socket_ptr(socket), to.as_ptr() as *const sockaddr, to.len())
        })
    }

    fn write(&mut self, socket: SocketId, data: &[u8], callbacks: &mut dyn EngineCallbacks) -> isize {
        self.with_callbacks(callbacks, |_| unsafe {
            utp_write(socket_ptr(socket), data.as_ptr() as *mut c_void, data.len())
        })
    }

    fn read_drained(&mut self, socket: SocketId, callbacks: &mut dyn EngineCallbacks) {
        self.with_callbacks(callbacks, |_| unsafe { utp_read_drained(socket_ptr(socket)) })
    }

    fn close(&mut self, socket: SocketId, callbacks: &mut dyn EngineCallbacks) {
        self.with_callbacks(callbacks, |_| unsafe { utp_close(socket_ptr(socket)) })
    }

    fn peer_addr(&mut self, socket: SocketId) -> Option<SockAddr> {
        unsafe {
            let mut storage: sockaddr_storage = mem::zeroed();
            let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;
            let code = utp_getpeername(
                socket_ptr(socket),
                &mut storage as *mut sockaddr_storage as *mut sockaddr,
                &mut len,
            );
            (code == 0).then(|| SockAddr::new(storage, len))
        }
    }

    fn socket_stats(&mut self, socket: SocketId) -> Option<SocketStats> {
        let raw = unsafe { utp_get_stats(socket_ptr(socket)) };
        unsafe { raw.as_ref() }.map(|stats| SocketStats {
            bytes_recv: stats.nbytes_recv,
            bytes_xmit: stats.nbytes_xmit,
            rexmit: stats.rexmit,
            fast_rexmit: stats.fastrexmit,
            nxmit: stats.nxmit,
            nrecv: stats.nrecv,
            nduprecv: stats.nduprecv,
            mtu_guess: stats.mtu_guess,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};

    #[test]
    fn test_socket_id_round_trip() {
        let raw = 0x7f00_dead_b000usize as *mut utp_socket;
        assert_eq!(socket_ptr(socket_id(raw)), raw);
    }

    #[test]
    fn test_sockaddr_from_raw() {
        let addr = SockAddr::from(SocketAddr::from((Ipv4Addr::LOCALHOST, 6881)));
        let copy = unsafe { sockaddr_from_raw(addr.as_ptr() as *const sockaddr, addr.len()) }.unwrap();
        assert_eq!(copy.as_socket(), addr.as_socket());
        assert!(unsafe { sockaddr_from_raw(ptr::null(), 16) }.is_none());
    }

    #[test]
    fn test_context_lifecycle() {
        let mut engine = LibUtp::new().unwrap();
        assert!(engine.set_option(UtpOption::RecvBuffer, 1 << 20) >= 0);
        assert_eq!(engine.get_option(UtpOption::RecvBuffer), 1 << 20);
        assert!(engine.create_socket().is_some());
        assert_eq!(engine.context_stats().send, [0; 5]);
    }
}
