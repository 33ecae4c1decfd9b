mod common;

use common::{Call, ConnectMode};
use std::net::SocketAddr;
use utp_bind::{resolve, ConnState, SocketErrorCode, UtpError, UtpOption};

#[test]
fn test_connect_without_address_skips_engine() {
    let (ctx, state) = common::context();
    let socket = ctx.create_socket().unwrap();
    state.clear_calls();

    assert!(matches!(socket.connect(None), Err(UtpError::InvalidAddress(_))));
    assert_eq!(state.call_count(), 0);
    assert_eq!(socket.state(), ConnState::Unconnected);
}

#[test]
fn test_connect_reaches_engine() {
    let (ctx, state) = common::context();
    state.set_connect_mode(ConnectMode::Silent);
    let socket = ctx.create_socket().unwrap();
    let id = common::last_created(&state);

    let remote = resolve("utp", "127.0.0.1:9000").unwrap();
    socket.connect(Some(&remote)).unwrap();

    let target: SocketAddr = "127.0.0.1:9000".parse().unwrap();
    assert!(state.calls().contains(&Call::Connect(id, target)));
    assert_eq!(socket.state(), ConnState::Connecting);
    assert_eq!(socket.peer_addr().unwrap(), Some(remote));
}

#[test]
fn test_connect_error_code_is_surfaced() {
    let (ctx, state) = common::context();
    state.set_connect_mode(ConnectMode::Fail(-22));
    let socket = ctx.create_socket().unwrap();

    let remote = resolve("utp", "127.0.0.1:9000").unwrap();
    match socket.connect(Some(&remote)) {
        Err(UtpError::Engine { op, code }) => {
            assert_eq!(op, "connect");
            assert_eq!(code, -22);
        }
        other => panic!("expected engine error, got {other:?}"),
    }
    assert_eq!(socket.state(), ConnState::Errored(SocketErrorCode::Other(-22)));
}

#[test]
fn test_operations_after_close_skip_engine() {
    let (ctx, state) = common::context();
    let socket = ctx.create_socket().unwrap();
    socket.close().unwrap();
    assert!(socket.is_closed());
    state.clear_calls();

    let remote = resolve("utp", "127.0.0.1:9000").unwrap();
    assert!(matches!(socket.write(b"late"), Err(UtpError::AlreadyClosed)));
    assert!(matches!(socket.connect(Some(&remote)), Err(UtpError::AlreadyClosed)));
    assert!(matches!(
        socket.set_sockopt(UtpOption::SendBuffer, 1024),
        Err(UtpError::AlreadyClosed)
    ));
    assert!(matches!(socket.get_sockopt(UtpOption::SendBuffer), Err(UtpError::AlreadyClosed)));
    assert!(matches!(socket.stats(), Err(UtpError::AlreadyClosed)));
    assert_eq!(state.call_count(), 0, "closed socket reached the engine");
}

#[test]
fn test_close_is_idempotent() {
    let (ctx, state) = common::context();
    let socket = ctx.create_socket().unwrap();
    let id = common::last_created(&state);

    socket.close().unwrap();
    socket.close().unwrap();
    drop(socket);

    let closes = state.calls().iter().filter(|call| **call == Call::Close(id)).count();
    assert_eq!(closes, 1);
}

#[test]
fn test_drop_closes_socket() {
    let (ctx, state) = common::context();
    let socket = ctx.create_socket().unwrap();
    let id = common::last_created(&state);

    drop(socket);
    assert!(state.closed(id));
    assert_eq!(ctx.binding_stats().open_sockets, 0);
}

#[test]
fn test_close_after_context_close() {
    let (ctx, state) = common::context();
    let socket = ctx.create_socket().unwrap();
    ctx.close().unwrap();
    assert_eq!(socket.state(), ConnState::Closed);

    socket.close().unwrap();
    assert!(matches!(socket.write(b"x"), Err(UtpError::AlreadyClosed)));
    assert!(state.destroyed.load(std::sync::atomic::Ordering::SeqCst));
}

#[test]
fn test_write_after_context_close() {
    let (ctx, _state) = common::context();
    let socket = ctx.create_socket().unwrap();
    ctx.close().unwrap();
    assert!(matches!(socket.write(b"x"), Err(UtpError::ContextClosed)));
}

#[test]
fn test_partial_write_is_not_an_error() {
    let (ctx, state) = common::context();
    let socket = ctx.create_socket().unwrap();
    socket.connect(Some(&resolve("utp", "127.0.0.1:9000").unwrap())).unwrap();

    state.set_write_limit(Some(3));
    assert_eq!(socket.write(b"hello").unwrap(), 3);

    state.set_write_limit(Some(0));
    assert_eq!(socket.write(b"hello").unwrap(), 0);

    assert_eq!(socket.write(b"").unwrap(), 0);
    assert_eq!(ctx.binding_stats().bytes_written, 3);
    assert_eq!(socket.stats().unwrap().unwrap().bytes_xmit, 3);
}

#[test]
fn test_sockopts() {
    let (ctx, _state) = common::context();
    let socket = ctx.create_socket().unwrap();

    socket.set_sockopt(UtpOption::RecvBuffer, 65536).unwrap();
    assert_eq!(socket.get_sockopt(UtpOption::RecvBuffer).unwrap(), 65536);
    assert!(matches!(
        socket.get_sockopt(UtpOption::TargetDelay),
        Err(UtpError::Engine { op: "getsockopt", code: -1 })
    ));
}

#[test]
fn test_unconnected_socket_has_no_peer() {
    let (ctx, _state) = common::context();
    let socket = ctx.create_socket().unwrap();
    assert_eq!(socket.peer_addr().unwrap(), None);
    assert_eq!(socket.stats().unwrap(), None);
}
