//! Packet I/O driver - a tokio task that owns the UDP socket of a context
//!
//! The engine never touches the network itself. The driver receives
//! datagrams, pumps them into the context in batches, flushes deferred acks
//! after each batch, ticks the engine timers and sends whatever the engine
//! queued through its send callback.

use std::io;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::addr::UtpAddr;
use crate::error::{Result, UtpError};
use crate::transport::bridge::Datagram;
use crate::transport::context::UtpContext;

/// UDP socket settings for [`UtpDriver`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Address to bind; port 0 picks a free one
    pub bind_address: SocketAddr,
    /// Refuse IPv4 traffic on an IPv6 socket
    pub only_v6: bool,
    /// Datagrams pumped before deferred acks are flushed
    pub recv_batch_size: usize,
    /// Receive buffer size per datagram
    pub max_datagram_size: usize,
    /// Kernel send buffer (system default when unset)
    pub socket_send_buffer: Option<usize>,
    /// Kernel receive buffer (system default when unset)
    pub socket_recv_buffer: Option<usize>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0)),
            only_v6: false,
            recv_batch_size: 64,
            max_datagram_size: 4096,
            socket_send_buffer: None,
            socket_recv_buffer: None,
        }
    }
}

fn bind_socket(config: &DriverConfig) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(config.bind_address), Type::DGRAM, Some(Protocol::UDP))?;

    if config.bind_address.is_ipv6() {
        if let Err(e) = socket.set_only_v6(config.only_v6) {
            warn!("Could not set IPv6-only socket option (continuing anyway): {}", e);
        }
    }
    if let Some(size) = config.socket_send_buffer {
        if let Err(e) = socket.set_send_buffer_size(size) {
            warn!("Could not set send buffer size: {}", e);
        }
    }
    if let Some(size) = config.socket_recv_buffer {
        if let Err(e) = socket.set_recv_buffer_size(size) {
            warn!("Could not set receive buffer size: {}", e);
        }
    }

    socket.set_nonblocking(true)?;
    socket.bind(&config.bind_address.into())?;
    Ok(socket.into())
}

/// Destination as the bound socket can reach it
///
/// IPv4 peers are addressed through their mapped form on an IPv6 socket.
fn wire_target(to: SocketAddr, ipv6_socket: bool) -> SocketAddr {
    match to {
        SocketAddr::V4(v4) if ipv6_socket => SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port()),
        other => other,
    }
}

/// Returns false once the context is gone and the loop should stop
fn still_open(op: &str, result: Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(UtpError::ContextClosed) => {
            info!("uTP context closed, stopping packet driver");
            false
        }
        Err(e) => {
            warn!("Engine {} failed: {}", op, e);
            true
        }
    }
}

/// Background task feeding one context from one UDP socket
pub struct UtpDriver {
    local_addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl UtpDriver {
    /// Bind a UDP socket and start driving `ctx`
    ///
    /// Must run inside a tokio runtime. Holds the context's outbound queue
    /// while running, so only one driver serves a context at a time. The
    /// queue goes back to the context when the loop exits.
    pub fn spawn(ctx: &UtpContext, config: DriverConfig) -> Result<Self> {
        let socket = UdpSocket::from_std(bind_socket(&config)?)?;
        let local_addr = socket.local_addr()?;

        let outbound = ctx.take_outbound().ok_or_else(|| {
            UtpError::Io(io::Error::new(
                io::ErrorKind::AddrInUse,
                "context already has a packet driver",
            ))
        })?;
        ctx.set_local_addr(UtpAddr::from(local_addr));

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run(ctx.clone(), socket, outbound, stop_rx, config));

        info!("uTP packet driver listening on {}", local_addr);
        Ok(Self {
            local_addr,
            stop: Some(stop_tx),
            task: Some(task),
        })
    }

    /// Address the UDP socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// True once the loop has exited
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }

    /// Stop the loop and wait for it to exit
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Packet driver task ended abnormally: {}", e);
            }
        }
        debug!("uTP packet driver on {} stopped", self.local_addr);
    }
}

impl Drop for UtpDriver {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

async fn run(
    ctx: UtpContext,
    socket: UdpSocket,
    mut outbound: mpsc::UnboundedReceiver<Datagram>,
    mut stop: oneshot::Receiver<()>,
    config: DriverConfig,
) {
    let ipv6_socket = config.bind_address.is_ipv6();
    let batch = config.recv_batch_size.max(1);
    let mut buf = vec![0u8; config.max_datagram_size.max(1)];

    let mut ticker = tokio::time::interval(ctx.config().tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    'driver: loop {
        tokio::select! {
            _ = &mut stop => {
                debug!("Packet driver stop requested");
                break;
            }
            _ = ticker.tick() => {
                if !still_open("tick", ctx.tick()) {
                    break;
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        // ICMP errors surface here on some platforms
                        debug!("UDP receive failed: {}", e);
                        continue;
                    }
                };
                if !still_open("pump", ctx.pump(&buf[..len], from).map(|_| ())) {
                    break;
                }

                let mut pumped = 1;
                while pumped < batch {
                    match socket.try_recv_from(&mut buf) {
                        Ok((len, from)) => {
                            if !still_open("pump", ctx.pump(&buf[..len], from).map(|_| ())) {
                                break 'driver;
                            }
                            pumped += 1;
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            debug!("UDP receive failed: {}", e);
                            break;
                        }
                    }
                }
                trace!("Pumped batch of {} datagrams", pumped);

                if !still_open("issue_deferred_acks", ctx.flush_deferred_acks()) {
                    break;
                }
            }
            Some(datagram) = outbound.recv() => {
                let target = wire_target(datagram.to, ipv6_socket);
                if let Err(e) = socket.send_to(&datagram.payload, target).await {
                    debug!("UDP send to {} failed: {}", target, e);
                }
            }
        }
    }

    ctx.restore_outbound(outbound);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_wire_target_maps_ipv4_on_ipv6_socket() {
        let v4 = SocketAddr::from((Ipv4Addr::new(10, 0, 0, 1), 6881));
        assert_eq!(
            wire_target(v4, true),
            SocketAddr::from((Ipv4Addr::new(10, 0, 0, 1).to_ipv6_mapped(), 6881))
        );
        assert_eq!(wire_target(v4, false), v4);

        let v6 = SocketAddr::from((Ipv6Addr::LOCALHOST, 6881));
        assert_eq!(wire_target(v6, true), v6);
    }

    #[test]
    fn test_bind_ipv4_loopback() {
        let config = DriverConfig {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            socket_recv_buffer: Some(256 * 1024),
            ..Default::default()
        };
        let socket = bind_socket(&config).unwrap();
        let local = socket.local_addr().unwrap();
        assert_eq!(local.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn test_default_binds_dual_stack_any() {
        let config = DriverConfig::default();
        assert!(config.bind_address.is_ipv6());
        assert!(config.bind_address.ip().is_unspecified());
        assert!(!config.only_v6);
    }
}
