//! Datagram transport for GVCP

use cambus_core::{HostAdapter, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, trace};

use crate::protocol::GVCP_PORT;

/// How GVCP datagrams reach devices
pub trait GvcpLink: Send + Sync {
    /// Broadcast `packet` out of `adapter` and gather every datagram that
    /// arrives within `window`. Silence is not an error.
    fn broadcast(
        &self,
        adapter: &HostAdapter,
        packet: &[u8],
        window: Duration,
    ) -> impl Future<Output = Result<Vec<Vec<u8>>>> + Send;

    /// Send `packet` to one device and wait up to `wait` for its reply
    fn request(
        &self,
        device: Ipv4Addr,
        packet: &[u8],
        wait: Duration,
    ) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;
}

/// GVCP over real UDP sockets
#[derive(Debug, Clone)]
pub struct UdpGvcpLink {
    port: u16,
    mtu: usize,
}

impl UdpGvcpLink {
    pub fn new() -> Self {
        Self::with_port(GVCP_PORT)
    }

    pub fn with_port(port: u16) -> Self {
        Self { port, mtu: 1500 }
    }
}

/// Socket for one adapter's broadcast exchange.
///
/// Devices outside the adapter's subnet answer to 255.255.255.255, which a
/// socket bound to the adapter's unicast address never sees, so the socket
/// is bound to the wildcard address and pinned to the interface instead.
fn broadcast_socket(adapter: &HostAdapter) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_broadcast(true)?;
    pin_to_interface(&socket, adapter);
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "fuchsia"))]
fn pin_to_interface(socket: &Socket, adapter: &HostAdapter) {
    if let Err(e) = socket.bind_device(Some(adapter.name.as_bytes())) {
        // Without the pin the broadcast follows the routing table
        debug!(
            adapter = %adapter.name,
            error = %e,
            "Could not bind broadcast socket to interface"
        );
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "fuchsia")))]
fn pin_to_interface(_socket: &Socket, adapter: &HostAdapter) {
    debug!(adapter = %adapter.name, "Interface pinning unavailable, using routing table");
}

impl Default for UdpGvcpLink {
    fn default() -> Self {
        Self::new()
    }
}

impl GvcpLink for UdpGvcpLink {
    async fn broadcast(
        &self,
        adapter: &HostAdapter,
        packet: &[u8],
        window: Duration,
    ) -> Result<Vec<Vec<u8>>> {
        let socket = broadcast_socket(adapter)?;
        socket
            .send_to(packet, SocketAddrV4::new(Ipv4Addr::BROADCAST, self.port))
            .await?;

        trace!(
            adapter = %adapter.name,
            len = packet.len(),
            "Broadcast GVCP command"
        );

        let deadline = Instant::now() + window;
        let mut buf = vec![0u8; self.mtu];
        let mut replies = Vec::new();

        loop {
            match timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, from))) => {
                    trace!(from = %from, len = len, "Received GVCP datagram");
                    replies.push(buf[..len].to_vec());
                }
                Ok(Err(e)) => {
                    debug!(adapter = %adapter.name, error = %e, "Receive failed, ending window early");
                    break;
                }
                Err(_) => break,
            }
        }

        Ok(replies)
    }

    async fn request(
        &self,
        device: Ipv4Addr,
        packet: &[u8],
        wait: Duration,
    ) -> Result<Option<Vec<u8>>> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket
            .send_to(packet, SocketAddrV4::new(device, self.port))
            .await?;

        let mut buf = vec![0u8; self.mtu];
        match timeout(wait, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _from))) => Ok(Some(buf[..len].to_vec())),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                debug!(device = %device, "No GVCP reply");
                Ok(None)
            }
        }
    }
}
