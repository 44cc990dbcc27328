//! Protocol listener.
//!
//! One per monitored interface. Joins the protocol multicast group, feeds
//! every datagram to the `Synchronizer` and unicasts any request records it
//! produces back to the sender on the same socket.

use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use topomap_core::wire::TLV_HEADER_LEN;
use topomap_services::Synchronizer;

/// Consecutive receive failures after which the socket is treated as dead.
const MAX_RECV_FAILURES: u32 = 32;

/// A monitored interface. Index 0 is the unbound listener.
#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    pub index: u32,
}

impl Interface {
    pub fn any() -> Self {
        Self {
            name: "*".to_string(),
            index: 0,
        }
    }

    pub fn by_name(name: &str) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            index: if_index(name)?,
        })
    }
}

pub struct ProtocolListener {
    socket: UdpSocket,
    interface: Interface,
    sync: Synchronizer,
    recv_buffer: usize,
    shutdown: broadcast::Receiver<()>,
}

impl ProtocolListener {
    pub fn bind(
        interface: Interface,
        group: Ipv6Addr,
        port: u16,
        recv_buffer: usize,
        sync: Synchronizer,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let socket = make_listener_socket(group, port, interface.index)
            .with_context(|| format!("failed to create multicast socket on {}", interface.name))?;
        Self::from_socket(socket, interface, recv_buffer, sync, shutdown)
    }

    /// Wrap an already bound, nonblocking socket.
    pub fn from_socket(
        socket: std::net::UdpSocket,
        interface: Interface,
        recv_buffer: usize,
        sync: Synchronizer,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let socket = UdpSocket::from_std(socket).context("failed to convert to tokio UdpSocket")?;

        Ok(Self {
            socket,
            interface,
            sync,
            recv_buffer: recv_buffer.max(TLV_HEADER_LEN),
            shutdown,
        })
    }

    /// Receive until shutdown. Returns an error only when the socket has
    /// failed `MAX_RECV_FAILURES` times in a row.
    pub async fn run(mut self) -> Result<()> {
        let mut buf = vec![0u8; self.recv_buffer];
        let mut failures = RecvFailures::default();

        tracing::info!(
            interface = %self.interface.name,
            index = self.interface.index,
            "protocol listener starting"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!(interface = %self.interface.name, "protocol listener shutting down");
                    return Ok(());
                }

                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, peer_addr)) => {
                            failures.reset();
                            self.on_datagram(peer_addr, &buf[..len]).await;
                        }
                        Err(e) => {
                            let give_up = failures.record();
                            tracing::warn!(
                                interface = %self.interface.name,
                                error = %e,
                                failures = failures.consecutive,
                                "recv_from failed"
                            );
                            if give_up {
                                anyhow::bail!(
                                    "socket on {} failed {} times in a row",
                                    self.interface.name,
                                    failures.consecutive
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    /// Applied whatever its scope: a unicast datagram to the shared port
    /// reaches only one listener, not necessarily this interface's. A
    /// multicast copy seen by a second listener is an `Unchanged` no-op.
    async fn on_datagram(&self, peer_addr: SocketAddr, data: &[u8]) {
        match peer_addr {
            SocketAddr::V6(source) => self.handle(source, data).await,
            SocketAddr::V4(_) => {
                tracing::warn!("received IPv4 datagram on IPv6 socket, ignoring");
            }
        }
    }

    async fn handle(&self, source: SocketAddrV6, data: &[u8]) {
        tracing::trace!(
            interface = %self.interface.name,
            source = %source,
            len = data.len(),
            "datagram received"
        );

        let outcome = self.sync.handle_datagram(source, data);

        if let Some(reply) = outcome.reply_datagram() {
            match self.socket.send_to(&reply, SocketAddr::V6(source)).await {
                Ok(_) => tracing::debug!(
                    source = %source,
                    requests = outcome.replies.len(),
                    "sent requests"
                ),
                Err(e) => tracing::warn!(source = %source, error = %e, "send_to failed"),
            }
        }
    }
}

/// Consecutive receive failures on one socket.
#[derive(Debug, Default)]
struct RecvFailures {
    consecutive: u32,
}

impl RecvFailures {
    fn reset(&mut self) {
        self.consecutive = 0;
    }

    /// Count a failure. True once the socket should be given up.
    fn record(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= MAX_RECV_FAILURES
    }
}

/// UDP socket bound to `[::]:port` with `SO_REUSEADDR`, so every listener
/// can share the protocol port.
fn bind_shared_port(port: u16) -> Result<Socket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_only_v6(true).context("IPV6_V6ONLY")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0);
    socket.bind(&bind_addr.into()).context("bind()")?;

    Ok(socket)
}

/// Shared-port socket joined to `group` on the interface. Index 0 lets the
/// kernel pick the interface.
fn make_listener_socket(group: Ipv6Addr, port: u16, interface_index: u32) -> Result<std::net::UdpSocket> {
    let socket = bind_shared_port(port)?;
    socket
        .join_multicast_v6(&group, interface_index)
        .context("IPV6_JOIN_GROUP")?;

    Ok(socket.into())
}

/// Resolve an interface name to its kernel index.
pub fn if_index(name: &str) -> Result<u32> {
    let name_cstr = std::ffi::CString::new(name).context("interface name contains null byte")?;
    let index = unsafe { libc::if_nametoindex(name_cstr.as_ptr()) };
    if index == 0 {
        anyhow::bail!("interface '{}' not found", name);
    }
    Ok(index)
}
