//! topomap integration test harness.
//!
//! Each test starts an observer (a `Synchronizer` behind a real UDP socket
//! on [::1]) and one or more speakers that send protocol datagrams to it and
//! read back its requests. Everything runs on loopback, so no privileges or
//! network setup are needed.

use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use topomap_core::wire::decode_all;
use topomap_core::{Hash, NodeId, Record};
use topomap_services::{ChangeSignals, NeighbourId, Synchronizer, TopologyStore};

mod sync;
mod topology;

// ── Harness ───────────────────────────────────────────────────────────────────

/// How long a test waits for a reply that should arrive.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(2);
/// How long a test waits before concluding no reply is coming.
pub const SILENCE: Duration = Duration::from_millis(300);

/// A `Synchronizer` serving one loopback socket.
pub struct Observer {
    pub addr: SocketAddr,
    pub store: TopologyStore,
    pub signals: ChangeSignals,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl Observer {
    pub async fn start() -> Result<Self> {
        let socket = UdpSocket::bind("[::1]:0")
            .await
            .context("failed to bind observer socket")?;
        let addr = socket.local_addr()?;

        let store = TopologyStore::new();
        let signals = ChangeSignals::new();
        let sync = Synchronizer::new(store.clone(), signals.clone());
        let (shutdown, mut shutdown_rx) = broadcast::channel::<()>(1);

        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    result = socket.recv_from(&mut buf) => {
                        let Ok((len, SocketAddr::V6(source))) = result else {
                            continue;
                        };
                        let outcome = sync.handle_datagram(source, &buf[..len]);
                        if let Some(reply) = outcome.reply_datagram() {
                            let _ = socket.send_to(&reply, source).await;
                        }
                    }
                }
            }
        });

        Ok(Self {
            addr,
            store,
            signals,
            shutdown,
            task,
        })
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

/// A protocol speaker announcing itself under one (NodeId, EndpointId).
pub struct Speaker {
    socket: UdpSocket,
    observer: SocketAddr,
    pub node_id: NodeId,
    pub endpoint_id: u32,
}

impl Speaker {
    pub async fn connect(observer: &Observer, node_id: u32, endpoint_id: u32) -> Result<Self> {
        let socket = UdpSocket::bind("[::1]:0")
            .await
            .context("failed to bind speaker socket")?;
        Ok(Self {
            socket,
            observer: observer.addr,
            node_id: NodeId(node_id),
            endpoint_id,
        })
    }

    /// The NeighbourId the observer files this speaker under.
    pub fn neighbour_id(&self) -> NeighbourId {
        NeighbourId {
            addr: Ipv6Addr::LOCALHOST,
            zone: 0,
            node_id: self.node_id,
            endpoint_id: self.endpoint_id,
        }
    }

    /// Send the endpoint record followed by `records` as one datagram.
    pub async fn send(&self, records: &[Record]) -> Result<()> {
        let mut buf = BytesMut::new();
        Record::NodeEndpoint {
            node_id: self.node_id,
            endpoint_id: self.endpoint_id,
        }
        .encode_into(&mut buf);
        for record in records {
            record.encode_into(&mut buf);
        }
        self.send_raw(&buf).await
    }

    pub async fn send_raw(&self, datagram: &[u8]) -> Result<()> {
        self.socket.send_to(datagram, self.observer).await?;
        Ok(())
    }

    /// Wait for one reply datagram and decode it.
    pub async fn recv_reply(&self) -> Result<Vec<Record>> {
        let mut buf = vec![0u8; 65536];
        let (len, _) = tokio::time::timeout(REPLY_TIMEOUT, self.socket.recv_from(&mut buf))
            .await
            .context("no reply from observer")??;
        Ok(decode_all(&buf[..len])?)
    }

    /// Fail if a reply arrives within `SILENCE`.
    pub async fn expect_silence(&self) -> Result<()> {
        let mut buf = vec![0u8; 65536];
        match tokio::time::timeout(SILENCE, self.socket.recv_from(&mut buf)).await {
            Err(_) => Ok(()),
            Ok(Ok((len, _))) => bail!("unexpected reply: {:?}", decode_all(&buf[..len])),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    /// NETWORK-STATE with the endpoint context, expecting the detail request.
    pub async fn announce(&self, hash: u64) -> Result<()> {
        self.send(&[Record::NetworkState { hash: Hash(hash) }]).await?;
        let reply = self.recv_reply().await?;
        if reply != vec![Record::RequestNetworkState] {
            bail!("expected REQUEST-NETWORK-STATE, got {:?}", reply);
        }
        Ok(())
    }
}

/// Poll `check` until it holds or `REPLY_TIMEOUT` passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + REPLY_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn link_local(last: u16, zone: u32) -> SocketAddrV6 {
    SocketAddrV6::new(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, last), 8231, 0, zone)
}

#[tokio::test]
async fn test_observer_starts_and_stops() {
    let observer = Observer::start().await.expect("observer should start");
    assert!(observer.addr.is_ipv6());
    assert_eq!(observer.store.neighbour_count(), 0);
    observer.stop().await;
}
