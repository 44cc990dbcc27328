use crate::*;

use topomap_core::{NodeState, Peer};

fn node_state(node_id: u32, hash: u64, peers: &[(u32, u32, u32)]) -> Record {
    Record::NodeState(NodeState {
        node_id: NodeId(node_id),
        seqno: 1,
        origin_age: 0,
        hash: Hash(hash),
        peers: peers
            .iter()
            .map(|&(peer_id, local, remote)| Peer {
                peer_id: NodeId(peer_id),
                local_endpoint: local,
                remote_endpoint: remote,
            })
            .collect(),
        skipped: 0,
    })
}

#[tokio::test]
async fn test_new_neighbour_is_asked_for_network_state() {
    let observer = Observer::start().await.unwrap();
    let speaker = Speaker::connect(&observer, 7, 1).await.unwrap();

    speaker
        .send(&[Record::NetworkState { hash: Hash(0xaaaa) }])
        .await
        .unwrap();
    let reply = speaker.recv_reply().await.unwrap();

    assert_eq!(reply, vec![Record::RequestNetworkState]);
    assert_eq!(
        observer.store.network_hash(&speaker.neighbour_id()),
        Some(Hash(0xaaaa))
    );
    assert!(observer.signals.neighbours.is_pending());
    observer.stop().await;
}

#[tokio::test]
async fn test_node_state_pulls_node_detail() {
    let observer = Observer::start().await.unwrap();
    let speaker = Speaker::connect(&observer, 7, 1).await.unwrap();
    speaker.announce(0xaaaa).await.unwrap();

    speaker
        .send(&[node_state(7, 0xbbbb, &[(9, 1, 2)])])
        .await
        .unwrap();
    let reply = speaker.recv_reply().await.unwrap();

    assert_eq!(
        reply,
        vec![Record::RequestNodeState {
            node_id: NodeId(7)
        }]
    );
    let node = observer
        .store
        .node(&speaker.neighbour_id(), NodeId(7))
        .expect("node 7 should be stored");
    assert_eq!(node.hash, Hash(0xbbbb));
    assert_eq!(
        node.peers,
        vec![Peer {
            peer_id: NodeId(9),
            local_endpoint: 1,
            remote_endpoint: 2
        }]
    );
    assert!(observer.signals.nodes_dirty.is_pending());
    observer.stop().await;
}

#[tokio::test]
async fn test_known_hashes_only_refresh_liveness() {
    let observer = Observer::start().await.unwrap();
    let speaker = Speaker::connect(&observer, 7, 1).await.unwrap();
    speaker.announce(0xaaaa).await.unwrap();
    speaker.send(&[node_state(7, 0xbbbb, &[])]).await.unwrap();
    speaker.recv_reply().await.unwrap();

    speaker
        .send(&[
            Record::NetworkState { hash: Hash(0xaaaa) },
            node_state(7, 0xbbbb, &[]),
        ])
        .await
        .unwrap();
    speaker.expect_silence().await.unwrap();
    assert_eq!(observer.store.neighbour_count(), 1);
    observer.stop().await;
}

#[tokio::test]
async fn test_replies_are_batched_in_record_order() {
    let observer = Observer::start().await.unwrap();
    let speaker = Speaker::connect(&observer, 7, 1).await.unwrap();

    speaker
        .send(&[
            Record::NetworkState { hash: Hash(1) },
            node_state(7, 0x10, &[(8, 1, 1)]),
            node_state(8, 0x20, &[(7, 1, 1)]),
        ])
        .await
        .unwrap();
    let reply = speaker.recv_reply().await.unwrap();

    assert_eq!(
        reply,
        vec![
            Record::RequestNetworkState,
            Record::RequestNodeState {
                node_id: NodeId(7)
            },
            Record::RequestNodeState {
                node_id: NodeId(8)
            },
        ]
    );
    observer.stop().await;
}

#[tokio::test]
async fn test_changed_node_hash_replaces_peers() {
    let observer = Observer::start().await.unwrap();
    let speaker = Speaker::connect(&observer, 7, 1).await.unwrap();
    speaker.announce(0xaaaa).await.unwrap();
    speaker
        .send(&[node_state(7, 0x1, &[(9, 1, 2), (10, 1, 3)])])
        .await
        .unwrap();
    speaker.recv_reply().await.unwrap();

    speaker
        .send(&[node_state(7, 0x2, &[(11, 2, 2)])])
        .await
        .unwrap();
    speaker.recv_reply().await.unwrap();

    let node = observer
        .store
        .node(&speaker.neighbour_id(), NodeId(7))
        .unwrap();
    assert_eq!(node.hash, Hash(0x2));
    assert_eq!(node.peers.len(), 1);
    assert_eq!(node.peers[0].peer_id, NodeId(11));
    observer.stop().await;
}

#[tokio::test]
async fn test_records_without_endpoint_are_ignored() {
    let observer = Observer::start().await.unwrap();
    let speaker = Speaker::connect(&observer, 7, 1).await.unwrap();

    speaker
        .send_raw(&Record::NetworkState { hash: Hash(5) }.encode())
        .await
        .unwrap();
    speaker.expect_silence().await.unwrap();
    assert_eq!(observer.store.neighbour_count(), 0);
    observer.stop().await;
}

#[tokio::test]
async fn test_malformed_tail_keeps_leading_records() {
    let observer = Observer::start().await.unwrap();
    let speaker = Speaker::connect(&observer, 7, 1).await.unwrap();

    let mut datagram = BytesMut::new();
    Record::NodeEndpoint {
        node_id: NodeId(7),
        endpoint_id: 1,
    }
    .encode_into(&mut datagram);
    Record::NetworkState { hash: Hash(0xaaaa) }.encode_into(&mut datagram);
    // NODE-STATE header claiming 64 bytes with only two following.
    datagram.extend_from_slice(&[0x00, 0x05, 0x00, 0x40, 0xde, 0xad]);

    speaker.send_raw(&datagram).await.unwrap();
    let reply = speaker.recv_reply().await.unwrap();

    assert_eq!(reply, vec![Record::RequestNetworkState]);
    assert_eq!(
        observer.store.network_hash(&speaker.neighbour_id()),
        Some(Hash(0xaaaa))
    );
    observer.stop().await;
}
