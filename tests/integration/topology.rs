use crate::*;

use topomap_core::NodeState;

fn bare_node(node_id: u32, hash: u64) -> Record {
    Record::NodeState(NodeState {
        node_id: NodeId(node_id),
        seqno: 1,
        origin_age: 0,
        hash: Hash(hash),
        peers: Vec::new(),
        skipped: 0,
    })
}

async fn report(speaker: &Speaker, node_id: u32, hash: u64) {
    speaker.send(&[bare_node(node_id, hash)]).await.unwrap();
    speaker.recv_reply().await.unwrap();
}

#[tokio::test]
async fn test_same_node_from_two_neighbours_is_published_once() {
    let observer = Observer::start().await.unwrap();
    let a = Speaker::connect(&observer, 1, 1).await.unwrap();
    let b = Speaker::connect(&observer, 2, 1).await.unwrap();
    a.announce(0xa).await.unwrap();
    b.announce(0xb).await.unwrap();

    report(&a, 5, 0x55a).await;
    report(&b, 5, 0x55b).await;

    assert_eq!(observer.store.reported_node_count(), 2);
    assert_eq!(observer.store.aggregate(), 1);
    let nodes = observer.store.published_nodes();
    assert_eq!(nodes[0].id, NodeId(5));
    assert_eq!(nodes[0].hash, Hash(0x55b), "most recently heard copy wins");

    // Hearing from A again makes its copy the freshest.
    report(&a, 6, 0x66).await;
    observer.store.aggregate();
    let nodes = observer.store.published_nodes();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0].hash, Hash(0x55a));
    assert_eq!(nodes[1].id, NodeId(6));
    observer.stop().await;
}

#[tokio::test]
async fn test_expiry_removes_only_the_silent_neighbour() {
    let observer = Observer::start().await.unwrap();
    let a = Speaker::connect(&observer, 1, 1).await.unwrap();
    let b = Speaker::connect(&observer, 2, 1).await.unwrap();
    a.announce(0xa).await.unwrap();
    report(&a, 5, 0x55a).await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    b.announce(0xb).await.unwrap();
    report(&b, 5, 0x55b).await;

    let expired = observer.store.expire_stale(Duration::from_millis(250));
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, a.neighbour_id());
    assert_eq!(expired[0].node_count, 1);

    assert_eq!(observer.store.neighbour_ids(), vec![b.neighbour_id()]);
    let kept = observer
        .store
        .node(&b.neighbour_id(), NodeId(5))
        .expect("b's copy of node 5 must survive a's expiry");
    assert_eq!(kept.hash, Hash(0x55b));
    observer.stop().await;
}

#[tokio::test]
async fn test_expired_neighbour_is_rediscovered() {
    let observer = Observer::start().await.unwrap();
    let a = Speaker::connect(&observer, 1, 1).await.unwrap();
    a.announce(0xa).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(observer.store.expire_stale(Duration::from_millis(10)).len(), 1);
    assert_eq!(observer.store.neighbour_count(), 0);

    // Same hash as before, but the neighbour is new again.
    a.announce(0xa).await.unwrap();
    assert!(eventually(|| observer.store.neighbour_count() == 1).await);
    observer.stop().await;
}

#[test]
fn test_link_local_zone_separates_neighbours() {
    let store = TopologyStore::new();
    let sync = Synchronizer::new(store.clone(), ChangeSignals::new());

    let mut datagram = BytesMut::new();
    Record::NodeEndpoint {
        node_id: NodeId(7),
        endpoint_id: 1,
    }
    .encode_into(&mut datagram);
    Record::NetworkState { hash: Hash(0xaaaa) }.encode_into(&mut datagram);

    let first = sync.handle_datagram(link_local(1, 2), &datagram);
    let second = sync.handle_datagram(link_local(1, 3), &datagram);
    assert_eq!(first.replies.len(), 1);
    assert_eq!(second.replies.len(), 1);

    let zones: Vec<u32> = store.neighbour_ids().iter().map(|id| id.zone).collect();
    assert_eq!(zones, vec![2, 3]);
}
