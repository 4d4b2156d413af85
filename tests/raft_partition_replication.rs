//! Log replication keeps making progress across a quorum while one
//! follower is partitioned away, and that follower catches up once the
//! partition heals.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use ensemble_runtime::cluster::ClusterManager;
use ensemble_runtime::config::RuntimeConfig;
use ensemble_runtime::context::Context;
use ensemble_runtime::raft::types::State;
use ensemble_runtime::testsupport::{Hub, InMemoryDiscovery, InMemoryStorage, InMemoryTransport};
use ensemble_runtime::NodeId;

fn make_node(id: NodeId, hub: &Arc<Hub>, config: &RuntimeConfig) -> Arc<ClusterManager<InMemoryStorage>> {
    let ctx = Context::system();
    let storage = Arc::new(InMemoryStorage::new());
    let discovery: Arc<dyn ensemble_runtime::discovery::Discovery> = Arc::new(InMemoryDiscovery::new());
    let transport: Arc<dyn ensemble_runtime::transport::Transport> = Arc::new(InMemoryTransport::register(hub.clone(), id));
    Arc::new(ClusterManager::new(
        id,
        config.cluster_id.clone(),
        Arc::new(config.raft.clone()),
        config.cluster.clone(),
        ctx,
        discovery,
        transport,
        storage,
    ))
}

async fn wait_for_leader(nodes: &[Arc<ClusterManager<InMemoryStorage>>], timeout: Duration) -> NodeId {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        for node in nodes {
            let m = node.metrics().borrow().clone();
            if m.state == State::Leader {
                return m.id;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "no leader elected in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn writes_commit_over_a_quorum_despite_a_partitioned_follower() {
    let config = RuntimeConfig::build(1, "partition-test").expect("valid config");
    let hub = Hub::new();

    let n1 = make_node(1, &hub, &config);
    let n2 = make_node(2, &hub, &config);
    let n3 = make_node(3, &hub, &config);
    let nodes = vec![n1.clone(), n2.clone(), n3.clone()];

    for n in &nodes {
        n.spawn_background_loops();
    }
    n1.raft().init_with_config(BTreeSet::from([1, 2, 3])).await.expect("bootstrap");

    let leader_id = wait_for_leader(&nodes, Duration::from_secs(5)).await;
    let leader = nodes.iter().find(|n| n.status().node_id == leader_id).unwrap().clone();
    let follower = nodes.iter().find(|n| n.status().node_id != leader_id).unwrap().clone();
    let follower_id = follower.status().node_id;

    hub.isolate(follower_id);

    leader.set("key-a", b"value-a".to_vec()).await.expect("a write over the remaining quorum still commits");

    // The isolated follower never observes the write while partitioned.
    assert_eq!(follower.get("key-a"), None);

    hub.heal(follower_id);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if follower.get("key-a") == Some(b"value-a".to_vec()) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "healed follower should eventually catch up");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
