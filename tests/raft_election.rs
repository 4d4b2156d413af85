//! Three replicas sharing an in-memory transport hub elect a leader once
//! the founding member's initial membership is set, exercising the
//! network dispatch loop that turns `Transport` into live Raft RPCs.

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

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_cluster_elects_exactly_one_leader() {
    let config = RuntimeConfig::build(1, "election-test").expect("valid config");
    let hub = Hub::new();

    let n1 = make_node(1, &hub, &config);
    let n2 = make_node(2, &hub, &config);
    let n3 = make_node(3, &hub, &config);

    n1.spawn_background_loops();
    n2.spawn_background_loops();
    n3.spawn_background_loops();

    n1.raft().init_with_config(BTreeSet::from([1, 2, 3])).await.expect("bootstrap with full membership");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut leader_metrics = None;
    while tokio::time::Instant::now() < deadline {
        let m = n1.metrics().borrow().clone();
        if m.state == State::Leader {
            leader_metrics = Some(m);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let metrics = leader_metrics.expect("node 1 should become leader");
    assert_eq!(metrics.current_term, 1);
    assert_eq!(metrics.current_leader, Some(1));

    // The followers never themselves claim leadership in this term.
    assert_ne!(n2.metrics().borrow().state, State::Leader);
    assert_ne!(n3.metrics().borrow().state, State::Leader);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_member_cluster_becomes_leader_immediately() {
    let config = RuntimeConfig::build(1, "solo-test").expect("valid config");
    let hub = Hub::new();
    let n1 = make_node(1, &hub, &config);
    n1.spawn_background_loops();

    n1.bootstrap().await.expect("bootstrap solo cluster");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if n1.metrics().borrow().state == State::Leader {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "solo node should become leader quickly");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    n1.set("hello", b"world".to_vec()).await.expect("a quorum of one can always commit");
    assert_eq!(n1.get("hello"), Some(b"world".to_vec()));
}
