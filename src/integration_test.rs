use async_std::sync::Arc;
use bytes::Bytes;
use std::time::Duration;
use tokio::time::{Instant, sleep};

use crate::cluster::{ClusterAdapter, Options};
use crate::harness::{Harness, Node};
use crate::keyvalue::{KeyStore, KeyValueStateMachine, ServiceError};
use crate::raft::error::{ApplyError, BootstrapError, MembershipError};
use crate::raft::{Config, FailureOptions, Network, Role};

const TIMEOUT: Duration = Duration::from_secs(5);
const NAMES: [&str; 3] = ["A", "B", "C"];

fn fast_config() -> Config {
    Config::default()
        .with_heartbeat_interval(Duration::from_millis(20))
        .with_election_timeout(Duration::from_millis(150))
}

async fn make_harness(names: &[&str]) -> Harness {
    make_harness_with(names, fast_config()).await
}

async fn make_harness_with(names: &[&str], config: Config) -> Harness {
    Harness::builder(names.iter().map(|n| n.to_string()).collect())
        .with_config(config)
        .build()
        .await
        .expect("harness")
}

async fn leader(harness: &Harness) -> &Node {
    harness.wait_for_leader(TIMEOUT).await.expect("leader")
}

// Waits for a leader other than the supplied node.
async fn wait_for_other_leader<'a>(harness: &'a Harness, excluded: &str) -> &'a Node {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        for node in harness.nodes() {
            if node.name() != excluded && node.cluster().is_leader().await {
                return node;
            }
        }
        assert!(Instant::now() < deadline, "no new leader elected");
        sleep(Duration::from_millis(20)).await;
    }
}

async fn start_adapter(name: &str, network: &Arc<Network>) -> (Arc<KeyStore>, ClusterAdapter) {
    let store = Arc::new(KeyStore::new());
    let fsm = Arc::new(KeyValueStateMachine::new(store.clone()));
    let options = Options::new(network.clone()).with_config(fast_config());
    let adapter = ClusterAdapter::new(name, &format!("address-{}", name), fsm, options)
        .await
        .expect("adapter");
    (store, adapter)
}

#[tokio::test]
async fn test_bootstrap_single_node_leads() {
    let harness = make_harness(&["A"]).await;
    let node = leader(&harness).await;
    assert_eq!("A", node.name());
    assert!(node.cluster().is_leader().await);
    assert_eq!("memory://A", node.cluster().get_leader().await);
    harness.stop().await;
}

#[tokio::test]
async fn test_set_then_delete() {
    let harness = make_harness(&["A"]).await;
    let a = leader(&harness).await;

    a.service().put("k1", "v1").await.expect("put");
    assert_eq!(Some("v1".to_string()), a.service().get("k1").await);

    a.service().delete("k1").await.expect("delete");
    assert_eq!(None, a.service().get("k1").await);
    harness.stop().await;
}

#[tokio::test]
async fn test_bootstrap_twice_fails() {
    let harness = make_harness(&NAMES).await;
    let leader = leader(&harness).await;
    assert!(matches!(
        leader.cluster().bootstrap().await,
        Err(BootstrapError::AlreadyBootstrapped)
    ));

    // Nodes which joined an existing cluster cannot bootstrap either.
    for node in harness.nodes() {
        assert!(node.cluster().bootstrap().await.is_err());
    }
    harness.stop().await;
}

#[tokio::test]
async fn test_replicates_to_all_nodes() {
    let harness = make_harness(&NAMES).await;
    let leader = leader(&harness).await;

    leader.service().put("foo", "bar").await.expect("put");
    for name in NAMES {
        assert!(
            harness.wait_for_key(name, "foo", Some("bar"), TIMEOUT).await,
            "foo never reached {}",
            name
        );
    }

    leader.service().delete("foo").await.expect("delete");
    for name in NAMES {
        assert!(harness.wait_for_key(name, "foo", None, TIMEOUT).await);
    }
    assert!(harness.wait_for_convergence(TIMEOUT).await);
    harness.stop().await;
}

#[tokio::test]
async fn test_add_voter_on_leader_and_follower() {
    let network = Network::new();
    let (_, a) = start_adapter("a", &network).await;
    let (_, b) = start_adapter("b", &network).await;
    let (_, c) = start_adapter("c", &network).await;

    a.bootstrap().await.expect("bootstrap");
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let stats = a.raft().stats().await;
        if stats.role == Role::Leader && stats.commit_index == stats.last_log_index {
            break;
        }
        assert!(Instant::now() < deadline, "a never took over");
        sleep(Duration::from_millis(10)).await;
    }

    a.add_voter("b", "address-b").await.expect("add b");

    // B follows A, so it rejects membership changes and keeps its view.
    let before = b.raft().configuration().await;
    let result = b.add_voter("c", "address-c").await;
    assert!(matches!(result, Err(MembershipError::NotLeader { .. })));
    assert_eq!(before, b.raft().configuration().await);
    assert!(!before.0.is_voter("c"));

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test]
async fn test_put_on_follower_is_rejected() {
    let harness = make_harness(&NAMES).await;
    let leader = leader(&harness).await;
    let follower = harness
        .nodes()
        .iter()
        .find(|n| n.name() != leader.name())
        .expect("follower");

    let result = follower.service().put("foo", "bar").await;
    assert!(matches!(
        result,
        Err(ServiceError::Commit(ApplyError::NotLeader { .. }))
    ));
    assert_eq!(None, follower.service().get("foo").await);
    harness.stop().await;
}

#[tokio::test]
async fn test_leader_failover() {
    let harness = make_harness(&NAMES).await;
    let first = leader(&harness).await;
    first.service().put("k1", "v1").await.expect("put");

    harness.network().disconnect(first.address()).await;
    let second = wait_for_other_leader(&harness, first.name()).await;

    let deadline = Instant::now() + TIMEOUT;
    while second.service().put("k2", "v2").await.is_err() {
        assert!(Instant::now() < deadline, "new leader never accepted writes");
        sleep(Duration::from_millis(20)).await;
    }

    // Entries apply in order, so the earlier committed write is there too.
    assert_eq!(Some("v1".to_string()), second.service().get("k1").await);

    // Once back, the old leader steps down and catches up.
    harness.network().reconnect(first.address()).await;
    assert!(
        harness
            .wait_for_key(first.name(), "k2", Some("v2"), TIMEOUT)
            .await
    );
    assert!(harness.wait_for_convergence(TIMEOUT).await);
    harness.stop().await;
}

#[tokio::test]
async fn test_lagging_follower_catches_up_from_snapshot() {
    let config = fast_config()
        .with_snapshot_interval(Duration::from_millis(50))
        .with_snapshot_threshold(4)
        .with_trailing_logs(1);
    let harness = make_harness_with(&NAMES, config).await;
    let leader = leader(&harness).await;
    let lagging = harness
        .nodes()
        .iter()
        .find(|n| n.name() != leader.name())
        .expect("follower");

    harness.network().disconnect(lagging.address()).await;
    for i in 0..20 {
        leader
            .service()
            .put(&format!("key-{}", i), &format!("value-{}", i))
            .await
            .expect("put");
    }

    // Wait for the leader to compact away the entries the follower misses.
    let deadline = Instant::now() + TIMEOUT;
    while leader.cluster().raft().stats().await.last_snapshot_index < 20 {
        assert!(Instant::now() < deadline, "leader never compacted");
        sleep(Duration::from_millis(20)).await;
    }

    harness.network().reconnect(lagging.address()).await;
    assert!(
        harness
            .wait_for_key(lagging.name(), "key-19", Some("value-19"), TIMEOUT)
            .await
    );
    assert_eq!(20, lagging.store().len().await);
    assert!(harness.wait_for_convergence(TIMEOUT).await);
    harness.stop().await;
}

#[tokio::test]
async fn test_malformed_command_halts_node() {
    let harness = make_harness(&["A"]).await;
    let a = leader(&harness).await;
    a.service().put("k1", "v1").await.expect("put");

    let result = a.cluster().apply(Bytes::from("not an actual valid proto")).await;
    assert!(matches!(result, Err(ApplyError::StateMachine(_))));

    let deadline = Instant::now() + TIMEOUT;
    while a.cluster().raft().state().await != Role::Shutdown {
        assert!(Instant::now() < deadline, "node never halted");
        sleep(Duration::from_millis(10)).await;
    }

    // Nothing applied after the bad entry, and no new writes are accepted.
    assert_eq!(Some("v1".to_string()), a.service().get("k1").await);
    assert!(a.service().put("k2", "v2").await.is_err());
    harness.stop().await;
}

#[tokio::test]
async fn test_get_leader_within_gives_up() {
    let network = Network::new();
    let (_, a) = start_adapter("a", &network).await;
    assert!(a.get_leader_within(Duration::from_millis(50)).await.is_none());

    a.bootstrap().await.expect("bootstrap");
    let leader = a.get_leader_within(TIMEOUT).await.expect("leader");
    assert_eq!("a", leader.id);
    a.shutdown().await;
}

#[tokio::test]
async fn test_converges_with_failures() {
    let harness = Harness::builder(NAMES.iter().map(|n| n.to_string()).collect())
        .with_config(fast_config())
        .with_failure(FailureOptions::fail_with_probability(0.05))
        .build()
        .await
        .expect("harness");

    let deadline = Instant::now() + Duration::from_secs(20);
    for i in 0..10 {
        let key = format!("key-{}", i);
        loop {
            assert!(Instant::now() < deadline, "writes never went through");
            if let Some(leader) = harness.leader().await {
                if leader.service().put(&key, "value").await.is_ok() {
                    break;
                }
            }
            sleep(Duration::from_millis(20)).await;
        }
    }

    *harness.failures().lock().await = FailureOptions::no_failures();
    assert!(harness.wait_for_convergence(TIMEOUT).await);
    for name in NAMES {
        assert!(
            harness
                .wait_for_key(name, "key-9", Some("value"), TIMEOUT)
                .await
        );
    }
    harness.stop().await;
}
