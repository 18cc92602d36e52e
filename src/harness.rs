use async_std::sync::{Arc, Mutex};
use futures::Future;
use futures::future::join_all;
use std::error::Error;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, info_span, warn};

use crate::cluster::{ClusterAdapter, Options};
use crate::keyvalue::{KeyStore, KeyValueService, KeyValueStateMachine};
use crate::raft::{Config, FailureOptions, Network, Role};

// How long building a harness waits for the cluster to form.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const JOIN_RETRY: Duration = Duration::from_millis(50);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

// Represents a collection of nodes that replicate the same key-value store. In a
// real deployment, these nodes would live on different machines, but the
// harness runs all of them in a single process on a shared in-memory network.
pub struct Harness {
    nodes: Vec<Node>,
    network: Arc<Network>,
}

// Captures the settings for a harness before any node is started.
pub struct HarnessBuilder {
    names: Vec<String>,
    config: Config,
    failure: FailureOptions,
    snapshot_directory: Option<String>,
}

impl HarnessBuilder {
    // Starts one node per name, bootstraps the cluster on the first one and
    // adds all the others as voters. Failures are only injected once all
    // nodes have joined.
    pub async fn build(self) -> Result<Harness, Box<dyn Error>> {
        if self.names.is_empty() {
            return Err("Need at least one node".into());
        }

        let network = Network::new();
        let mut nodes = Vec::new();
        for name in &self.names {
            let mut options = Options::new(network.clone())
                .with_config(self.config.clone())
                .with_span(info_span!("node", name = %name));
            if let Some(directory) = &self.snapshot_directory {
                options = options.with_snapshot_directory(directory);
            }
            nodes.push(Node::start(name, &address(name), options).await?);
        }
        let harness = Harness { nodes, network };

        if let Err(e) = harness.form_cluster().await {
            harness.stop().await;
            return Err(e);
        }

        *harness.network.failures().lock().await = self.failure;
        info!(nodes = harness.nodes.len(), "cluster formed");
        Ok(harness)
    }

    // Consumes this instance and returns an instance with the failure options set.
    pub fn with_failure(self, failure: FailureOptions) -> Self {
        Self { failure, ..self }
    }

    // Consumes this instance and returns an instance with the engine config set.
    // The local id of the config is replaced for every node.
    pub fn with_config(self, config: Config) -> Self {
        Self { config, ..self }
    }

    pub fn with_snapshot_directory(self, directory: &str) -> Self {
        Self {
            snapshot_directory: Some(directory.to_string()),
            ..self
        }
    }
}

impl Harness {
    pub fn builder(names: Vec<String>) -> HarnessBuilder {
        HarnessBuilder {
            names,
            config: Config::default(),
            failure: FailureOptions::no_failures(),
            snapshot_directory: None,
        }
    }

    async fn form_cluster(&self) -> Result<(), Box<dyn Error>> {
        let first = self.nodes.first().ok_or("Need at least one node")?;
        first.cluster.bootstrap().await?;
        if self.wait_for_leader(JOIN_TIMEOUT).await.is_none() {
            return Err(format!("{} did not become leader", first.name).into());
        }
        for node in self.nodes.iter().skip(1) {
            self.join(node).await?;
        }
        Ok(())
    }

    // Adds the supplied node as a voter, retrying against whichever node
    // currently leads until the join deadline.
    async fn join(&self, node: &Node) -> Result<(), Box<dyn Error>> {
        let deadline = Instant::now() + JOIN_TIMEOUT;
        loop {
            match self.leader().await {
                Some(leader) => match leader.cluster.add_voter(&node.name, &node.address).await {
                    Ok(()) => {
                        debug!(node = %node.name, "joined");
                        return Ok(());
                    }
                    Err(e) => debug!(node = %node.name, "join attempt failed: {}", e),
                },
                None => debug!(node = %node.name, "no leader to join through"),
            }
            if Instant::now() >= deadline {
                return Err(format!("{} failed to join within {:?}", node.name, JOIN_TIMEOUT).into());
            }
            sleep(JOIN_RETRY).await;
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    // Returns a node which currently believes it is the leader, if any.
    pub async fn leader(&self) -> Option<&Node> {
        for node in &self.nodes {
            if node.cluster.is_leader().await {
                return Some(node);
            }
        }
        None
    }

    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<&Node> {
        wait_for(timeout, move || async move { self.leader().await }).await
    }

    // Waits until the named node holds the expected value for the key. Passing
    // None waits for the key to be absent.
    pub async fn wait_for_key(
        &self,
        name: &str,
        key: &str,
        expected: Option<&str>,
        timeout: Duration,
    ) -> bool {
        let Some(node) = self.node(name) else {
            warn!(name, "unknown node");
            return false;
        };
        let result = wait_for(timeout, move || async move {
            let value = node.store.get(key).await;
            (value.as_deref() == expected).then_some(())
        })
        .await;
        result.is_some()
    }

    // Waits until every running node holds the same entries.
    pub async fn wait_for_convergence(&self, timeout: Duration) -> bool {
        let result = wait_for(timeout, move || async move {
            let mut contents = Vec::new();
            for node in &self.nodes {
                if node.cluster.raft().state().await != Role::Shutdown {
                    contents.push(node.store.snapshot().await);
                }
            }
            contents.windows(2).all(|w| w[0] == w[1]).then_some(())
        })
        .await;
        result.is_some()
    }

    // Returns the failure options of the shared network. Changes take effect
    // for all subsequent calls between nodes.
    pub fn failures(&self) -> Arc<Mutex<FailureOptions>> {
        self.network.failures()
    }

    pub fn network(&self) -> Arc<Network> {
        self.network.clone()
    }

    // Stops all the nodes of this harness.
    pub async fn stop(&self) {
        join_all(self.nodes.iter().map(|n| n.cluster.shutdown())).await;
        info!("all nodes stopped");
    }
}

// A single member of the harness: its store, the state machine feeding it and
// the service that accepts client requests.
pub struct Node {
    name: String,
    address: String,
    store: Arc<KeyStore>,
    cluster: Arc<ClusterAdapter>,
    service: KeyValueService,
}

impl Node {
    async fn start(name: &str, address: &str, options: Options) -> Result<Node, Box<dyn Error>> {
        let store = Arc::new(KeyStore::new());
        let fsm = Arc::new(KeyValueStateMachine::new(store.clone()));
        let cluster = ClusterAdapter::new(name, address, fsm, options)
            .await
            .map_err(|e| format!("Failed to start '{}': {}", name, e))?;
        let cluster = Arc::new(cluster);
        let service = KeyValueService::new(name, store.clone(), cluster.clone());
        Ok(Node {
            name: name.to_string(),
            address: address.to_string(),
            store,
            cluster,
            service,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn store(&self) -> &KeyStore {
        &self.store
    }

    pub fn cluster(&self) -> &ClusterAdapter {
        &self.cluster
    }

    pub fn service(&self) -> &KeyValueService {
        &self.service
    }
}

fn address(name: &str) -> String {
    format!("memory://{}", name)
}

// Evaluates the condition until it yields a value or the timeout elapses.
async fn wait_for<F, Fut, T>(timeout: Duration, mut condition: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = Instant::now();
    loop {
        if let Some(result) = condition().await {
            return Some(result);
        }
        if start.elapsed() >= timeout {
            return None;
        }
        sleep(POLL_INTERVAL).await;
    }
}
