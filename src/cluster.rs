// Binds a state machine to a consensus engine running on the in-memory
// network. This is the entry point hosting processes use to start a node and
// to submit commands to the cluster.

use async_std::sync::Arc;
use bytes::Bytes;
use std::path::Path;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::raft::error::{BootstrapError, MembershipError, StartError};
use crate::raft::{
    ApplyFuture, Config, Configuration, FileSnapshotStore, LeaderInfo, MemoryLogStore,
    MemorySnapshotStore, MemoryStableStore, MemoryTransport, Network, Raft, Role, Server,
    ServerAddress, ServerId, SnapshotStore, StateMachine,
};

// How long to sleep between two leader lookups.
pub const ELECTION_WAIT: Duration = Duration::from_millis(10);

pub const ADD_VOTER_TIMEOUT: Duration = Duration::from_millis(500);
pub const APPLY_TIMEOUT: Duration = Duration::from_secs(1);

const DEFAULT_SNAPSHOT_RETAIN: usize = 2;

// Holds the knobs for starting a node. The engine config acts as a template,
// its local id is always replaced by the id of the node being started.
#[derive(Clone)]
pub struct Options {
    network: Arc<Network>,
    config: Config,
    snapshot_directory: Option<String>,
    snapshot_retain: usize,
    span: Span,
}

impl Options {
    pub fn new(network: Arc<Network>) -> Self {
        Options {
            network,
            config: Config::default(),
            snapshot_directory: None,
            snapshot_retain: DEFAULT_SNAPSHOT_RETAIN,
            span: Span::none(),
        }
    }

    pub fn with_config(self, config: Config) -> Self {
        Options { config, ..self }
    }

    // Snapshots are kept in memory unless a directory is supplied. Each node
    // uses its own subdirectory.
    pub fn with_snapshot_directory(self, directory: &str) -> Self {
        Options {
            snapshot_directory: Some(directory.to_string()),
            ..self
        }
    }

    pub fn with_snapshot_retain(self, snapshot_retain: usize) -> Self {
        Options {
            snapshot_retain,
            ..self
        }
    }

    // All log lines emitted by the node are scoped to this span.
    pub fn with_span(self, span: Span) -> Self {
        Options { span, ..self }
    }
}

pub struct ClusterAdapter {
    id: ServerId,
    address: ServerAddress,
    raft: Raft,
    transport: Arc<MemoryTransport>,
    span: Span,
}

impl ClusterAdapter {
    // Wires up the stores and the transport, then starts the engine. Nodes
    // which fail to start cannot serve, callers are expected to give up.
    pub async fn new(
        id: &str,
        address: &str,
        state_machine: Arc<dyn StateMachine>,
        options: Options,
    ) -> Result<ClusterAdapter, StartError> {
        let span = options.span.clone();
        let raft = ClusterAdapter::start_raft(id, address, state_machine, &options)
            .instrument(span.clone())
            .await;
        let (raft, transport) = match raft {
            Ok(started) => started,
            Err(e) => {
                error!(parent: &span, id, address, "failed to start consensus engine: {}", e);
                return Err(e);
            }
        };

        Ok(ClusterAdapter {
            id: id.to_string(),
            address: address.to_string(),
            raft,
            transport,
            span,
        })
    }

    async fn start_raft(
        id: &str,
        address: &str,
        state_machine: Arc<dyn StateMachine>,
        options: &Options,
    ) -> Result<(Raft, Arc<MemoryTransport>), StartError> {
        let snapshot_store: Arc<dyn SnapshotStore> = match &options.snapshot_directory {
            Some(directory) => {
                let path = Path::new(directory).join(id);
                let store =
                    FileSnapshotStore::new(&path.to_string_lossy(), options.snapshot_retain).await?;
                Arc::new(store)
            }
            None => Arc::new(MemorySnapshotStore::new(options.snapshot_retain)),
        };
        let transport = Arc::new(MemoryTransport::new(address, options.network.clone()));

        let raft = Raft::start(
            options.config.clone().with_local_id(id),
            state_machine,
            Arc::new(MemoryLogStore::new()),
            Arc::new(MemoryStableStore::new()),
            snapshot_store,
            transport.clone(),
        )
        .await?;
        Ok((raft, transport))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    // Returns whether this node currently believes it leads the cluster. The
    // answer can be stale by the time the caller looks at it.
    pub async fn is_leader(&self) -> bool {
        self.raft.state().await == Role::Leader
    }

    // Blocks until some leader is known and returns its address. Never gives
    // up, use get_leader_within to bound the wait.
    pub async fn get_leader(&self) -> ServerAddress {
        loop {
            if let Some(leader) = self.raft.leader_with_id().await {
                return leader.address;
            }
            sleep(ELECTION_WAIT).await;
        }
    }

    // Like get_leader, but returns None if no leader shows up in time.
    pub async fn get_leader_within(&self, timeout: Duration) -> Option<LeaderInfo> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.raft.leader_with_id().await {
                return Some(leader);
            }
            if Instant::now() >= deadline {
                debug!(parent: &self.span, ?timeout, "no leader known");
                return None;
            }
            sleep(ELECTION_WAIT).await;
        }
    }

    // Starts a new cluster with this node as its only voter. Must only be
    // called once, on a node which has never been part of a cluster.
    pub async fn bootstrap(&self) -> Result<(), BootstrapError> {
        let configuration = Configuration::new(vec![Server::voter(&self.id, &self.address)]);
        match self.raft.bootstrap_cluster(configuration).await {
            Ok(()) => {
                info!(parent: &self.span, id = %self.id, "bootstrapped single node cluster");
                Ok(())
            }
            Err(e) => {
                error!(parent: &self.span, id = %self.id, "failed to bootstrap cluster: {}", e);
                Err(e)
            }
        }
    }

    // Asks the engine to add a voting member. Only succeeds on the leader.
    // The change is rejected if the configuration moved on while the request
    // was in flight.
    pub async fn add_voter(&self, id: &str, address: &str) -> Result<(), MembershipError> {
        let (_, prev_index) = self.raft.configuration().await;
        match self
            .raft
            .add_voter(id, address, prev_index, ADD_VOTER_TIMEOUT)
            .await
        {
            Ok(index) => {
                info!(parent: &self.span, voter = id, address, index, "added voter");
                Ok(())
            }
            Err(e) => {
                warn!(parent: &self.span, voter = id, address, "failed to add voter: {}", e);
                Err(e)
            }
        }
    }

    // Submits an encoded command. The engine rejects it if this node does not
    // lead the cluster.
    pub fn apply(&self, command: Bytes) -> ApplyFuture {
        self.raft.apply(command, APPLY_TIMEOUT)
    }

    pub fn raft(&self) -> &Raft {
        &self.raft
    }

    pub fn network(&self) -> Arc<Network> {
        self.transport.network()
    }

    pub async fn shutdown(&self) {
        self.raft.shutdown().await;
    }
}
