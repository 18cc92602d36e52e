use async_std::sync::{Arc, Mutex};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::raft::error::TransportError;
use crate::raft::types::{
    AppendRequest, AppendResponse, InstallSnapshotRequest, InstallSnapshotResponse, ServerAddress,
    VoteRequest, VoteResponse,
};

// The receiving side of the raft protocol, implemented by the engine.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn request_vote(&self, request: VoteRequest) -> VoteResponse;
    async fn append_entries(&self, request: AppendRequest) -> AppendResponse;
    async fn install_snapshot(&self, request: InstallSnapshotRequest) -> InstallSnapshotResponse;
}

// Carries raft calls between participants.
#[async_trait]
pub trait Transport: Send + Sync {
    // The address other participants use to reach this one.
    fn local_addr(&self) -> ServerAddress;

    // Starts delivering incoming calls to the supplied handler.
    async fn serve(&self, handler: Arc<dyn RpcHandler>) -> Result<(), TransportError>;

    async fn request_vote(
        &self,
        target: &str,
        request: VoteRequest,
    ) -> Result<VoteResponse, TransportError>;

    async fn append_entries(
        &self,
        target: &str,
        request: AppendRequest,
    ) -> Result<AppendResponse, TransportError>;

    async fn install_snapshot(
        &self,
        target: &str,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, TransportError>;

    // Stops delivering incoming calls.
    async fn close(&self);
}

// Options used to control failure injection on a network.
#[derive(Debug, Clone, Default)]
pub struct FailureOptions {
    // Probability with which calls fail before reaching their target.
    pub failure_probability: f64,

    // Probability with which to add latency to calls.
    pub latency_probability: f64,

    // How much latency to add for calls with additional latency.
    pub latency_ms: u32,

    // Addresses which can neither send nor receive calls.
    pub disconnected: HashSet<ServerAddress>,
}

impl FailureOptions {
    // Returns failure injection options which don't add any failures.
    pub fn no_failures() -> Self {
        FailureOptions::default()
    }

    // Returns failure injection options which fail calls with the supplied probability.
    pub fn fail_with_probability(failure_probability: f64) -> Self {
        FailureOptions {
            failure_probability,
            ..FailureOptions::default()
        }
    }
}

// An in-process registry of participants, standing in for a real network.
// Every participant in a cluster must use transports created for the same
// network.
pub struct Network {
    handlers: Mutex<HashMap<ServerAddress, Weak<dyn RpcHandler>>>,
    failures: Arc<Mutex<FailureOptions>>,
}

impl Network {
    pub fn new() -> Arc<Self> {
        Network::with_failures(FailureOptions::no_failures())
    }

    pub fn with_failures(failures: FailureOptions) -> Arc<Self> {
        Arc::new(Network {
            handlers: Mutex::new(HashMap::new()),
            failures: Arc::new(Mutex::new(failures)),
        })
    }

    // Returns the failure options, which can be changed while the network is in use.
    pub fn failures(&self) -> Arc<Mutex<FailureOptions>> {
        self.failures.clone()
    }

    // Cuts the supplied address off from all other participants.
    pub async fn disconnect(&self, address: &str) {
        self.failures
            .lock()
            .await
            .disconnected
            .insert(address.to_string());
    }

    pub async fn reconnect(&self, address: &str) {
        self.failures.lock().await.disconnected.remove(address);
    }

    async fn register(
        &self,
        address: &str,
        handler: Arc<dyn RpcHandler>,
    ) -> Result<(), TransportError> {
        let mut handlers = self.handlers.lock().await;
        let live = handlers
            .get(address)
            .is_some_and(|existing| existing.strong_count() > 0);
        if live {
            return Err(TransportError::AddressInUse(address.to_string()));
        }
        handlers.insert(address.to_string(), Arc::downgrade(&handler));
        Ok(())
    }

    async fn unregister(&self, address: &str) {
        self.handlers.lock().await.remove(address);
    }

    // Applies failure injection to a call from src to dst and returns the
    // handler serving dst.
    async fn route(&self, src: &str, dst: &str) -> Result<Arc<dyn RpcHandler>, TransportError> {
        let (fail, latency) = {
            let failures = self.failures.lock().await;
            if failures.disconnected.contains(src) || failures.disconnected.contains(dst) {
                return Err(TransportError::Disconnected {
                    src: src.to_string(),
                    dst: dst.to_string(),
                });
            }
            let fail = rand::random::<f64>() < failures.failure_probability;
            let delay = rand::random::<f64>() < failures.latency_probability;
            (fail, if delay { failures.latency_ms } else { 0 })
        };

        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency as u64)).await;
        }
        if fail {
            return Err(TransportError::Injected {
                src: src.to_string(),
                dst: dst.to_string(),
            });
        }

        self.handlers
            .lock()
            .await
            .get(dst)
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::Unreachable(dst.to_string()))
    }
}

// A transport which delivers calls to other participants on the same Network.
pub struct MemoryTransport {
    address: ServerAddress,
    network: Arc<Network>,
}

impl MemoryTransport {
    pub fn new(address: &str, network: Arc<Network>) -> Self {
        MemoryTransport {
            address: address.to_string(),
            network,
        }
    }

    pub fn network(&self) -> Arc<Network> {
        self.network.clone()
    }
}

// Incoming calls run on their own task, so that a caller giving up on a call
// does not abandon the handler halfway through.
async fn deliver<T>(target: &str, handle: JoinHandle<T>) -> Result<T, TransportError> {
    handle
        .await
        .map_err(|_| TransportError::Unreachable(target.to_string()))
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_addr(&self) -> ServerAddress {
        self.address.clone()
    }

    async fn serve(&self, handler: Arc<dyn RpcHandler>) -> Result<(), TransportError> {
        self.network.register(&self.address, handler).await?;
        debug!(address = %self.address, "serving");
        Ok(())
    }

    async fn request_vote(
        &self,
        target: &str,
        request: VoteRequest,
    ) -> Result<VoteResponse, TransportError> {
        let handler = self.network.route(&self.address, target).await?;
        deliver(
            target,
            tokio::spawn(async move { handler.request_vote(request).await }),
        )
        .await
    }

    async fn append_entries(
        &self,
        target: &str,
        request: AppendRequest,
    ) -> Result<AppendResponse, TransportError> {
        let handler = self.network.route(&self.address, target).await?;
        deliver(
            target,
            tokio::spawn(async move { handler.append_entries(request).await }),
        )
        .await
    }

    async fn install_snapshot(
        &self,
        target: &str,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, TransportError> {
        let handler = self.network.route(&self.address, target).await?;
        deliver(
            target,
            tokio::spawn(async move { handler.install_snapshot(request).await }),
        )
        .await
    }

    async fn close(&self) {
        self.network.unregister(&self.address).await;
        debug!(address = %self.address, "closed");
    }
}
