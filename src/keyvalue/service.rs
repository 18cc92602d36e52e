use async_std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cluster::ClusterAdapter;
use crate::keyvalue::command::Command;
use crate::keyvalue::store::KeyStore;
use crate::raft::error::ApplyError;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed to commit: {0}")]
    Commit(#[from] ApplyError),
}

// Accepts client reads and writes for one node. Writes go through the cluster
// and only show up in the local store once committed and applied. Reads are
// served from the local store and may lag behind the leader.
pub struct KeyValueService {
    name: String,
    store: Arc<KeyStore>,
    cluster: Arc<ClusterAdapter>,
}

impl KeyValueService {
    pub fn new(name: &str, store: Arc<KeyStore>, cluster: Arc<ClusterAdapter>) -> Self {
        KeyValueService {
            name: name.to_string(),
            store,
            cluster,
        }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        debug!(name = %self.name, key, "handling get");
        self.store.get(key).await
    }

    // Returns the log index at which the write was committed.
    pub async fn put(&self, key: &str, value: &str) -> Result<u64, ServiceError> {
        if key.is_empty() {
            return Err(ServiceError::InvalidArgument("Empty key".to_string()));
        }
        self.commit("put", Command::set(key, value)).await
    }

    pub async fn delete(&self, key: &str) -> Result<u64, ServiceError> {
        if key.is_empty() {
            return Err(ServiceError::InvalidArgument("Empty key".to_string()));
        }
        self.commit("delete", Command::delete(key)).await
    }

    async fn commit(&self, operation: &str, command: Command) -> Result<u64, ServiceError> {
        match self.cluster.apply(command.encode()).await {
            Ok(index) => {
                info!(name = %self.name, key = command.key(), index, "committed {}", operation);
                Ok(index)
            }
            Err(e) => {
                warn!(name = %self.name, key = command.key(), "failed to commit {}: {}", operation, e);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Options;
    use crate::keyvalue::KeyValueStateMachine;
    use crate::raft::{Config, Network};
    use std::time::Duration;

    async fn make_service(bootstrap: bool) -> (Arc<ClusterAdapter>, KeyValueService) {
        let store = Arc::new(KeyStore::new());
        let fsm = Arc::new(KeyValueStateMachine::new(store.clone()));
        let config = Config::default()
            .with_heartbeat_interval(Duration::from_millis(20))
            .with_election_timeout(Duration::from_millis(100));
        let options = Options::new(Network::new()).with_config(config);
        let cluster = Arc::new(
            ClusterAdapter::new("a", "address-a", fsm, options)
                .await
                .expect("cluster"),
        );
        if bootstrap {
            cluster.bootstrap().await.expect("bootstrap");
            cluster
                .get_leader_within(Duration::from_secs(5))
                .await
                .expect("leader");
        }
        let service = KeyValueService::new("a", store, cluster.clone());
        (cluster, service)
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let (cluster, service) = make_service(true).await;
        assert_eq!(None, service.get("foo").await);

        let first = service.put("foo", "bar").await.expect("put");
        assert_eq!(Some("bar".to_string()), service.get("foo").await);

        let second = service.delete("foo").await.expect("delete");
        assert!(second > first);
        assert_eq!(None, service.get("foo").await);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_key() {
        let (cluster, service) = make_service(true).await;
        assert!(matches!(
            service.put("", "bar").await,
            Err(ServiceError::InvalidArgument(_))
        ));
        assert!(matches!(
            service.delete("").await,
            Err(ServiceError::InvalidArgument(_))
        ));
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_put_without_leadership() {
        let (cluster, service) = make_service(false).await;
        assert!(matches!(
            service.put("foo", "bar").await,
            Err(ServiceError::Commit(ApplyError::NotLeader { .. }))
        ));
        assert_eq!(None, service.get("foo").await);
        cluster.shutdown().await;
    }
}
