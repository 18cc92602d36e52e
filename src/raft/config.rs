use rand::Rng;
use std::time::Duration;

use crate::raft::error::StartError;
use crate::raft::types::ServerId;

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_ELECTION_TIMEOUT: Duration = Duration::from_millis(300);
const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_MAX_APPEND_ENTRIES: usize = 64;
const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_SNAPSHOT_THRESHOLD: u64 = 1024;
const DEFAULT_TRAILING_LOGS: u64 = 128;

// Parameters used to configure the behavior of a cluster participant.
#[derive(Debug, Clone)]
pub struct Config {
    // The id this participant uses in cluster configurations.
    pub local_id: ServerId,

    // How frequently a leader replicates to its followers. Doubles as the
    // heartbeat, so this must be well below the election timeout.
    pub heartbeat_interval: Duration,

    // Lower bound for how long a follower waits without hearing from a leader
    // before it starts an election. The actual timeout is picked at random
    // from [t, 2t) every time.
    pub election_timeout: Duration,

    // Upper bound for a single call to another participant.
    pub rpc_timeout: Duration,

    // Maximum number of entries carried by a single append request.
    pub max_append_entries: usize,

    // How often to check whether a snapshot should be taken.
    pub snapshot_interval: Duration,

    // Number of entries since the last snapshot after which a new one is taken.
    pub snapshot_threshold: u64,

    // Number of entries to keep in the log after compacting, so that slightly
    // lagging followers can catch up without a snapshot.
    pub trailing_logs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            local_id: String::new(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            election_timeout: DEFAULT_ELECTION_TIMEOUT,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            max_append_entries: DEFAULT_MAX_APPEND_ENTRIES,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
            trailing_logs: DEFAULT_TRAILING_LOGS,
        }
    }
}

impl Config {
    pub fn new(local_id: &str) -> Self {
        Config {
            local_id: local_id.to_string(),
            ..Config::default()
        }
    }

    pub fn with_local_id(self, local_id: &str) -> Self {
        Config {
            local_id: local_id.to_string(),
            ..self
        }
    }

    pub fn with_heartbeat_interval(self, heartbeat_interval: Duration) -> Self {
        Config {
            heartbeat_interval,
            ..self
        }
    }

    pub fn with_election_timeout(self, election_timeout: Duration) -> Self {
        Config {
            election_timeout,
            ..self
        }
    }

    pub fn with_rpc_timeout(self, rpc_timeout: Duration) -> Self {
        Config {
            rpc_timeout,
            ..self
        }
    }

    pub fn with_max_append_entries(self, max_append_entries: usize) -> Self {
        Config {
            max_append_entries,
            ..self
        }
    }

    pub fn with_snapshot_interval(self, snapshot_interval: Duration) -> Self {
        Config {
            snapshot_interval,
            ..self
        }
    }

    pub fn with_snapshot_threshold(self, snapshot_threshold: u64) -> Self {
        Config {
            snapshot_threshold,
            ..self
        }
    }

    pub fn with_trailing_logs(self, trailing_logs: u64) -> Self {
        Config {
            trailing_logs,
            ..self
        }
    }

    pub fn validate(&self) -> Result<(), StartError> {
        if self.local_id.is_empty() {
            return Err(StartError::InvalidConfig("local id is empty".to_string()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(StartError::InvalidConfig(
                "heartbeat interval must be positive".to_string(),
            ));
        }
        if self.election_timeout <= self.heartbeat_interval {
            return Err(StartError::InvalidConfig(format!(
                "election timeout {:?} must exceed heartbeat interval {:?}",
                self.election_timeout, self.heartbeat_interval
            )));
        }
        if self.rpc_timeout.is_zero() {
            return Err(StartError::InvalidConfig(
                "rpc timeout must be positive".to_string(),
            ));
        }
        if self.max_append_entries == 0 {
            return Err(StartError::InvalidConfig(
                "max append entries must be positive".to_string(),
            ));
        }
        if self.snapshot_interval.is_zero() {
            return Err(StartError::InvalidConfig(
                "snapshot interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    // Returns a fresh election timeout in [t, 2t).
    pub fn randomized_election_timeout(&self) -> Duration {
        let lower = self.election_timeout.as_millis() as u64;
        let millis = rand::thread_rng().gen_range(lower..2 * lower);
        Duration::from_millis(millis)
    }
}
