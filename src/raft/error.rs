use std::time::Duration;
use thiserror::Error;

use crate::raft::types::LeaderInfo;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failures of the durable stores backing an engine.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt storage: {0}")]
    Corrupt(String),
}

/// Violations of the log's structural invariants.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum LogError {
    #[error("Non-contiguous log entries supplied. Expected index {expected}, got {actual}")]
    NonContiguous { expected: u64, actual: u64 },

    #[error("Log entry {index} has term {term}, lower than its predecessor's {previous}")]
    TermRegression { index: u64, term: u64, previous: u64 },
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No server listening on {0}")]
    Unreachable(String),

    #[error("Channel {src} -> {dst} is disconnected")]
    Disconnected { src: String, dst: String },

    #[error("Failure injection in channel {src} -> {dst}")]
    Injected { src: String, dst: String },

    #[error("Address {0} is already in use")]
    AddressInUse(String),

    #[error("Request to {0} timed out")]
    Timeout(String),
}

/// Fatal errors while starting an engine. A node cannot serve without one.
#[derive(Error, Debug)]
pub enum StartError {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Failed to load persisted state: {0}")]
    Storage(#[from] StorageError),

    #[error("Persisted log is invalid: {0}")]
    Log(#[from] LogError),

    #[error("Failed to restore latest snapshot: {0}")]
    Restore(#[from] RestoreError),

    #[error("Failed to start transport: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("Bootstrap only works on new clusters, this node already has state")]
    AlreadyBootstrapped,

    #[error("Invalid bootstrap configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Failed to persist bootstrap state: {0}")]
    Storage(#[from] StorageError),

    #[error("Engine is shut down")]
    Shutdown,
}

/// Errors from membership changes. Callers may retry against the leader.
#[derive(Error, Debug)]
pub enum MembershipError {
    #[error("Not the leader, last known leader: {leader:?}")]
    NotLeader { leader: Option<LeaderInfo> },

    #[error("Configuration changed, expected index {expected}, latest is {actual}")]
    ConfigurationChanged { expected: u64, actual: u64 },

    #[error("A configuration change is already in progress")]
    ConfigurationPending,

    #[error("Invalid configuration change: {0}")]
    InvalidConfiguration(String),

    #[error("Configuration change not committed within {0:?}")]
    Timeout(Duration),

    #[error("Failed to commit configuration change: {0}")]
    Apply(#[from] ApplyError),

    #[error("Failed to persist configuration change: {0}")]
    Storage(#[from] StorageError),

    #[error("Engine is shut down")]
    Shutdown,
}

/// Errors from submitting commands. Callers decide whether to retry.
#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("Not the leader, last known leader: {leader:?}")]
    NotLeader { leader: Option<LeaderInfo> },

    #[error("Leadership lost before the entry committed")]
    LeadershipLost,

    #[error("Entry not committed within {0:?}")]
    Timeout(Duration),

    #[error("Failed to persist entry: {0}")]
    Storage(#[from] StorageError),

    #[error("State machine failed: {0}")]
    StateMachine(#[from] FsmError),

    #[error("Engine is shut down")]
    Shutdown,
}

/// Returned by state machines that cannot apply a committed entry. Every
/// replica must apply the same entries, so engines halt on these.
#[derive(Error, Debug)]
pub enum FsmError {
    #[error("Entry {index} could not be decoded: {source}")]
    Decode {
        index: u64,
        #[source]
        source: BoxError,
    },
}

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Nothing new to snapshot")]
    NothingNew,

    #[error("Failed to encode snapshot: {0}")]
    Encode(String),

    #[error("Failed to write snapshot: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to store snapshot: {0}")]
    Storage(#[from] StorageError),

    #[error("Engine is shut down")]
    Shutdown,
}

#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("Failed to read snapshot: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed snapshot: {0}")]
    Malformed(#[source] BoxError),

    #[error("Engine is shut down")]
    Shutdown,
}
