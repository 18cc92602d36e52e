mod config;
pub use config::Config;

mod consensus;
pub use consensus::Raft;

pub mod error;

mod future;
pub use future::ApplyFuture;

mod log;

mod persistence;
pub use persistence::FileSnapshotStore;

mod state_machine;
pub use state_machine::{SnapshotArtifact, SnapshotReader, StateMachine};

mod storage;
pub use storage::{
    LogStore, MemoryLogStore, MemorySnapshotStore, MemoryStableStore, SnapshotStore, StableStore,
};

mod transport;
pub use transport::{FailureOptions, MemoryTransport, Network, RpcHandler, Transport};

mod types;
pub use types::{
    Configuration, Entry, EntryData, LeaderInfo, RaftStats, Role, Server, ServerAddress, ServerId,
    SnapshotMeta, Suffrage,
};

#[cfg(test)]
pub mod testing;
