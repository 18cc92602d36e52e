use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};

use crate::raft::error::{FsmError, RestoreError, SnapshotError};
use crate::raft::types::Entry;

pub type SnapshotReader = Box<dyn AsyncRead + Send + Unpin>;

// A state machine kept on every server in a raft cluster. The engine calls
// these methods from a single task, one at a time, in commit order.
#[async_trait]
pub trait StateMachine: Send + Sync {
    // Incorporates a committed entry carrying a command payload. Returning an
    // error halts the engine, since replicas must never diverge.
    async fn apply(&self, entry: &Entry) -> Result<(), FsmError>;

    // Captures the current state. The returned artifact is persisted later,
    // while the engine keeps applying new entries.
    async fn snapshot(&self) -> Result<Box<dyn SnapshotArtifact>, SnapshotError>;

    // Replaces the entire state with the contents of the supplied stream.
    async fn restore(&self, reader: SnapshotReader) -> Result<(), RestoreError>;
}

// A point-in-time copy of a state machine, produced by StateMachine::snapshot.
#[async_trait]
pub trait SnapshotArtifact: Send {
    // Writes the captured state to the supplied sink.
    async fn persist(&self, sink: &mut (dyn AsyncWrite + Send + Unpin))
    -> Result<(), SnapshotError>;

    // Called once the engine is done with the artifact, whether or not
    // persisting succeeded.
    fn release(&mut self);
}
