use async_std::sync::{Arc, Mutex};
use async_trait::async_trait;
use bytes::Bytes;
use futures::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep};

use crate::raft::error::{FsmError, RestoreError, SnapshotError};
use crate::raft::state_machine::{SnapshotArtifact, SnapshotReader, StateMachine};
use crate::raft::types::Entry;

// Payload which makes the fake state machine fail to apply an entry.
pub const POISON: &[u8] = b"poison";

// A fake implementation of the StateMachine trait for testing purposes. Keeps
// every applied payload, in order.
pub struct FakeStateMachine {
    applied: Mutex<Vec<Bytes>>,
    restores: Mutex<u64>,
}

impl FakeStateMachine {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeStateMachine {
            applied: Mutex::new(Vec::new()),
            restores: Mutex::new(0),
        })
    }

    pub async fn applied(&self) -> Vec<Bytes> {
        self.applied.lock().await.clone()
    }

    pub async fn restores(&self) -> u64 {
        *self.restores.lock().await
    }
}

#[async_trait]
impl StateMachine for FakeStateMachine {
    async fn apply(&self, entry: &Entry) -> Result<(), FsmError> {
        let payload = entry.command().cloned().unwrap_or_default();
        if payload.as_ref() == POISON {
            return Err(FsmError::Decode {
                index: entry.index,
                source: "poisoned payload".into(),
            });
        }
        self.applied.lock().await.push(payload);
        Ok(())
    }

    async fn snapshot(&self) -> Result<Box<dyn SnapshotArtifact>, SnapshotError> {
        Ok(Box::new(FakeSnapshot {
            payloads: self.applied.lock().await.clone(),
        }))
    }

    async fn restore(&self, mut reader: SnapshotReader) -> Result<(), RestoreError> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;

        let mut payloads = Vec::new();
        let mut remaining = data.as_slice();
        while !remaining.is_empty() {
            if remaining.len() < 4 {
                return Err(RestoreError::Malformed("truncated length".into()));
            }
            let (length, rest) = remaining.split_at(4);
            let length = u32::from_be_bytes([length[0], length[1], length[2], length[3]]) as usize;
            if rest.len() < length {
                return Err(RestoreError::Malformed("truncated payload".into()));
            }
            let (payload, rest) = rest.split_at(length);
            payloads.push(Bytes::copy_from_slice(payload));
            remaining = rest;
        }

        *self.applied.lock().await = payloads;
        *self.restores.lock().await += 1;
        Ok(())
    }
}

struct FakeSnapshot {
    payloads: Vec<Bytes>,
}

#[async_trait]
impl SnapshotArtifact for FakeSnapshot {
    async fn persist(
        &self,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), SnapshotError> {
        for payload in &self.payloads {
            sink.write_all(&(payload.len() as u32).to_be_bytes()).await?;
            sink.write_all(payload).await?;
        }
        sink.flush().await?;
        Ok(())
    }

    fn release(&mut self) {
        self.payloads.clear();
    }
}

// Repeatedly evaluates the supplied condition until it holds, or panics once
// the timeout has elapsed.
pub async fn wait_for<F, Fut>(timeout: Duration, what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        sleep(Duration::from_millis(10)).await;
    }
}
