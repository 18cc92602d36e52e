use async_std::sync::Arc;
use async_trait::async_trait;
use futures::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use prost::Message;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::keyvalue::command::{Command, Operation};
use crate::keyvalue::store::KeyStore;
use crate::keyvalue::wire::{EntryProto, SnapshotProto};
use crate::raft::error::{FsmError, RestoreError, SnapshotError};
use crate::raft::{Entry, SnapshotArtifact, SnapshotReader, StateMachine};

// Drives a KeyStore from committed log entries.
pub struct KeyValueStateMachine {
    store: Arc<KeyStore>,
}

impl KeyValueStateMachine {
    pub fn new(store: Arc<KeyStore>) -> Self {
        KeyValueStateMachine { store }
    }
}

#[async_trait]
impl StateMachine for KeyValueStateMachine {
    async fn apply(&self, entry: &Entry) -> Result<(), FsmError> {
        let Some(payload) = entry.command() else {
            return Ok(());
        };
        let command = Command::decode(payload).map_err(|e| FsmError::Decode {
            index: entry.index,
            source: Box::new(e),
        })?;

        let mut data = self.store.write().await;
        match command.operation() {
            Operation::Set => {
                data.insert(command.key().to_string(), command.value().to_string());
            }
            Operation::Delete => {
                data.remove(command.key());
            }
        }
        debug!(index = entry.index, key = command.key(), operation = ?command.operation(), "applied");
        Ok(())
    }

    async fn snapshot(&self) -> Result<Box<dyn SnapshotArtifact>, SnapshotError> {
        let entries = self.store.snapshot().await;
        Ok(Box::new(KeyValueSnapshot { entries }))
    }

    async fn restore(&self, mut reader: SnapshotReader) -> Result<(), RestoreError> {
        let mut data = self.store.write().await;

        // The length of the stream is not known up front, so read all of it.
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).await?;
        let entries = decode_snapshot(&contents)?;

        info!(entries = entries.len(), bytes = contents.len(), "restored snapshot");
        *data = entries;
        Ok(())
    }
}

fn decode_snapshot(contents: &[u8]) -> Result<HashMap<String, String>, RestoreError> {
    if contents.is_empty() {
        return Err(RestoreError::Malformed("empty snapshot".into()));
    }
    let mut remaining = contents;
    let snapshot = SnapshotProto::decode_length_delimited(&mut remaining)
        .map_err(|e| RestoreError::Malformed(Box::new(e)))?;
    if !remaining.is_empty() {
        return Err(RestoreError::Malformed(
            format!("{} trailing bytes after snapshot", remaining.len()).into(),
        ));
    }

    let mut entries = HashMap::with_capacity(snapshot.entries.len());
    for entry in snapshot.entries {
        if entries.contains_key(&entry.key) {
            return Err(RestoreError::Malformed(
                format!("duplicate key {}", entry.key).into(),
            ));
        }
        entries.insert(entry.key, entry.value);
    }
    Ok(entries)
}

// A copy of the KeyStore contents, taken under the read lock.
pub struct KeyValueSnapshot {
    entries: HashMap<String, String>,
}

#[async_trait]
impl SnapshotArtifact for KeyValueSnapshot {
    async fn persist(
        &self,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), SnapshotError> {
        let mut entries: Vec<EntryProto> = self
            .entries
            .iter()
            .map(|(key, value)| EntryProto {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        let encoded = SnapshotProto { entries }.encode_length_delimited_to_vec();
        sink.write_all(&encoded).await?;
        sink.flush().await?;
        Ok(())
    }

    fn release(&mut self) {
        self.entries = HashMap::new();
    }
}
