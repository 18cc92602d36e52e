use async_std::fs;
use async_std::path::{Path, PathBuf};
use async_std::sync::Mutex;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use prost::Message;
use std::io::ErrorKind;
use tracing::{debug, info, warn};

use crate::raft::error::StorageError;
use crate::raft::storage::SnapshotStore;
use crate::raft::types::{Configuration, Server, SnapshotMeta, Suffrage};

const SNAPSHOT_EXTENSION: &str = "snap";
const TEMP_EXTENSION: &str = "tmp";

// Written in front of the snapshot data in every snapshot file.
#[derive(Clone, PartialEq, Message)]
struct SnapshotHeader {
    #[prost(string, tag = "1")]
    id: String,
    #[prost(uint64, tag = "2")]
    index: u64,
    #[prost(uint64, tag = "3")]
    term: u64,
    #[prost(uint64, tag = "4")]
    configuration_index: u64,
    #[prost(message, repeated, tag = "5")]
    servers: Vec<ServerRecord>,
    #[prost(uint64, tag = "6")]
    size: u64,
}

#[derive(Clone, PartialEq, Message)]
struct ServerRecord {
    #[prost(string, tag = "1")]
    id: String,
    #[prost(string, tag = "2")]
    address: String,
    #[prost(bool, tag = "3")]
    voter: bool,
}

impl SnapshotHeader {
    fn from_meta(meta: &SnapshotMeta) -> Self {
        SnapshotHeader {
            id: meta.id.clone(),
            index: meta.index,
            term: meta.term,
            configuration_index: meta.configuration_index,
            servers: meta
                .configuration
                .servers
                .iter()
                .map(|s| ServerRecord {
                    id: s.id.clone(),
                    address: s.address.clone(),
                    voter: s.is_voter(),
                })
                .collect(),
            size: meta.size,
        }
    }

    fn into_meta(self) -> SnapshotMeta {
        let servers = self
            .servers
            .into_iter()
            .map(|s| Server {
                suffrage: if s.voter {
                    Suffrage::Voter
                } else {
                    Suffrage::Nonvoter
                },
                id: s.id,
                address: s.address,
            })
            .collect();
        SnapshotMeta {
            id: self.id,
            index: self.index,
            term: self.term,
            configuration: Configuration::new(servers),
            configuration_index: self.configuration_index,
            size: self.size,
        }
    }
}

// Stores each snapshot in its own file inside a directory, keeping only the
// newest few. Files are written under a temporary name and renamed into place,
// so a crash never leaves a partial snapshot behind. Leftover temporary files
// and unreadable snapshots are removed whenever old snapshots are pruned.
pub struct FileSnapshotStore {
    directory: PathBuf,
    retain: usize,

    // Held while writing, so that pruning never sees another write in flight.
    writing: Mutex<()>,
}

// The contents of the snapshot directory as found by a scan.
struct Scan {
    // Readable snapshots, newest first.
    snapshots: Vec<(PathBuf, SnapshotMeta)>,

    // Temporary files and snapshots which could not be read.
    stale: Vec<PathBuf>,
}

impl FileSnapshotStore {
    pub async fn new(directory: &str, retain: usize) -> Result<Self, StorageError> {
        create_dir_if_not_exists(directory).await?;
        info!(directory, retain, "created file snapshot store");
        Ok(FileSnapshotStore {
            directory: PathBuf::from(directory),
            retain: retain.max(1),
            writing: Mutex::new(()),
        })
    }

    fn path_for(&self, id: &str, extension: &str) -> PathBuf {
        self.directory.join(format!("{}.{}", id, extension))
    }

    // Reads the headers of all files in the directory. Files with other
    // extensions are left alone.
    async fn scan(&self) -> Result<Scan, StorageError> {
        let mut scan = Scan {
            snapshots: Vec::new(),
            stale: Vec::new(),
        };
        let mut entries = fs::read_dir(&self.directory).await?;
        while let Some(entry) = entries.next().await {
            let path = entry?.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(SNAPSHOT_EXTENSION) => match read_snapshot_file(&path).await {
                    Ok((meta, _)) => scan.snapshots.push((path, meta)),
                    Err(e) => {
                        warn!(path = ?path, "skipping unreadable snapshot: {}", e);
                        scan.stale.push(path);
                    }
                },
                Some(TEMP_EXTENSION) => scan.stale.push(path),
                _ => {}
            }
        }
        scan.snapshots.sort_by(|(_, a), (_, b)| b.last().cmp(&a.last()));
        Ok(scan)
    }

    // Must be called with the write lock held.
    async fn prune(&self) -> Result<(), StorageError> {
        let scan = self.scan().await?;
        for path in scan.stale {
            remove_if_exists(&path).await?;
            info!(path = ?path, "removed stale snapshot file");
        }
        for (path, meta) in scan.snapshots.into_iter().skip(self.retain) {
            remove_if_exists(&path).await?;
            debug!(id = %meta.id, "pruned snapshot");
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn create(&self, meta: &SnapshotMeta, data: Bytes) -> Result<(), StorageError> {
        let header = SnapshotHeader::from_meta(meta);
        let mut contents = header.encode_length_delimited_to_vec();
        contents.extend_from_slice(&data);

        let _guard = self.writing.lock().await;
        let temp = self.path_for(&meta.id, TEMP_EXTENSION);
        fs::write(&temp, &contents).await?;
        fs::rename(&temp, self.path_for(&meta.id, SNAPSHOT_EXTENSION)).await?;
        debug!(id = %meta.id, bytes = contents.len(), "wrote snapshot");

        self.prune().await
    }

    async fn list(&self) -> Result<Vec<SnapshotMeta>, StorageError> {
        let scan = self.scan().await?;
        Ok(scan.snapshots.into_iter().map(|(_, m)| m).collect())
    }

    async fn latest(&self) -> Result<Option<(SnapshotMeta, Bytes)>, StorageError> {
        match self.scan().await?.snapshots.into_iter().next() {
            Some((path, _)) => Ok(Some(read_snapshot_file(&path).await?)),
            None => Ok(None),
        }
    }
}

async fn read_snapshot_file(path: &Path) -> Result<(SnapshotMeta, Bytes), StorageError> {
    let contents = fs::read(path).await?;
    let mut remaining = contents.as_slice();
    let header = SnapshotHeader::decode_length_delimited(&mut remaining).map_err(|e| {
        StorageError::Corrupt(format!("bad snapshot header in {:?}: {}", path, e))
    })?;
    if header.size != remaining.len() as u64 {
        return Err(StorageError::Corrupt(format!(
            "snapshot {:?} should hold {} bytes, found {}",
            path,
            header.size,
            remaining.len()
        )));
    }
    let data = Bytes::copy_from_slice(remaining);
    Ok((header.into_meta(), data))
}

async fn remove_if_exists(path: &Path) -> Result<(), StorageError> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

async fn create_dir_if_not_exists(directory: &str) -> Result<(), StorageError> {
    match fs::metadata(directory).await {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(StorageError::Corrupt(format!(
            "path exists but is not a directory: {}",
            directory
        ))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(fs::create_dir_all(directory).await?),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_meta(term: u64, index: u64, data: &Bytes) -> SnapshotMeta {
        SnapshotMeta {
            id: format!("{}-{}", term, index),
            index,
            term,
            configuration: Configuration::new(vec![
                Server::voter("a", "mem://a"),
                Server::nonvoter("b", "mem://b"),
            ]),
            configuration_index: 2,
            size: data.len() as u64,
        }
    }

    fn directory(temp: &tempfile::TempDir) -> String {
        temp.path().join("snapshots").to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn test_create_and_read_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileSnapshotStore::new(&directory(&temp), 2)
            .await
            .expect("store");
        assert!(store.latest().await.expect("latest").is_none());

        let data = Bytes::from("some snapshot bytes");
        let meta = make_meta(3, 17, &data);
        store.create(&meta, data.clone()).await.expect("create");

        let (read_meta, read_data) = store.latest().await.expect("latest").expect("present");
        assert_eq!(meta, read_meta);
        assert_eq!(data, read_data);
        assert!(!read_meta.configuration.is_voter("b"));
    }

    #[tokio::test]
    async fn test_retains_newest() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileSnapshotStore::new(&directory(&temp), 2)
            .await
            .expect("store");

        for (term, index) in [(1, 5), (1, 9), (2, 14)] {
            let data = Bytes::from(format!("data-{}", index));
            store
                .create(&make_meta(term, index, &data), data)
                .await
                .expect("create");
        }

        let indexes: Vec<u64> = store
            .list()
            .await
            .expect("list")
            .iter()
            .map(|m| m.index)
            .collect();
        assert_eq!(vec![14, 9], indexes);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let data = Bytes::from("persisted");
        {
            let store = FileSnapshotStore::new(&directory(&temp), 3)
                .await
                .expect("store");
            store
                .create(&make_meta(1, 4, &data), data.clone())
                .await
                .expect("create");
        }

        let reopened = FileSnapshotStore::new(&directory(&temp), 3)
            .await
            .expect("store");
        let (meta, read) = reopened.latest().await.expect("latest").expect("present");
        assert_eq!(4, meta.index);
        assert_eq!(data, read);
    }

    #[tokio::test]
    async fn test_skips_corrupt_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = directory(&temp);
        let store = FileSnapshotStore::new(&dir, 3).await.expect("store");
        fs::write(PathBuf::from(&dir).join("garbage.snap"), b"not a snapshot")
            .await
            .expect("write");

        assert!(store.list().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_prune_removes_leftovers() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = directory(&temp);
        let store = FileSnapshotStore::new(&dir, 2).await.expect("store");

        // What a crash in the middle of a write, or a damaged disk, leaves behind.
        let leftover = PathBuf::from(&dir).join("1-3.tmp");
        let corrupt = PathBuf::from(&dir).join("1-2.snap");
        let unrelated = PathBuf::from(&dir).join("notes.txt");
        fs::write(&leftover, b"half a snapshot").await.expect("write");
        fs::write(&corrupt, b"not a snapshot").await.expect("write");
        fs::write(&unrelated, b"keep me").await.expect("write");

        let data = Bytes::from("fresh");
        store
            .create(&make_meta(2, 8, &data), data.clone())
            .await
            .expect("create");

        assert!(!leftover.exists().await);
        assert!(!corrupt.exists().await);
        assert!(unrelated.exists().await);

        let (meta, read) = store.latest().await.expect("latest").expect("present");
        assert_eq!(8, meta.index);
        assert_eq!(data, read);
        assert_eq!(1, store.list().await.expect("list").len());
    }
}
