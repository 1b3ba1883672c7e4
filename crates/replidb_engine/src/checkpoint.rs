//! Checkpoint persistence.

use crate::error::{SyncError, SyncResult};
use parking_lot::{Mutex, RwLock};
use replidb_protocol::{from_cbor, to_cbor, Checkpoint, Direction, ReplicationIdentity};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Persists the last processed checkpoint per identity and direction.
pub trait CheckpointStore: Send + Sync {
    /// Loads a checkpoint, `None` if replication never advanced.
    fn load(
        &self,
        identity: &ReplicationIdentity,
        direction: Direction,
    ) -> SyncResult<Option<Checkpoint>>;

    /// Stores a checkpoint.
    fn save(
        &self,
        identity: &ReplicationIdentity,
        direction: Direction,
        checkpoint: &Checkpoint,
    ) -> SyncResult<()>;

    /// Deletes both checkpoints of an identity.
    fn reset(&self, identity: &ReplicationIdentity) -> SyncResult<()>;
}

/// Volatile checkpoint store.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(
        &self,
        identity: &ReplicationIdentity,
        direction: Direction,
    ) -> SyncResult<Option<Checkpoint>> {
        Ok(self
            .checkpoints
            .read()
            .get(&identity.checkpoint_key(direction))
            .cloned())
    }

    fn save(
        &self,
        identity: &ReplicationIdentity,
        direction: Direction,
        checkpoint: &Checkpoint,
    ) -> SyncResult<()> {
        self.checkpoints
            .write()
            .insert(identity.checkpoint_key(direction), checkpoint.clone());
        Ok(())
    }

    fn reset(&self, identity: &ReplicationIdentity) -> SyncResult<()> {
        let mut checkpoints = self.checkpoints.write();
        checkpoints.remove(&identity.checkpoint_key(Direction::Pull));
        checkpoints.remove(&identity.checkpoint_key(Direction::Push));
        Ok(())
    }
}

/// Checkpoint store backed by a CBOR file.
///
/// The whole map is rewritten on every save through a temporary file that is
/// renamed over the target, so a crash leaves either the old or the new map.
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    checkpoints: Mutex<BTreeMap<String, Checkpoint>>,
}

impl FileCheckpointStore {
    /// Opens a store, loading existing checkpoints if the file exists.
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref().to_path_buf();
        let checkpoints = if path.exists() {
            let bytes = fs::read(&path).map_err(|e| SyncError::storage(e.to_string()))?;
            from_cbor(&bytes).map_err(|e| SyncError::storage(e.to_string()))?
        } else {
            BTreeMap::new()
        };

        debug!(path = %path.display(), entries = checkpoints.len(), "opened checkpoint file");
        Ok(Self {
            path,
            checkpoints: Mutex::new(checkpoints),
        })
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, checkpoints: &BTreeMap<String, Checkpoint>) -> SyncResult<()> {
        let bytes = to_cbor(checkpoints).map_err(|e| SyncError::storage(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");

        let mut file = fs::File::create(&tmp).map_err(|e| SyncError::storage(e.to_string()))?;
        file.write_all(&bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| SyncError::storage(e.to_string()))?;
        drop(file);
        fs::rename(&tmp, &self.path).map_err(|e| SyncError::storage(e.to_string()))?;
        self.sync_parent()
    }

    /// Makes the rename itself durable.
    #[cfg(unix)]
    fn sync_parent(&self) -> SyncResult<()> {
        let parent = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::File::open(parent)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| SyncError::storage(e.to_string()))
    }

    #[cfg(not(unix))]
    fn sync_parent(&self) -> SyncResult<()> {
        Ok(())
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(
        &self,
        identity: &ReplicationIdentity,
        direction: Direction,
    ) -> SyncResult<Option<Checkpoint>> {
        Ok(self
            .checkpoints
            .lock()
            .get(&identity.checkpoint_key(direction))
            .cloned())
    }

    fn save(
        &self,
        identity: &ReplicationIdentity,
        direction: Direction,
        checkpoint: &Checkpoint,
    ) -> SyncResult<()> {
        let mut checkpoints = self.checkpoints.lock();
        let mut updated = checkpoints.clone();
        updated.insert(identity.checkpoint_key(direction), checkpoint.clone());
        self.persist(&updated)?;
        *checkpoints = updated;
        Ok(())
    }

    fn reset(&self, identity: &ReplicationIdentity) -> SyncResult<()> {
        let mut checkpoints = self.checkpoints.lock();
        let mut updated = checkpoints.clone();
        updated.remove(&identity.checkpoint_key(Direction::Pull));
        updated.remove(&identity.checkpoint_key(Direction::Push));
        self.persist(&updated)?;
        *checkpoints = updated;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn memory_store_is_scoped_by_identity_and_direction() {
        let store = MemoryCheckpointStore::new();
        let a = ReplicationIdentity::new("a");
        let b = ReplicationIdentity::new("b");

        store.save(&a, Direction::Pull, &Checkpoint::from_sequence(3)).unwrap();
        store.save(&a, Direction::Push, &Checkpoint::from_sequence(9)).unwrap();

        assert_eq!(
            store.load(&a, Direction::Pull).unwrap(),
            Some(Checkpoint::from_sequence(3))
        );
        assert_eq!(
            store.load(&a, Direction::Push).unwrap(),
            Some(Checkpoint::from_sequence(9))
        );
        assert_eq!(store.load(&b, Direction::Pull).unwrap(), None);

        store.reset(&a).unwrap();
        assert_eq!(store.load(&a, Direction::Pull).unwrap(), None);
        assert_eq!(store.load(&a, Direction::Push).unwrap(), None);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoints.cbor");
        let identity = ReplicationIdentity::new("people");

        {
            let store = FileCheckpointStore::open(&path).unwrap();
            assert_eq!(store.load(&identity, Direction::Pull).unwrap(), None);
            store
                .save(&identity, Direction::Pull, &Checkpoint::from_sequence(42))
                .unwrap();
        }

        let store = FileCheckpointStore::open(&path).unwrap();
        assert_eq!(
            store.load(&identity, Direction::Pull).unwrap(),
            Some(Checkpoint::from_sequence(42))
        );
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn file_store_reset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoints.cbor");
        let identity = ReplicationIdentity::new("people");
        let other = ReplicationIdentity::new("orders");

        let store = FileCheckpointStore::open(&path).unwrap();
        store
            .save(&identity, Direction::Push, &Checkpoint::from_bytes(vec![1, 2]))
            .unwrap();
        store
            .save(&other, Direction::Pull, &Checkpoint::from_sequence(1))
            .unwrap();
        store.reset(&identity).unwrap();

        let reopened = FileCheckpointStore::open(&path).unwrap();
        assert_eq!(reopened.load(&identity, Direction::Push).unwrap(), None);
        assert_eq!(
            reopened.load(&other, Direction::Pull).unwrap(),
            Some(Checkpoint::from_sequence(1))
        );
    }

    #[test]
    fn corrupt_file_is_a_storage_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoints.cbor");
        fs::write(&path, [0xff, 0x13, 0x37]).unwrap();

        let result = FileCheckpointStore::open(&path);
        assert!(matches!(result, Err(SyncError::Storage(_))));
    }

    #[cfg(unix)]
    #[test]
    fn parent_directory_is_synced() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("state");
        fs::create_dir(&nested).unwrap();
        let store = FileCheckpointStore::open(nested.join("checkpoints.cbor")).unwrap();
        store.sync_parent().unwrap();

        let bare = FileCheckpointStore::open("checkpoints-never-written.cbor").unwrap();
        bare.sync_parent().unwrap();
    }

    #[test]
    fn failed_persist_keeps_previous_state() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("state");
        fs::create_dir(&nested).unwrap();
        let identity = ReplicationIdentity::new("people");
        let store = FileCheckpointStore::open(nested.join("checkpoints.cbor")).unwrap();
        store
            .save(&identity, Direction::Pull, &Checkpoint::from_sequence(1))
            .unwrap();

        fs::remove_dir_all(&nested).unwrap();
        let result = store.save(&identity, Direction::Pull, &Checkpoint::from_sequence(2));
        assert!(matches!(result, Err(SyncError::Storage(_))));
        assert_eq!(
            store.load(&identity, Direction::Pull).unwrap(),
            Some(Checkpoint::from_sequence(1))
        );
    }
}
