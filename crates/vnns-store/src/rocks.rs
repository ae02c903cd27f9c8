// crates/vnns-store/src/rocks.rs
//
// RocksDB-backed persistence for terminal submission records.
//
// Key format:
//   - Primary:   `record:{submission_id}` -> JSON-serialized PersistedRecord
//   - Secondary: `state:{state_tag}:{submission_id}` -> empty value (index only)
//   - Keys:      `vk:{image_digest}` -> JSON-serialized RegisteredKey
//
// Records are written once. Primary and index entries go into one WriteBatch
// so a crash never leaves half a record. Writing identical contents again is
// a no-op; the only permitted overwrite is a TimedOut record superseded by
// the terminal state it later recovered into. The existence check and the
// write happen under one lock, so concurrent persists of an id are ordered.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rocksdb::{DBWithThreadMode, MultiThreaded, Options, WriteBatch};

use vnns_core::artifact::{RegisteredKey, SubmissionId};
use vnns_core::crypto::Hash32;
use vnns_core::error::StorageError;
use vnns_core::submission::{PersistedRecord, SubmissionRecord, SubmissionState};
use vnns_core::traits::RecordStore;

/// RocksDB wrapper implementing the `RecordStore` trait.
#[derive(Debug)]
pub struct RocksRecordStore {
    db: DBWithThreadMode<MultiThreaded>,
    write_lock: Mutex<()>,
}

impl RocksRecordStore {
    /// Open a RocksDB database at the given filesystem path.
    ///
    /// Creates the database directory if it does not exist.
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = DBWithThreadMode::<MultiThreaded>::open(&opts, path).map_err(|e| {
            StorageError::Backend(format!("Failed to open RocksDB at {}: {}", path, e))
        })?;

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record_key(id: &SubmissionId) -> Vec<u8> {
        format!("record:{}", id).into_bytes()
    }

    fn state_key(state: SubmissionState, id: &SubmissionId) -> Vec<u8> {
        format!("state:{}:{}", state.tag(), id).into_bytes()
    }

    fn key_key(image_digest: &Hash32) -> Vec<u8> {
        format!("vk:{}", image_digest).into_bytes()
    }

    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.db
            .get(key)
            .map_err(|e| StorageError::Backend(format!("RocksDB get failed: {}", e)))
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StorageError> {
        self.db
            .write(batch)
            .map_err(|e| StorageError::Backend(format!("RocksDB write failed: {}", e)))
    }

    pub fn load_sync(&self, id: &SubmissionId) -> Result<Option<PersistedRecord>, StorageError> {
        match self.get_raw(&Self::record_key(id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write a terminal record; see the module notes for overwrite rules.
    pub fn persist_sync(&self, record: &SubmissionRecord) -> Result<PersistedRecord, StorageError> {
        let persisted = PersistedRecord::try_from(record)?;
        let id = persisted.submission_id;

        let _guard = self.lock_writes();
        let mut batch = WriteBatch::default();
        if let Some(existing) = self.load_sync(&id)? {
            if existing == persisted {
                tracing::debug!("Record {:?} already persisted", id);
                return Ok(existing);
            }
            let superseded = existing.terminal_state == SubmissionState::TimedOut
                && persisted.terminal_state != SubmissionState::TimedOut;
            if !superseded {
                return Err(StorageError::Conflict(id.to_string()));
            }
            tracing::info!(
                "Record {:?} recovered from TimedOut to {}",
                id,
                persisted.terminal_state
            );
            batch.delete(Self::state_key(existing.terminal_state, &id));
        }

        let json = serde_json::to_vec(&persisted)?;
        batch.put(Self::record_key(&id), json);
        // Secondary state index (empty value; existence is the signal).
        batch.put(Self::state_key(persisted.terminal_state, &id), b"");
        self.write_batch(batch)?;

        tracing::info!("Persisted record {:?} ({})", id, persisted.terminal_state);
        Ok(persisted)
    }

    pub fn list_by_state_sync(
        &self,
        state: SubmissionState,
    ) -> Result<Vec<PersistedRecord>, StorageError> {
        let prefix_str = format!("state:{}:", state.tag());
        let prefix = prefix_str.as_bytes();
        let mut records = Vec::new();

        for item in self.db.prefix_iterator(prefix) {
            let (key, _value) = item
                .map_err(|e| StorageError::Backend(format!("RocksDB iteration error: {}", e)))?;

            // Keys are `state:{tag}:{id}`. Stop when the prefix no longer matches.
            if !key.starts_with(prefix) {
                break;
            }

            let id_str = std::str::from_utf8(&key[prefix.len()..]).unwrap_or("");
            if let Ok(hash) = Hash32::from_hex(id_str) {
                if let Some(record) = self.load_sync(&SubmissionId(hash))? {
                    records.push(record);
                }
            }
        }

        Ok(records)
    }
}

#[async_trait]
impl RecordStore for RocksRecordStore {
    async fn persist(&self, record: &SubmissionRecord) -> Result<PersistedRecord, StorageError> {
        self.persist_sync(record)
    }

    async fn load(&self, id: &SubmissionId) -> Result<Option<PersistedRecord>, StorageError> {
        self.load_sync(id)
    }

    async fn list_by_state(
        &self,
        state: SubmissionState,
    ) -> Result<Vec<PersistedRecord>, StorageError> {
        self.list_by_state_sync(state)
    }

    async fn save_key(&self, key: &RegisteredKey) -> Result<(), StorageError> {
        let json = serde_json::to_vec(key)?;
        let mut batch = WriteBatch::default();
        batch.put(Self::key_key(&key.image_digest), json);
        self.write_batch(batch)
    }

    async fn load_key(&self, image_digest: &Hash32) -> Result<Option<RegisteredKey>, StorageError> {
        match self.get_raw(&Self::key_key(image_digest))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}
