// crates/vnns-core/src/traits.rs

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::artifact::{
    KeyFinalization, KeyRegistrationRequest, NetworkTicket, ProofStatement, RegisteredKey,
    SubmissionId,
};
use crate::crypto::Hash32;
use crate::error::{NetworkError, StorageError};
use crate::event::{EventFilter, NetworkEvent};
use crate::merkle::MerklePath;
use crate::submission::{PersistedRecord, SubmissionRecord, SubmissionState};

/// Stream of events pushed by a network subscription.
pub type EventStream = mpsc::Receiver<NetworkEvent>;

/// Query for a statement's inclusion path inside an aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathQuery {
    pub block_hash: String,
    pub domain_id: u32,
    pub aggregation_id: u64,
    pub statement: String,
}

/// The public surface of the external verification network.
///
/// Implemented by chain clients in vnns-verify (HTTP relay, in-process network).
#[async_trait]
pub trait VerificationNetwork: Send + Sync {
    /// Register a verifying key and wait until the registration is finalized.
    async fn register_key(
        &self,
        request: &KeyRegistrationRequest,
    ) -> Result<KeyFinalization, NetworkError>;

    /// Send a statement for verification. Returns once the network accepted it.
    async fn submit_statement(&self, statement: &ProofStatement)
        -> Result<NetworkTicket, NetworkError>;

    /// Open an event subscription.
    async fn subscribe(&self, filter: EventFilter) -> Result<EventStream, NetworkError>;

    /// Fetch the inclusion path of a statement inside an aggregate.
    async fn statement_path(&self, query: &PathQuery) -> Result<MerklePath, NetworkError>;
}

/// Trait for durable storage of terminal submission records.
///
/// Implemented by vnns-store (RocksDB backend).
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Write a terminal record. All-or-nothing; writing the same contents
    /// twice is a no-op, different contents are a conflict.
    async fn persist(&self, record: &SubmissionRecord) -> Result<PersistedRecord, StorageError>;

    /// Retrieve a persisted record by submission ID.
    async fn load(&self, id: &SubmissionId) -> Result<Option<PersistedRecord>, StorageError>;

    /// List persisted records in a given terminal state.
    async fn list_by_state(&self, state: SubmissionState)
        -> Result<Vec<PersistedRecord>, StorageError>;

    /// Remember a finalized key registration.
    async fn save_key(&self, key: &RegisteredKey) -> Result<(), StorageError>;

    /// Look up a finalized key registration by image digest.
    async fn load_key(&self, image_digest: &Hash32) -> Result<Option<RegisteredKey>, StorageError>;
}
