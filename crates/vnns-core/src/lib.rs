// crates/vnns-core/src/lib.rs
//
// vnns-core: Proof-chain model, submission records, and shared traits for
// verifiable vector-similarity search results.
//
// This is the leaf crate that all other crates in the workspace depend on.
// It holds no I/O: data structures, validation, the submission state machine,
// the error taxonomy, and the trait seams towards the verification network
// and durable storage.

pub mod artifact;
pub mod chain;
pub mod crypto;
pub mod error;
pub mod event;
pub mod journal;
pub mod merkle;
pub mod submission;
pub mod traits;

// Re-export key types for ergonomic access from downstream crates.
// Usage: `use vnns_core::ProofChain;`

pub use artifact::{
    CircuitVersion, KeyFinalization, KeyRegistrationRequest, NetworkTicket, ProofArtifact,
    ProofStatement, RegisteredKey, SubmissionId,
};
pub use chain::{ChainSummary, PlaintextVector, ProofChain, ProofChainBuilder, ProofStep, RevealedVectors};
pub use crypto::Hash32;
pub use event::{AggregationReceipt, EventFilter, InclusionEvent, NetworkEvent, RejectionEvent};
pub use journal::StepJournal;
pub use merkle::{MerklePath, MerkleTree};
pub use submission::{PersistedRecord, StateTransition, SubmissionRecord, SubmissionState};

pub use error::{
    AuthorizationError, ChainError, CorrelationTimeout, NetworkError, RegistrationError,
    ResolutionError, StorageError, SubmissionError, TransitionError, VnnsError,
};

pub use traits::{EventStream, PathQuery, RecordStore, VerificationNetwork};
