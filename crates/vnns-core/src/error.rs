// crates/vnns-core/src/error.rs

use thiserror::Error;

use crate::submission::SubmissionState;

/// Malformed proof chain. Raised before submission or display; a chain that
/// fails validation never reaches the network.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("proof chain has no steps")]
    Empty,

    #[error("step numbers must be contiguous from 1: expected {expected}, found {found}")]
    NonContiguous { expected: u32, found: u32 },

    #[error("step {step} has an empty batch")]
    EmptyBatch { step: u32 },

    #[error("out-commitment of step {step} does not match the in-commitment of step {next}")]
    BrokenLink { step: u32, next: u32 },

    #[error("query commitment of step {step} differs from the rest of the chain")]
    QueryCommitMismatch { step: u32 },

    #[error("final commitment does not match the out-commitment of the last step")]
    FinalCommitmentMismatch,

    #[error("step {step} carries plaintext vectors but is not revealable")]
    RevealNotPermitted { step: u32 },

    #[error("malformed step journal: {0}")]
    MalformedJournal(String),

    #[error("malformed chain document: {0}")]
    Malformed(String),
}

/// Disclosure refused. Purely local; no network call is ever made.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthorizationError {
    #[error("step {0} does not exist")]
    StepNotFound(u32),

    #[error("step {0} is not revealable")]
    NotRevealable(u32),

    #[error("only the result owner may reveal step {0}")]
    NotOwner(u32),

    #[error("plaintext vectors for step {0} are not held by this chain")]
    PlaintextUnavailable(u32),

    #[error("sealed plaintext for step {0} does not match its batch hash")]
    PlaintextMismatch(u32),
}

/// Transport-level failure talking to the verification network.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetworkError {
    /// The network explicitly refused the request (invalid proof, unknown domain, ...).
    #[error("rejected by network: {0}")]
    Rejected(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("network request timed out")]
    Timeout,

    #[error("unexpected network response: {0}")]
    Protocol(String),

    #[error("network session is closed")]
    SessionClosed,
}

impl NetworkError {
    /// Transient errors may succeed on a later attempt; rejections never do.
    pub fn is_transient(&self) -> bool {
        matches!(self, NetworkError::Transport(_) | NetworkError::Timeout)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("verifying key rejected: {0}")]
    Rejected(String),

    #[error("no finalization for verifying key within {secs}s")]
    ConfirmationTimeout { secs: u64 },

    #[error("verifying key already registered for circuit {registered}, not {requested}")]
    VersionConflict { registered: String, requested: String },

    #[error(transparent)]
    Network(NetworkError),
}

impl From<NetworkError> for RegistrationError {
    fn from(e: NetworkError) -> Self {
        match e {
            NetworkError::Rejected(reason) => RegistrationError::Rejected(reason),
            other => RegistrationError::Network(other),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmissionError {
    #[error("verifying key {0} has not been registered")]
    UnknownVerifyingKey(String),

    #[error("submission {0} is already being sent")]
    AlreadyInFlight(String),

    #[error("proof rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Network(NetworkError),

    /// The record store could not say whether this statement was already
    /// attested, so it is not sent.
    #[error("submission lookup failed: {0}")]
    Storage(#[from] StorageError),
}

impl SubmissionError {
    /// Whether a caller-level retry policy may resubmit after this error.
    pub fn is_transient(&self) -> bool {
        match self {
            SubmissionError::Network(e) => e.is_transient(),
            SubmissionError::AlreadyInFlight(_) => true,
            _ => false,
        }
    }
}

impl From<NetworkError> for SubmissionError {
    fn from(e: NetworkError) -> Self {
        match e {
            NetworkError::Rejected(reason) => SubmissionError::Rejected(reason),
            other => SubmissionError::Network(other),
        }
    }
}

/// No matching event arrived in time. Recoverable: the network may still
/// deliver the event later.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("submission {submission_id} saw no event while {waiting_in} within {after_secs}s")]
pub struct CorrelationTimeout {
    pub submission_id: String,
    pub waiting_in: SubmissionState,
    pub after_secs: u64,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    /// Path requested before aggregation was confirmed.
    #[error("statement path not yet available: submission is {0}")]
    NotYetAvailable(SubmissionState),

    #[error("unknown submission {0}")]
    UnknownSubmission(String),

    #[error("statement path does not verify against the aggregate root")]
    InvalidPath,

    #[error(transparent)]
    Network(NetworkError),
}

impl ResolutionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ResolutionError::Network(e) if e.is_transient())
    }
}

/// Persistence failure. Never swallowed: the record stays retriable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("record {0} is not in a terminal state")]
    NotTerminal(String),

    #[error("record {0} was already persisted with different contents")]
    Conflict(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

/// A state change that would break monotonic progression.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid submission transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: SubmissionState,
    pub to: SubmissionState,
}

/// Umbrella error for callers that drive the whole pipeline.
#[derive(Debug, Error)]
pub enum VnnsError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Submission(#[from] SubmissionError),

    #[error(transparent)]
    Timeout(#[from] CorrelationTimeout),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("submission {id} failed: {reason}")]
    Failed { id: String, reason: String },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Crypto error: {0}")]
    Crypto(String),
}

impl From<serde_json::Error> for VnnsError {
    fn from(e: serde_json::Error) -> Self {
        VnnsError::Serialization(e.to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for VnnsError {
    fn from(e: ed25519_dalek::SignatureError) -> Self {
        VnnsError::Crypto(e.to_string())
    }
}
