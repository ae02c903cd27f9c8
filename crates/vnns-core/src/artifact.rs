// crates/vnns-core/src/artifact.rs
//
// Proof artifacts as produced by the prover host, and the packaged statement
// sent to the verification network.
//
// The prover host writes one JSON document per proof:
//   { "proof": "0x…", "image_id": "0x…", "pub_inputs": "0x…" }

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::crypto::{self, Hash32};
use crate::error::{ChainError, VnnsError};
use crate::journal::StepJournal;

/// Opaque proof artifact handed over by the proof-generation collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofArtifact {
    /// Serialized proof (receipt) bytes.
    #[serde(with = "prefixed_hex")]
    pub proof: Vec<u8>,
    /// Verifying-key image (circuit image ID).
    #[serde(rename = "image_id", with = "prefixed_hex")]
    pub verifying_key_image: Vec<u8>,
    /// Encoded public inputs (the step journal).
    #[serde(rename = "pub_inputs", with = "prefixed_hex")]
    pub public_inputs: Vec<u8>,
}

impl ProofArtifact {
    pub fn from_json(json: &str) -> Result<Self, VnnsError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, VnnsError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            VnnsError::Serialization(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&contents)
    }

    /// Content hash over proof, key image and public inputs (length-prefixed).
    pub fn artifact_hash(&self) -> Hash32 {
        let mut hasher = Sha256::new();
        for part in [&self.proof, &self.verifying_key_image, &self.public_inputs] {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Hash32(hasher.finalize().into())
    }

    /// Decode the public inputs as a similarity-step journal.
    pub fn journal(&self) -> Result<StepJournal, ChainError> {
        StepJournal::decode(&self.public_inputs)
    }
}

/// Proof-system version the verifying key belongs to (e.g. `risc0-v2.2`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CircuitVersion(pub String);

impl CircuitVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }
}

impl Default for CircuitVersion {
    fn default() -> Self {
        Self("risc0-v2.2".to_string())
    }
}

impl fmt::Display for CircuitVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one submission: the content hash of its packaged statement.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(pub Hash32);

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubmissionId({})", self.0.truncated())
    }
}

/// The packaged claim sent for verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStatement {
    #[serde(with = "prefixed_hex")]
    pub proof: Vec<u8>,
    pub verifying_key_hash: Hash32,
    #[serde(with = "prefixed_hex")]
    pub public_inputs: Vec<u8>,
    pub domain_id: u32,
}

impl ProofStatement {
    pub fn package(artifact: &ProofArtifact, verifying_key_hash: Hash32, domain_id: u32) -> Self {
        Self {
            proof: artifact.proof.clone(),
            verifying_key_hash,
            public_inputs: artifact.public_inputs.clone(),
            domain_id,
        }
    }

    /// Same statement content always yields the same submission ID.
    pub fn submission_id(&self) -> SubmissionId {
        let mut hasher = Sha256::new();
        hasher.update((self.proof.len() as u64).to_le_bytes());
        hasher.update(&self.proof);
        hasher.update(self.verifying_key_hash.as_bytes());
        hasher.update((self.public_inputs.len() as u64).to_le_bytes());
        hasher.update(&self.public_inputs);
        hasher.update(self.domain_id.to_le_bytes());
        SubmissionId(Hash32(hasher.finalize().into()))
    }
}

/// Opaque handle the network returns for an accepted submission; inclusion
/// and rejection events carry it back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkTicket(pub String);

impl fmt::Display for NetworkTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRegistrationRequest {
    #[serde(with = "prefixed_hex")]
    pub image: Vec<u8>,
    pub circuit_version: CircuitVersion,
}

/// Finalization report for a key registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFinalization {
    /// Hash under which the network knows the key.
    pub statement_hash: Hash32,
    #[serde(default)]
    pub block_hash: Option<String>,
}

/// A key the network has finalized, cached locally by image digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredKey {
    /// SHA-256 of the key image; the local cache key.
    pub image_digest: Hash32,
    pub key_hash: Hash32,
    pub circuit_version: CircuitVersion,
    pub registered_at: DateTime<Utc>,
}

/// Digest of a verifying-key image, used to recognize an already-registered key.
pub fn image_digest(image: &[u8]) -> Hash32 {
    crypto::hash_bytes(image)
}

/// Serde adapter for `0x`-prefixed hex byte strings.
pub mod prefixed_hex {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&crypto::encode_hex_prefixed(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        crypto::decode_hex(&s).map_err(serde::de::Error::custom)
    }
}
