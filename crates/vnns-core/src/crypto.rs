// crates/vnns-core/src/crypto.rs

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use sha3::Keccak256;

use crate::error::VnnsError;

/// A 32-byte hash or commitment. Serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    pub const ZERO: Hash32 = Hash32([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse 64 hex characters, with or without a `0x` prefix.
    pub fn from_hex(s: &str) -> Result<Self, VnnsError> {
        let bytes = decode_hex(s)?;
        let array: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            VnnsError::Crypto(format!("expected 32 bytes, got {}", b.len()))
        })?;
        Ok(Hash32(array))
    }

    /// Shortened form for display; the full value is always available via `to_hex`.
    pub fn truncated(&self) -> String {
        truncate_hash(&self.to_hex())
    }
}

impl From<[u8; 32]> for Hash32 {
    fn from(bytes: [u8; 32]) -> Self {
        Hash32(bytes)
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl FromStr for Hash32 {
    type Err = VnnsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hash32::from_hex(s)
    }
}

impl Serialize for Hash32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash32::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Decode hex with an optional `0x` prefix.
pub fn decode_hex(s: &str) -> Result<Vec<u8>, VnnsError> {
    let trimmed = s.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    hex::decode(digits).map_err(|e| VnnsError::Crypto(format!("invalid hex: {}", e)))
}

/// Encode bytes as `0x`-prefixed hex, the format the prover host emits.
pub fn encode_hex_prefixed(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// `first8…last8` presentation of a hex string. Short values pass through.
pub fn truncate_hash(hash: &str) -> String {
    let chars: Vec<char> = hash.chars().collect();
    if chars.len() <= 16 {
        return hash.to_string();
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 8..].iter().collect();
    format!("{}…{}", head, tail)
}

/// Compute SHA-256 hash of the given bytes.
pub fn hash_bytes(data: &[u8]) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Hash32(hasher.finalize().into())
}

/// Compute Keccak-256 of the given bytes (aggregate Merkle trees use it).
pub fn keccak_bytes(data: &[u8]) -> Hash32 {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    Hash32(hasher.finalize().into())
}

/// Commitment to a single vector: SHA-256 over its IEEE 754 little-endian floats.
pub fn commit_vector(vector: &[f32]) -> Hash32 {
    let mut hasher = Sha256::new();
    for &val in vector {
        hasher.update(val.to_le_bytes());
    }
    Hash32(hasher.finalize().into())
}

/// Commitment to a batch: SHA-256 over all vectors flattened in order.
pub fn commit_vectors<V: AsRef<[f32]>>(vectors: &[V]) -> Hash32 {
    let mut hasher = Sha256::new();
    for vector in vectors {
        for &val in vector.as_ref() {
            hasher.update(val.to_le_bytes());
        }
    }
    Hash32(hasher.finalize().into())
}

/// An ed25519 keypair identifying a result owner.
pub struct Keypair {
    pub signing_key: SigningKey,
    pub verifying_key: VerifyingKey,
}

impl Keypair {
    /// Generate a new random ed25519 keypair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Keypair {
            signing_key,
            verifying_key,
        }
    }

    /// Get the public key bytes (32 bytes).
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Sign a message and return the signature bytes.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }
}

/// Verify an ed25519 signature.
///
/// Returns `Ok(false)` for a well-formed but wrong signature.
pub fn verify_signature(
    public_key_bytes: &[u8; 32],
    message: &[u8],
    signature_bytes: &[u8],
) -> Result<bool, VnnsError> {
    let verifying_key = VerifyingKey::from_bytes(public_key_bytes)
        .map_err(|e| VnnsError::Crypto(format!("Invalid public key: {}", e)))?;

    let signature_array: [u8; 64] = signature_bytes
        .try_into()
        .map_err(|_| VnnsError::Crypto("Signature must be exactly 64 bytes".to_string()))?;

    let signature = ed25519_dalek::Signature::from_bytes(&signature_array);

    Ok(verifying_key.verify(message, &signature).is_ok())
}
