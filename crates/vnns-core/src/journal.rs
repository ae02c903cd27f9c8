// crates/vnns-core/src/journal.rs
//
// Decoding of the similarity-step journal committed by the zkVM guest.
//
// The guest commits, in order: the index of the closest sample (u32), the
// query commitment, the samples commitment, and the output commitment (each a
// 32-byte vector). The zkVM serializer writes every value as little-endian
// 32-bit words: a u32 is one word, and a byte vector is a length word
// followed by one word per byte.

use crate::crypto::Hash32;
use crate::error::ChainError;

const WORD: usize = 4;

/// Public outputs of one similarity step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepJournal {
    /// Index of the closest sample within the batch.
    pub closest_index: u32,
    /// Commitment to the query vector.
    pub query_commit: Hash32,
    /// Commitment to the batch of samples (the step's batch hash).
    pub samples_commit: Hash32,
    /// Commitment to the selected sample (the step's out-commitment).
    pub output_commit: Hash32,
}

impl StepJournal {
    pub fn decode(bytes: &[u8]) -> Result<Self, ChainError> {
        let mut reader = WordReader { bytes, pos: 0 };
        let closest_index = reader.word()?;
        let query_commit = reader.hash()?;
        let samples_commit = reader.hash()?;
        let output_commit = reader.hash()?;
        if reader.pos != bytes.len() {
            return Err(ChainError::MalformedJournal(format!(
                "{} trailing bytes",
                bytes.len() - reader.pos
            )));
        }
        Ok(Self {
            closest_index,
            query_commit,
            samples_commit,
            output_commit,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(WORD * (1 + 3 * 33));
        out.extend_from_slice(&self.closest_index.to_le_bytes());
        for hash in [&self.query_commit, &self.samples_commit, &self.output_commit] {
            out.extend_from_slice(&32u32.to_le_bytes());
            for byte in hash.as_bytes() {
                out.extend_from_slice(&u32::from(*byte).to_le_bytes());
            }
        }
        out
    }
}

struct WordReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl WordReader<'_> {
    fn word(&mut self) -> Result<u32, ChainError> {
        let end = self.pos + WORD;
        let chunk = self.bytes.get(self.pos..end).ok_or_else(|| {
            ChainError::MalformedJournal(format!("truncated at byte {}", self.pos))
        })?;
        self.pos = end;
        Ok(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
    }

    fn hash(&mut self) -> Result<Hash32, ChainError> {
        let len = self.word()?;
        if len != 32 {
            return Err(ChainError::MalformedJournal(format!(
                "expected a 32-byte commitment, found length {}",
                len
            )));
        }
        let mut out = [0u8; 32];
        for slot in out.iter_mut() {
            let value = self.word()?;
            *slot = u8::try_from(value).map_err(|_| {
                ChainError::MalformedJournal(format!("byte word out of range: {}", value))
            })?;
        }
        Ok(Hash32(out))
    }
}
