// crates/vnns-core/src/chain.rs
//
// ProofChain: the ordered sequence of similarity steps behind one search
// result, plus the final output commitment.
//
//   step 1            step 2                step n
//   in --> out  ==>   in --> out   ==> ...  in --> out == final_commitment
//
// The chain is immutable once assembled. The only mutation allowed is the
// owner-gated reveal of a step's plaintext vectors, which is additive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{self, Hash32};
use crate::error::{AuthorizationError, ChainError, VnnsError};
use crate::journal::StepJournal;

/// A plaintext vector underlying a committed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaintextVector {
    pub id: String,
    pub data: Vec<f32>,
}

/// Vectors disclosed by a successful reveal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevealedVectors {
    pub step_number: u32,
    pub vectors: Vec<PlaintextVector>,
}

/// One link in the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofStep {
    /// 1-based position in the chain.
    pub step_number: u32,
    /// Content hash of the batch processed at this step.
    pub batch_hash: Hash32,
    /// Number of vectors in the batch.
    pub batch_size: u32,
    /// Commitment to the step's input state.
    pub in_commit: Hash32,
    /// Commitment to the step's output state.
    pub out_commit: Hash32,
    /// Commitment to the query vector; identical across the chain.
    pub query_commit: Hash32,
    /// Whether the owner may disclose this step's plaintext vectors.
    pub can_reveal: bool,
    #[serde(default)]
    revealed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    plaintext_vectors: Option<Vec<PlaintextVector>>,
    /// Plaintext held back until reveal. Never serialized.
    #[serde(skip)]
    sealed: Option<Vec<PlaintextVector>>,
}

impl ProofStep {
    pub fn new(
        step_number: u32,
        batch_hash: Hash32,
        batch_size: u32,
        in_commit: Hash32,
        out_commit: Hash32,
        query_commit: Hash32,
        can_reveal: bool,
    ) -> Self {
        Self {
            step_number,
            batch_hash,
            batch_size,
            in_commit,
            out_commit,
            query_commit,
            can_reveal,
            revealed: false,
            plaintext_vectors: None,
            sealed: None,
        }
    }

    /// Attach the batch plaintext, to be disclosed on reveal.
    ///
    /// Refused for steps that are not revealable.
    pub fn with_sealed_vectors(mut self, vectors: Vec<PlaintextVector>) -> Result<Self, ChainError> {
        if !self.can_reveal {
            return Err(ChainError::RevealNotPermitted {
                step: self.step_number,
            });
        }
        self.sealed = Some(vectors);
        Ok(self)
    }

    pub fn revealed(&self) -> bool {
        self.revealed
    }

    pub fn plaintext_vectors(&self) -> Option<&[PlaintextVector]> {
        self.plaintext_vectors.as_deref()
    }

    fn reveal_inner(&mut self) -> Result<Vec<PlaintextVector>, AuthorizationError> {
        if let Some(existing) = &self.plaintext_vectors {
            self.revealed = true;
            return Ok(existing.clone());
        }

        let sealed = self
            .sealed
            .as_ref()
            .ok_or(AuthorizationError::PlaintextUnavailable(self.step_number))?;

        let data: Vec<&[f32]> = sealed.iter().map(|v| v.data.as_slice()).collect();
        if crypto::commit_vectors(&data) != self.batch_hash {
            return Err(AuthorizationError::PlaintextMismatch(self.step_number));
        }

        let vectors = sealed.clone();
        self.plaintext_vectors = Some(vectors.clone());
        self.revealed = true;
        Ok(vectors)
    }
}

/// Aggregate figures for the display layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSummary {
    pub step_count: usize,
    pub total_batch_size: u64,
    pub query_commit: Hash32,
    pub final_commitment: Hash32,
    pub processing_duration_ms: u64,
}

/// An ordered, linked sequence of proof steps. Deserialized chains are
/// validated like assembled ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "ChainDocument")]
pub struct ProofChain {
    steps: Vec<ProofStep>,
    final_commitment: Hash32,
    /// When the chain was assembled.
    pub generated_at: DateTime<Utc>,
    /// Wall-clock time spent producing all steps (milliseconds).
    pub processing_duration_ms: u64,
    /// Ed25519 public key of the result owner, if reveals are signature-gated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_key: Option<Hash32>,
}

#[derive(Deserialize)]
struct ChainDocument {
    steps: Vec<ProofStep>,
    final_commitment: Hash32,
    generated_at: DateTime<Utc>,
    processing_duration_ms: u64,
    #[serde(default)]
    owner_key: Option<Hash32>,
}

impl TryFrom<ChainDocument> for ProofChain {
    type Error = ChainError;

    fn try_from(document: ChainDocument) -> Result<Self, Self::Error> {
        let chain = Self {
            steps: document.steps,
            final_commitment: document.final_commitment,
            generated_at: document.generated_at,
            processing_duration_ms: document.processing_duration_ms,
            owner_key: document.owner_key,
        };
        chain.validate()?;
        Ok(chain)
    }
}

impl ProofChain {
    /// Assemble a chain. The final commitment is taken from the last step.
    pub fn new(
        steps: Vec<ProofStep>,
        generated_at: DateTime<Utc>,
        processing_duration_ms: u64,
    ) -> Result<Self, ChainError> {
        let final_commitment = steps.last().ok_or(ChainError::Empty)?.out_commit;
        let chain = Self {
            steps,
            final_commitment,
            generated_at,
            processing_duration_ms,
            owner_key: None,
        };
        chain.validate()?;
        Ok(chain)
    }

    pub fn with_owner(mut self, owner_key: [u8; 32]) -> Self {
        self.owner_key = Some(Hash32(owner_key));
        self
    }

    /// Parse a chain document and validate it before handing it out.
    pub fn from_json(json: &str) -> Result<Self, ChainError> {
        let document: ChainDocument =
            serde_json::from_str(json).map_err(|e| ChainError::Malformed(e.to_string()))?;
        Self::try_from(document)
    }

    pub fn steps(&self) -> &[ProofStep] {
        &self.steps
    }

    pub fn step(&self, step_number: u32) -> Option<&ProofStep> {
        self.steps.iter().find(|s| s.step_number == step_number)
    }

    pub fn final_commitment(&self) -> Hash32 {
        self.final_commitment
    }

    /// Check every structural invariant of the chain.
    pub fn validate(&self) -> Result<(), ChainError> {
        let first = self.steps.first().ok_or(ChainError::Empty)?;

        for (i, step) in self.steps.iter().enumerate() {
            let expected = i as u32 + 1;
            if step.step_number != expected {
                return Err(ChainError::NonContiguous {
                    expected,
                    found: step.step_number,
                });
            }
            if step.batch_size == 0 {
                return Err(ChainError::EmptyBatch {
                    step: step.step_number,
                });
            }
            if step.query_commit != first.query_commit {
                return Err(ChainError::QueryCommitMismatch {
                    step: step.step_number,
                });
            }
            if !step.can_reveal
                && (step.revealed || step.plaintext_vectors.is_some() || step.sealed.is_some())
            {
                return Err(ChainError::RevealNotPermitted {
                    step: step.step_number,
                });
            }
        }

        for pair in self.steps.windows(2) {
            if pair[0].out_commit != pair[1].in_commit {
                return Err(ChainError::BrokenLink {
                    step: pair[0].step_number,
                    next: pair[1].step_number,
                });
            }
        }

        let last = &self.steps[self.steps.len() - 1];
        if self.final_commitment != last.out_commit {
            return Err(ChainError::FinalCommitmentMismatch);
        }

        Ok(())
    }

    /// Disclose a step's plaintext vectors to the result owner.
    ///
    /// Idempotent: a second reveal returns the same vectors.
    pub fn reveal(
        &mut self,
        step_number: u32,
        requester_is_owner: bool,
    ) -> Result<RevealedVectors, AuthorizationError> {
        let step = self
            .steps
            .iter_mut()
            .find(|s| s.step_number == step_number)
            .ok_or(AuthorizationError::StepNotFound(step_number))?;

        if !step.can_reveal {
            return Err(AuthorizationError::NotRevealable(step_number));
        }
        if !requester_is_owner {
            return Err(AuthorizationError::NotOwner(step_number));
        }

        let vectors = step.reveal_inner()?;
        Ok(RevealedVectors {
            step_number,
            vectors,
        })
    }

    /// Message an owner signs to authorize revealing `step_number`.
    pub fn reveal_challenge(&self, step_number: u32) -> Vec<u8> {
        let mut message = b"vnns-reveal:".to_vec();
        message.extend_from_slice(self.final_commitment.as_bytes());
        message.extend_from_slice(&step_number.to_be_bytes());
        message
    }

    /// Reveal on behalf of a requester that proves ownership with a signature
    /// over `reveal_challenge`.
    pub fn reveal_signed(
        &mut self,
        step_number: u32,
        public_key: &[u8; 32],
        signature: &[u8],
    ) -> Result<RevealedVectors, VnnsError> {
        let is_owner = match &self.owner_key {
            Some(owner) if owner.as_bytes() == public_key => {
                let challenge = self.reveal_challenge(step_number);
                crypto::verify_signature(public_key, &challenge, signature)?
            }
            _ => false,
        };
        Ok(self.reveal(step_number, is_owner)?)
    }

    pub fn summary(&self) -> ChainSummary {
        ChainSummary {
            step_count: self.steps.len(),
            total_batch_size: self.steps.iter().map(|s| u64::from(s.batch_size)).sum(),
            query_commit: self.steps[0].query_commit,
            final_commitment: self.final_commitment,
            processing_duration_ms: self.processing_duration_ms,
        }
    }
}

/// Builds a chain from the journals of consecutive similarity steps.
///
/// Step 1 starts from the query commitment; every later step starts from the
/// previous step's output.
#[derive(Debug, Default)]
pub struct ProofChainBuilder {
    steps: Vec<ProofStep>,
}

impl ProofChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_journal(
        &mut self,
        journal: &StepJournal,
        batch_size: u32,
        can_reveal: bool,
        sealed: Option<Vec<PlaintextVector>>,
    ) -> Result<&mut Self, ChainError> {
        let step_number = self.steps.len() as u32 + 1;
        let in_commit = match self.steps.last() {
            Some(prev) => {
                if prev.query_commit != journal.query_commit {
                    return Err(ChainError::QueryCommitMismatch { step: step_number });
                }
                prev.out_commit
            }
            None => journal.query_commit,
        };

        let mut step = ProofStep::new(
            step_number,
            journal.samples_commit,
            batch_size,
            in_commit,
            journal.output_commit,
            journal.query_commit,
            can_reveal,
        );
        if let Some(vectors) = sealed {
            step = step.with_sealed_vectors(vectors)?;
        }
        self.steps.push(step);
        Ok(self)
    }

    pub fn finish(
        self,
        generated_at: DateTime<Utc>,
        processing_duration_ms: u64,
    ) -> Result<ProofChain, ChainError> {
        ProofChain::new(self.steps, generated_at, processing_duration_ms)
    }
}
