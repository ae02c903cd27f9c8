// crates/vnns-core/src/submission.rs
//
// SubmissionRecord and its state machine.
//
//   Submitted --> IncludedInBlock --> AggregationPending --> Aggregated --> PathResolved
//       |                                   |                    |
//       +---------------+-------------------+--------------------+
//                       |                   |
//                       v                   v
//                    Failed             TimedOut --(late event)--> next progress state
//
// Progress states advance one step at a time and are never revisited.
// TimedOut is terminal but recoverable: a late event for the phase it was
// waiting in resumes progress. A record times out at most once.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::{NetworkTicket, ProofStatement, SubmissionId};
use crate::crypto::Hash32;
use crate::error::{StorageError, TransitionError};
use crate::merkle::MerklePath;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SubmissionState {
    /// Accepted by the network, waiting for block inclusion.
    Submitted,
    /// Included in a block; statement and aggregation ID captured.
    IncludedInBlock,
    /// Waiting for the aggregation receipt matching the captured ID.
    AggregationPending,
    /// Aggregation confirmed; statement path not yet fetched.
    Aggregated,
    /// Statement path attached. Terminal success.
    PathResolved,
    /// Explicitly rejected by the network. Terminal, not recoverable.
    Failed,
    /// No matching event within the deadline. Terminal, recoverable.
    TimedOut,
}

impl SubmissionState {
    /// Position along the success path; `None` for Failed and TimedOut.
    pub fn progress_rank(&self) -> Option<u8> {
        match self {
            SubmissionState::Submitted => Some(0),
            SubmissionState::IncludedInBlock => Some(1),
            SubmissionState::AggregationPending => Some(2),
            SubmissionState::Aggregated => Some(3),
            SubmissionState::PathResolved => Some(4),
            SubmissionState::Failed | SubmissionState::TimedOut => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubmissionState::PathResolved | SubmissionState::Failed | SubmissionState::TimedOut
        )
    }

    pub fn is_recoverable(&self) -> bool {
        *self == SubmissionState::TimedOut
    }

    /// Stable short tag used in storage keys.
    pub fn tag(&self) -> &'static str {
        match self {
            SubmissionState::Submitted => "submitted",
            SubmissionState::IncludedInBlock => "included",
            SubmissionState::AggregationPending => "aggregation_pending",
            SubmissionState::Aggregated => "aggregated",
            SubmissionState::PathResolved => "path_resolved",
            SubmissionState::Failed => "failed",
            SubmissionState::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: SubmissionState,
    pub to: SubmissionState,
    pub at: DateTime<Utc>,
}

/// One in-flight verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub submission_id: SubmissionId,
    pub domain_id: u32,
    pub verifying_key_hash: Hash32,
    pub statement: ProofStatement,
    pub ticket: NetworkTicket,
    pub state: SubmissionState,
    /// Block that included the submission.
    pub block_hash: Option<String>,
    /// Statement hash announced at inclusion.
    pub statement_hash: Option<String>,
    pub aggregation_id: Option<u64>,
    /// Block that carried the aggregation receipt.
    pub aggregation_block_hash: Option<String>,
    pub statement_path: Option<MerklePath>,
    pub last_error: Option<String>,
    /// Waiting state the record was in when it timed out.
    pub timed_out_from: Option<SubmissionState>,
    pub created_at: DateTime<Utc>,
    pub state_entered_at: DateTime<Utc>,
    pub history: Vec<StateTransition>,
}

impl SubmissionRecord {
    pub fn new(statement: ProofStatement, ticket: NetworkTicket, now: DateTime<Utc>) -> Self {
        Self {
            submission_id: statement.submission_id(),
            domain_id: statement.domain_id,
            verifying_key_hash: statement.verifying_key_hash,
            statement,
            ticket,
            state: SubmissionState::Submitted,
            block_hash: None,
            statement_hash: None,
            aggregation_id: None,
            aggregation_block_hash: None,
            statement_path: None,
            last_error: None,
            timed_out_from: None,
            created_at: now,
            state_entered_at: now,
            history: Vec::new(),
        }
    }

    /// Whether `to` is a legal next state from the current one.
    pub fn can_transition(&self, to: SubmissionState) -> bool {
        use SubmissionState::*;
        match (self.state, to) {
            (PathResolved, _) | (Failed, _) => false,
            (TimedOut, Failed) => true,
            (TimedOut, TimedOut) => false,
            (TimedOut, next) => match (self.timed_out_from.and_then(|s| s.progress_rank()), next.progress_rank()) {
                (Some(waiting), Some(rank)) => rank == waiting + 1,
                _ => false,
            },
            (_, Failed) => true,
            (_, TimedOut) => self.timed_out_from.is_none(),
            (current, next) => match (current.progress_rank(), next.progress_rank()) {
                (Some(a), Some(b)) => b == a + 1,
                _ => false,
            },
        }
    }

    /// Move to `to`, recording the transition. Rejects anything that would
    /// revisit or skip a state.
    pub fn transition(&mut self, to: SubmissionState, at: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.can_transition(to) {
            return Err(TransitionError {
                from: self.state,
                to,
            });
        }
        if to == SubmissionState::TimedOut {
            self.timed_out_from = Some(self.state);
        }
        self.history.push(StateTransition {
            from: self.state,
            to,
            at,
        });
        self.state = to;
        self.state_entered_at = at;
        Ok(())
    }

    /// The state whose events this record is currently waiting for. A timed
    /// out record keeps waiting for the same events.
    pub fn waiting_in(&self) -> SubmissionState {
        match self.state {
            SubmissionState::TimedOut => self.timed_out_from.unwrap_or(SubmissionState::Submitted),
            other => other,
        }
    }

    /// External verification link for the display layer.
    pub fn explorer_link(&self, explorer_base: &str) -> String {
        explorer_link(explorer_base, self.statement_hash.as_deref(), &self.ticket)
    }
}

fn explorer_link(explorer_base: &str, statement_hash: Option<&str>, ticket: &NetworkTicket) -> String {
    let base = explorer_base.trim_end_matches('/');
    match statement_hash {
        Some(statement) => format!("{}/statement/{}", base, statement),
        None => format!("{}/submission/{}", base, ticket),
    }
}

/// The write-once record kept after a submission reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub submission_id: SubmissionId,
    pub ticket: NetworkTicket,
    pub domain_id: u32,
    pub aggregation_id: Option<u64>,
    pub block_hash: Option<String>,
    pub aggregation_block_hash: Option<String>,
    pub statement_hash: Option<String>,
    pub statement_path: Option<MerklePath>,
    pub verifying_key_hash: Hash32,
    pub terminal_state: SubmissionState,
    pub error: Option<String>,
    pub history: Vec<StateTransition>,
}

impl TryFrom<&SubmissionRecord> for PersistedRecord {
    type Error = StorageError;

    fn try_from(record: &SubmissionRecord) -> Result<Self, Self::Error> {
        if !record.state.is_terminal() {
            return Err(StorageError::NotTerminal(record.submission_id.to_string()));
        }
        Ok(Self {
            submission_id: record.submission_id,
            ticket: record.ticket.clone(),
            domain_id: record.domain_id,
            aggregation_id: record.aggregation_id,
            block_hash: record.block_hash.clone(),
            aggregation_block_hash: record.aggregation_block_hash.clone(),
            statement_hash: record.statement_hash.clone(),
            statement_path: record.statement_path.clone(),
            verifying_key_hash: record.verifying_key_hash,
            terminal_state: record.state,
            error: record.last_error.clone(),
            history: record.history.clone(),
        })
    }
}

impl PersistedRecord {
    /// Same link the live record produced.
    pub fn explorer_link(&self, explorer_base: &str) -> String {
        explorer_link(explorer_base, self.statement_hash.as_deref(), &self.ticket)
    }

    /// Offline re-verification: the stored path must prove the stored statement.
    pub fn verify_offline(&self) -> bool {
        match (&self.statement_path, &self.statement_hash) {
            (Some(path), Some(statement)) => {
                path.verify()
                    && Hash32::from_hex(statement).map(|s| s == path.leaf).unwrap_or(false)
            }
            _ => false,
        }
    }
}
