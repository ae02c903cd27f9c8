// crates/vnns-verify/src/submitter.rs
//
// ProofSubmitter: packages a proof artifact into a statement, sends it to the
// network, and hands the resulting record to the AggregationTracker.
//
// The submission ID is the content hash of the packaged statement, so
// re-submitting the same artifact returns the existing record instead of
// creating a duplicate. The tracker is asked first, then the record store,
// since an earlier run may have attested it already. The submitter itself
// never retries; callers apply a `Retry` policy using
// `SubmissionError::is_transient`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;

use vnns_core::artifact::{NetworkTicket, ProofArtifact, ProofStatement, SubmissionId};
use vnns_core::crypto::Hash32;
use vnns_core::error::SubmissionError;
use vnns_core::submission::{PersistedRecord, SubmissionRecord, SubmissionState};
use vnns_core::traits::RecordStore;

use crate::registrar::VerificationKeyRegistrar;
use crate::session::NetworkSession;
use crate::tracker::{AggregationTracker, TrackOutcome};

/// Result of a submit call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionHandle {
    pub submission_id: SubmissionId,
    pub ticket: NetworkTicket,
    /// State of the record when the handle was issued.
    pub state: SubmissionState,
    /// True when an identical statement was already in flight or attested.
    pub existing: bool,
    /// The stored record, when an earlier run already settled it.
    pub persisted: Option<PersistedRecord>,
}

pub struct ProofSubmitter {
    session: Arc<NetworkSession>,
    registrar: Arc<VerificationKeyRegistrar>,
    tracker: Arc<AggregationTracker>,
    store: Option<Arc<dyn RecordStore>>,
    in_flight: Mutex<HashSet<SubmissionId>>,
}

fn lock_set(set: &Mutex<HashSet<SubmissionId>>) -> MutexGuard<'_, HashSet<SubmissionId>> {
    match set.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Releases an in-flight reservation on every exit path.
struct Reservation<'a> {
    set: &'a Mutex<HashSet<SubmissionId>>,
    id: SubmissionId,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        lock_set(self.set).remove(&self.id);
    }
}

impl ProofSubmitter {
    pub fn new(
        session: Arc<NetworkSession>,
        registrar: Arc<VerificationKeyRegistrar>,
        tracker: Arc<AggregationTracker>,
        store: Option<Arc<dyn RecordStore>>,
    ) -> Self {
        Self {
            session,
            registrar,
            tracker,
            store,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Submit `artifact` under a registered key to `domain_id`.
    pub async fn submit(
        &self,
        artifact: &ProofArtifact,
        verifying_key_hash: Hash32,
        domain_id: u32,
    ) -> Result<SubmissionHandle, SubmissionError> {
        if !self.registrar.is_registered(&verifying_key_hash).await {
            return Err(SubmissionError::UnknownVerifyingKey(
                verifying_key_hash.to_string(),
            ));
        }

        let statement = ProofStatement::package(artifact, verifying_key_hash, domain_id);
        let id = statement.submission_id();

        if let Some(existing) = self.tracker.get(&id).await {
            tracing::info!(
                "Submission {:?} already tracked ({}), not resending",
                id,
                existing.state
            );
            return Ok(SubmissionHandle {
                submission_id: id,
                ticket: existing.ticket,
                state: existing.state,
                existing: true,
                persisted: None,
            });
        }

        if let Some(persisted) = self.lookup_store(&id).await? {
            tracing::info!(
                "Submission {:?} already persisted ({}), not resending",
                id,
                persisted.terminal_state
            );
            return Ok(SubmissionHandle {
                submission_id: id,
                ticket: persisted.ticket.clone(),
                state: persisted.terminal_state,
                existing: true,
                persisted: Some(persisted),
            });
        }

        let _reservation = {
            let mut in_flight = lock_set(&self.in_flight);
            if !in_flight.insert(id) {
                return Err(SubmissionError::AlreadyInFlight(id.to_string()));
            }
            Reservation {
                set: &self.in_flight,
                id,
            }
        };

        tracing::info!(
            "Submitting proof {:?} to domain {} ({} proof bytes)",
            id,
            domain_id,
            statement.proof.len()
        );

        let ticket = self.session.network()?.submit_statement(&statement).await?;
        tracing::info!("Proof {:?} accepted with ticket {}", id, ticket);

        let record = SubmissionRecord::new(statement, ticket.clone(), Utc::now());
        let state = match self.tracker.track(record).await {
            TrackOutcome::Tracked => SubmissionState::Submitted,
            TrackOutcome::AlreadyTracked(state) => state,
        };
        // Buffered events may already have advanced it.
        let state = self
            .tracker
            .get(&id)
            .await
            .map(|r| r.state)
            .unwrap_or(state);

        Ok(SubmissionHandle {
            submission_id: id,
            ticket,
            state,
            existing: false,
            persisted: None,
        })
    }

    /// A settled record for `id`. A timed-out one does not count: the
    /// statement is sent again and its outcome supersedes the stored one.
    async fn lookup_store(
        &self,
        id: &SubmissionId,
    ) -> Result<Option<PersistedRecord>, SubmissionError> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        match store.load(id).await? {
            Some(found) if found.terminal_state == SubmissionState::TimedOut => {
                tracing::info!("Submission {:?} timed out in an earlier run, resending", id);
                Ok(None)
            }
            found => Ok(found),
        }
    }
}
