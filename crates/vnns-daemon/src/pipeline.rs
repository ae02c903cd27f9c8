// crates/vnns-daemon/src/pipeline.rs
//
// Attestation pipeline for the VNNS daemon.
//
// Takes a finished proof artifact (and optionally the proof chain it
// closes) through every phase against one network session:
// register key -> submit -> await inclusion + aggregation -> resolve
// statement path -> persist -> export. Each phase fails with its own
// typed error; a record whose persist fails stays in the tracker so the
// attestation can be retried.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use vnns_core::artifact::{image_digest, CircuitVersion, ProofArtifact, RegisteredKey, SubmissionId};
use vnns_core::chain::ProofChain;
use vnns_core::error::{ChainError, CorrelationTimeout, SubmissionError, VnnsError};
use vnns_core::submission::{PersistedRecord, SubmissionRecord, SubmissionState};
use vnns_core::traits::{RecordStore, VerificationNetwork};
use vnns_store::{export_aggregation, export_vkey};
use vnns_verify::{
    AggregationTracker, NetworkSession, ProofSubmitter, Retry, RetryConfig,
    StatementPathResolver, TrackerConfig, VerificationKeyRegistrar,
};

/// Everything the pipeline needs besides the network and the store.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub domain_id: u32,
    pub circuit_version: CircuitVersion,
    pub explorer_url: String,
    pub export_dir: PathBuf,
    pub tracker: TrackerConfig,
    pub sweep_interval: Duration,
    pub retry: RetryConfig,
    pub registration_timeout: Duration,
}

/// Result of a completed attestation.
#[derive(Debug, Clone)]
pub struct AttestationOutcome {
    pub submission_id: SubmissionId,
    pub record: PersistedRecord,
    pub explorer_link: String,
    pub vkey_export: PathBuf,
    pub aggregation_export: Option<PathBuf>,
}

pub struct AttestationPipeline {
    session: Arc<NetworkSession>,
    registrar: Arc<VerificationKeyRegistrar>,
    submitter: ProofSubmitter,
    tracker: Arc<AggregationTracker>,
    resolver: StatementPathResolver,
    store: Arc<dyn RecordStore>,
    settings: PipelineSettings,
    shutdown: watch::Sender<bool>,
    tracker_task: Option<JoinHandle<()>>,
}

impl AttestationPipeline {
    pub fn new(
        network: Arc<dyn VerificationNetwork>,
        store: Arc<dyn RecordStore>,
        settings: PipelineSettings,
    ) -> Self {
        let session = NetworkSession::open(network, settings.domain_id);
        let registrar = Arc::new(VerificationKeyRegistrar::new(
            session.clone(),
            Some(store.clone()),
            settings.registration_timeout,
        ));
        let tracker = Arc::new(AggregationTracker::new(settings.tracker.clone()));
        let submitter = ProofSubmitter::new(
            session.clone(),
            registrar.clone(),
            tracker.clone(),
            Some(store.clone()),
        );
        let resolver =
            StatementPathResolver::new(session.clone(), tracker.clone(), settings.retry.clone());
        let (shutdown, _) = watch::channel(false);

        Self {
            session,
            registrar,
            submitter,
            tracker,
            resolver,
            store,
            settings,
            shutdown,
            tracker_task: None,
        }
    }

    pub fn tracker(&self) -> &Arc<AggregationTracker> {
        &self.tracker
    }

    /// Subscribe to the session's event stream and spawn the tracker loop.
    /// Calling it again while the loop runs is a no-op.
    pub async fn start(&mut self) -> Result<(), VnnsError> {
        if self.tracker_task.is_some() {
            return Ok(());
        }
        let events = self.session.subscribe().await?;
        let task = tokio::spawn(self.tracker.clone().run(
            events,
            self.shutdown.subscribe(),
            self.settings.sweep_interval,
        ));
        self.tracker_task = Some(task);
        tracing::info!(
            "Attestation pipeline started on domain {}",
            self.session.domain_id()
        );
        Ok(())
    }

    /// Attest one proof artifact end to end.
    pub async fn attest(
        &self,
        artifact: &ProofArtifact,
        chain: Option<&ProofChain>,
    ) -> Result<AttestationOutcome, VnnsError> {
        if let Some(chain) = chain {
            check_chain(artifact, chain)?;
        }

        let key_hash = self
            .registrar
            .register(&artifact.verifying_key_image, &self.settings.circuit_version)
            .await?;
        let vkey_export = export_vkey(
            &self.settings.export_dir,
            &RegisteredKey {
                image_digest: image_digest(&artifact.verifying_key_image),
                key_hash,
                circuit_version: self.settings.circuit_version.clone(),
                registered_at: Utc::now(),
            },
        )?;

        let submitter = &self.submitter;
        let domain_id = self.settings.domain_id;
        let submitted = Retry::new(self.settings.retry.clone())
            .run_with_predicate(
                "submit_proof",
                || async move { submitter.submit(artifact, key_hash, domain_id).await },
                SubmissionError::is_transient,
            )
            .await;
        if submitted.attempts > 1 {
            tracing::info!("Proof submitted after {} attempts", submitted.attempts);
        }
        let handle = submitted.into_result()?;
        let id = handle.submission_id;
        if let Some(persisted) = handle.persisted {
            return self.settled(persisted, vkey_export);
        }

        let record = match self
            .tracker
            .wait_for(
                &id,
                |state| state == SubmissionState::Aggregated || state.is_terminal(),
                self.wait_budget(),
            )
            .await
        {
            Some(record) => record,
            None => {
                let current = self.tracker.get(&id).await;
                let waiting_in = current
                    .as_ref()
                    .map(|r| r.waiting_in())
                    .unwrap_or(SubmissionState::Submitted);
                return Err(self.timeout_for(&id, waiting_in).into());
            }
        };

        let record = match record.state {
            SubmissionState::Aggregated => self.resolver.resolve_path(&id).await?,
            SubmissionState::TimedOut => {
                // Keep tracking: a late event can still resolve it.
                self.persist(&record).await?;
                return Err(self.timeout_for(&id, record.waiting_in()).into());
            }
            SubmissionState::Failed => {
                self.persist(&record).await?;
                self.tracker.evict(&id).await;
                return Err(VnnsError::Failed {
                    id: id.to_string(),
                    reason: record
                        .last_error
                        .unwrap_or_else(|| "rejected by network".to_string()),
                });
            }
            _ => record,
        };

        self.finish(record, vkey_export).await
    }

    /// Resolve, persist and export a tracked submission that reached
    /// `Aggregated` after an earlier attempt gave up on it.
    pub async fn resume(
        &self,
        id: &SubmissionId,
        vkey_export: PathBuf,
    ) -> Result<AttestationOutcome, VnnsError> {
        let record = self.resolver.resolve_path(id).await?;
        self.finish(record, vkey_export).await
    }

    async fn finish(
        &self,
        record: SubmissionRecord,
        vkey_export: PathBuf,
    ) -> Result<AttestationOutcome, VnnsError> {
        let id = record.submission_id;
        let persisted = self.persist(&record).await?;
        let aggregation_export = if persisted.terminal_state == SubmissionState::PathResolved {
            Some(export_aggregation(&self.settings.export_dir, &persisted)?)
        } else {
            None
        };
        self.tracker.evict(&id).await;

        Ok(AttestationOutcome {
            submission_id: id,
            explorer_link: record.explorer_link(&self.settings.explorer_url),
            record: persisted,
            vkey_export,
            aggregation_export,
        })
    }

    /// Outcome of a statement an earlier attestation already settled.
    fn settled(
        &self,
        persisted: PersistedRecord,
        vkey_export: PathBuf,
    ) -> Result<AttestationOutcome, VnnsError> {
        let id = persisted.submission_id;
        if persisted.terminal_state == SubmissionState::Failed {
            return Err(VnnsError::Failed {
                id: id.to_string(),
                reason: persisted
                    .error
                    .unwrap_or_else(|| "rejected by network".to_string()),
            });
        }
        let aggregation_export = if persisted.terminal_state == SubmissionState::PathResolved {
            Some(export_aggregation(&self.settings.export_dir, &persisted)?)
        } else {
            None
        };
        Ok(AttestationOutcome {
            submission_id: id,
            explorer_link: persisted.explorer_link(&self.settings.explorer_url),
            record: persisted,
            vkey_export,
            aggregation_export,
        })
    }

    async fn persist(&self, record: &SubmissionRecord) -> Result<PersistedRecord, VnnsError> {
        match self.store.persist(record).await {
            Ok(persisted) => Ok(persisted),
            Err(e) => {
                tracing::error!(
                    "Failed to persist {:?} ({}): {}",
                    record.submission_id,
                    record.state,
                    e
                );
                self.tracker
                    .record_error(&record.submission_id, format!("persist failed: {}", e))
                    .await;
                Err(e.into())
            }
        }
    }

    fn wait_budget(&self) -> Duration {
        let tracker = &self.settings.tracker;
        tracker.inclusion_timeout
            + tracker.aggregation_timeout
            + self.settings.sweep_interval * 2
            + Duration::from_secs(1)
    }

    fn timeout_for(&self, id: &SubmissionId, waiting_in: SubmissionState) -> CorrelationTimeout {
        let tracker = &self.settings.tracker;
        let after = match waiting_in {
            SubmissionState::Submitted => tracker.inclusion_timeout,
            _ => tracker.aggregation_timeout,
        };
        CorrelationTimeout {
            submission_id: id.to_string(),
            waiting_in,
            after_secs: after.as_secs(),
        }
    }

    /// Stop the tracker loop and release the network session.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.tracker_task.take() {
            if let Err(e) = task.await {
                tracing::error!("Tracker task ended abnormally: {}", e);
            }
        }
        self.session.close();
        tracing::info!("Attestation pipeline stopped");
    }
}

/// The artifact must close the chain it claims to belong to.
fn check_chain(artifact: &ProofArtifact, chain: &ProofChain) -> Result<(), ChainError> {
    chain.validate()?;
    let journal = artifact.journal()?;
    if journal.output_commit != chain.final_commitment() {
        return Err(ChainError::FinalCommitmentMismatch);
    }
    Ok(())
}
