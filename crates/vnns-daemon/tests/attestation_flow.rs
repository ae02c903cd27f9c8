// crates/vnns-daemon/tests/attestation_flow.rs
//
// Integration tests for the attestation flow.
//
// Drives chain assembly, key registration, submission, aggregation
// tracking, path resolution, persistence and export against the in-process
// network and a temporary RocksDB store.
//
// These tests use the public APIs of the underlying library crates directly
// (vnns-core, vnns-verify, vnns-store) since the daemon is a binary crate
// with no lib.rs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use vnns_core::artifact::{CircuitVersion, ProofArtifact};
use vnns_core::chain::{PlaintextVector, ProofChain, ProofChainBuilder};
use vnns_core::crypto::{commit_vectors, hash_bytes, Hash32};
use vnns_core::error::{AuthorizationError, ChainError, ResolutionError};
use vnns_core::journal::StepJournal;
use vnns_core::submission::SubmissionState;
use vnns_core::traits::{RecordStore, VerificationNetwork};
use vnns_store::{export_aggregation, RocksRecordStore};
use vnns_verify::{
    AggregationTracker, LocalNetwork, NetworkSession, ProofSubmitter, RetryConfig,
    StatementPathResolver, TrackerConfig, VerificationKeyRegistrar,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Create a temporary directory path using UUID to avoid conflicts.
fn temp_db_path(label: &str) -> String {
    let dir = std::env::temp_dir();
    let path = dir.join(format!("vnns_test_{}_{}", label, Uuid::now_v7()));
    path.to_string_lossy().to_string()
}

fn query() -> Hash32 {
    hash_bytes(b"query vector")
}

fn journal(step: u8) -> StepJournal {
    StepJournal {
        closest_index: u32::from(step) * 3,
        query_commit: query(),
        samples_commit: hash_bytes(&[step, 0xba]),
        output_commit: hash_bytes(&[step, 0x0c]),
    }
}

fn batch() -> Vec<PlaintextVector> {
    vec![
        PlaintextVector {
            id: "doc-1".to_string(),
            data: vec![0.25, -0.5, 1.0],
        },
        PlaintextVector {
            id: "doc-2".to_string(),
            data: vec![0.75, 0.0, -1.0],
        },
    ]
}

/// Two-step chain: step 1 is revealable and carries its plaintext batch.
fn two_step_chain() -> ProofChain {
    let vectors = batch();
    let data: Vec<&[f32]> = vectors.iter().map(|v| v.data.as_slice()).collect();
    let mut first = journal(1);
    first.samples_commit = commit_vectors(&data);

    let mut builder = ProofChainBuilder::new();
    builder.push_journal(&first, 2, true, Some(vectors)).unwrap();
    builder.push_journal(&journal(2), 5, false, None).unwrap();
    builder.finish(Utc::now(), 840).unwrap()
}

fn artifact_for(chain: &ProofChain, tag: u8) -> ProofArtifact {
    let last = chain.steps().last().unwrap();
    let closing = StepJournal {
        closest_index: 6,
        query_commit: last.query_commit,
        samples_commit: last.batch_hash,
        output_commit: chain.final_commitment(),
    };
    ProofArtifact {
        proof: vec![tag; 64],
        verifying_key_image: vec![0x11; 32],
        public_inputs: closing.encode(),
    }
}

struct Harness {
    network: LocalNetwork,
    registrar: Arc<VerificationKeyRegistrar>,
    tracker: Arc<AggregationTracker>,
    submitter: ProofSubmitter,
    resolver: StatementPathResolver,
    store: Arc<RocksRecordStore>,
}

fn harness(label: &str, tracker_config: TrackerConfig) -> Harness {
    let network = LocalNetwork::new();
    let store = Arc::new(RocksRecordStore::open(&temp_db_path(label)).unwrap());
    let session = NetworkSession::open(Arc::new(network.clone()), 0);
    let registrar = Arc::new(VerificationKeyRegistrar::new(
        session.clone(),
        Some(store.clone()),
        Duration::from_secs(5),
    ));
    let tracker = Arc::new(AggregationTracker::new(tracker_config));
    let submitter = ProofSubmitter::new(
        session.clone(),
        registrar.clone(),
        tracker.clone(),
        Some(store.clone()),
    );
    let resolver = StatementPathResolver::new(session, tracker.clone(), RetryConfig::fast());
    Harness {
        network,
        registrar,
        tracker,
        submitter,
        resolver,
        store,
    }
}

// ---------------------------------------------------------------------------
// Proof chain
// ---------------------------------------------------------------------------

#[test]
fn test_two_step_chain_validates_and_round_trips() {
    let chain = two_step_chain();
    assert!(chain.validate().is_ok());
    assert_eq!(chain.final_commitment(), journal(2).output_commit);
    assert_eq!(chain.steps()[1].in_commit, chain.steps()[0].out_commit);

    let summary = chain.summary();
    assert_eq!(summary.step_count, 2);
    assert_eq!(summary.total_batch_size, 7);

    let json = serde_json::to_string(&chain).unwrap();
    let parsed = ProofChain::from_json(&json).unwrap();
    assert_eq!(parsed.final_commitment(), chain.final_commitment());
}

#[test]
fn test_corrupted_out_commit_is_rejected() {
    let chain = two_step_chain();
    let mut doc: serde_json::Value = serde_json::to_value(&chain).unwrap();
    doc["steps"][0]["out_commit"] = serde_json::Value::String(hash_bytes(b"tampered").to_hex());

    let err = ProofChain::from_json(&doc.to_string()).unwrap_err();
    assert_eq!(err, ChainError::BrokenLink { step: 1, next: 2 });
}

#[test]
fn test_owner_reveal_is_idempotent_and_gated() {
    let mut chain = two_step_chain();

    assert_eq!(
        chain.reveal(1, false).unwrap_err(),
        AuthorizationError::NotOwner(1)
    );
    assert_eq!(
        chain.reveal(2, true).unwrap_err(),
        AuthorizationError::NotRevealable(2)
    );

    let first = chain.reveal(1, true).unwrap();
    let second = chain.reveal(1, true).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.vectors, batch());
    assert!(chain.steps()[0].revealed());
    assert!(!chain.steps()[1].revealed());
    assert!(chain.validate().is_ok());
}

// ---------------------------------------------------------------------------
// Submission lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_submit_include_aggregate_resolve_persist() {
    let h = harness("lifecycle", TrackerConfig::default());
    let chain = two_step_chain();
    let artifact = artifact_for(&chain, 1);
    assert_eq!(
        artifact.journal().unwrap().output_commit,
        chain.final_commitment()
    );

    let vk = h
        .registrar
        .register(&artifact.verifying_key_image, &CircuitVersion::default())
        .await
        .unwrap();
    let handle = h.submitter.submit(&artifact, vk, 0).await.unwrap();
    assert_eq!(handle.state, SubmissionState::Submitted);

    let inclusion = h.network.include(&handle.ticket, 42).unwrap();
    h.tracker.on_inclusion(inclusion, Utc::now()).await;
    let record = h.tracker.get(&handle.submission_id).await.unwrap();
    assert_eq!(record.state, SubmissionState::AggregationPending);
    assert_eq!(record.aggregation_id, Some(42));

    // A receipt for another aggregation leaves it pending.
    let other = h.network.include(&h.network.submit_statement(&other_statement(vk)).await.unwrap(), 7);
    assert!(other.is_some());
    let stray = h.network.publish_aggregation(0, "7").unwrap();
    assert!(h.tracker.on_aggregation_receipt(stray, Utc::now()).await.is_empty());
    assert_eq!(
        h.tracker.get(&handle.submission_id).await.unwrap().state,
        SubmissionState::AggregationPending
    );

    // The network reports 42 in grouped form.
    let receipt = h.network.publish_aggregation(0, "4,2").unwrap();
    let aggregated = h.tracker.on_aggregation_receipt(receipt, Utc::now()).await;
    assert_eq!(aggregated, vec![handle.submission_id]);

    let resolved = h.resolver.resolve_path(&handle.submission_id).await.unwrap();
    assert_eq!(resolved.state, SubmissionState::PathResolved);

    let persisted = h.store.persist(&resolved).await.unwrap();
    assert_eq!(persisted.terminal_state, SubmissionState::PathResolved);
    assert_eq!(persisted.aggregation_id, Some(42));
    assert_eq!(persisted.verifying_key_hash, vk);
    assert!(persisted.verify_offline());

    let loaded = h.store.load(&handle.submission_id).await.unwrap().unwrap();
    assert_eq!(loaded, persisted);

    let export_dir = std::env::temp_dir().join(format!("vnns_export_{}", Uuid::now_v7()));
    let file = export_aggregation(&export_dir, &loaded).unwrap();
    let doc: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(file).unwrap()).unwrap();
    assert_eq!(doc["aggregationId"], 42);

    assert!(h.tracker.evict(&handle.submission_id).await.is_some());
    assert!(h.tracker.is_empty().await);
}

fn other_statement(vk: Hash32) -> vnns_core::artifact::ProofStatement {
    vnns_core::artifact::ProofStatement {
        proof: vec![0xee; 8],
        verifying_key_hash: vk,
        public_inputs: vec![1, 2, 3],
        domain_id: 0,
    }
}

#[tokio::test]
async fn test_duplicate_inclusion_is_noop() {
    let h = harness("duplicate", TrackerConfig::default());
    let artifact = artifact_for(&two_step_chain(), 2);
    let vk = h
        .registrar
        .register(&artifact.verifying_key_image, &CircuitVersion::default())
        .await
        .unwrap();
    let handle = h.submitter.submit(&artifact, vk, 0).await.unwrap();

    let inclusion = h.network.include(&handle.ticket, 5).unwrap();
    assert!(h.tracker.on_inclusion(inclusion.clone(), Utc::now()).await.is_some());
    let before = h.tracker.get(&handle.submission_id).await.unwrap();

    assert!(h.tracker.on_inclusion(inclusion, Utc::now()).await.is_none());
    let after = h.tracker.get(&handle.submission_id).await.unwrap();
    assert_eq!(after.state, before.state);
    assert_eq!(after.history.len(), before.history.len());

    // Resubmitting the same artifact returns the tracked record.
    let again = h.submitter.submit(&artifact, vk, 0).await.unwrap();
    assert!(again.existing);
    assert_eq!(again.submission_id, handle.submission_id);
    assert_eq!(h.network.submissions(), 1);
}

#[tokio::test]
async fn test_timeout_then_late_receipt_resolves() {
    let h = harness(
        "late",
        TrackerConfig {
            inclusion_timeout: Duration::from_secs(60),
            aggregation_timeout: Duration::from_secs(60),
        },
    );
    let artifact = artifact_for(&two_step_chain(), 3);
    let vk = h
        .registrar
        .register(&artifact.verifying_key_image, &CircuitVersion::default())
        .await
        .unwrap();
    let handle = h.submitter.submit(&artifact, vk, 0).await.unwrap();
    let inclusion = h.network.include(&handle.ticket, 1_024).unwrap();
    h.tracker.on_inclusion(inclusion, Utc::now()).await;

    let later = Utc::now() + chrono::Duration::seconds(120);
    let expired = h.tracker.expire_overdue(later).await;
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].waiting_in, SubmissionState::AggregationPending);

    let timed_out = h.tracker.get(&handle.submission_id).await.unwrap();
    assert_eq!(timed_out.state, SubmissionState::TimedOut);
    assert!(h.store.persist(&timed_out).await.is_ok());

    // Not yet aggregated: no path query goes out.
    assert_eq!(
        h.resolver.resolve_path(&handle.submission_id).await.unwrap_err(),
        ResolutionError::NotYetAvailable(SubmissionState::TimedOut)
    );
    assert_eq!(h.network.path_queries(), 0);

    let receipt = h.network.publish_aggregation(0, "1,024").unwrap();
    let aggregated = h.tracker.on_aggregation_receipt(receipt, Utc::now()).await;
    assert_eq!(aggregated, vec![handle.submission_id]);

    let resolved = h.resolver.resolve_path(&handle.submission_id).await.unwrap();
    let persisted = h.store.persist(&resolved).await.unwrap();
    assert_eq!(persisted.terminal_state, SubmissionState::PathResolved);
    assert!(h
        .store
        .list_by_state(SubmissionState::TimedOut)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_rejection_is_persisted_as_failed() {
    let h = harness("rejected", TrackerConfig::default());
    let artifact = artifact_for(&two_step_chain(), 4);
    let vk = h
        .registrar
        .register(&artifact.verifying_key_image, &CircuitVersion::default())
        .await
        .unwrap();
    let handle = h.submitter.submit(&artifact, vk, 0).await.unwrap();

    let rejection = h.network.reject(&handle.ticket, "invalid journal");
    h.tracker.on_rejection(rejection, Utc::now()).await;

    let record = h
        .tracker
        .wait_terminal(&handle.submission_id, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(record.state, SubmissionState::Failed);

    let persisted = h.store.persist(&record).await.unwrap();
    assert_eq!(persisted.error.as_deref(), Some("invalid journal"));
    assert!(persisted.statement_path.is_none());
    assert_eq!(
        h.store.list_by_state(SubmissionState::Failed).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_tracker_loop_consumes_network_events() {
    let network = LocalNetwork::new().with_auto_aggregation(Duration::from_millis(5));
    let session = NetworkSession::open(Arc::new(network.clone()), 0);
    let registrar = Arc::new(VerificationKeyRegistrar::new(
        session.clone(),
        None,
        Duration::from_secs(5),
    ));
    let tracker = Arc::new(AggregationTracker::new(TrackerConfig::default()));
    let submitter = ProofSubmitter::new(session.clone(), registrar.clone(), tracker.clone(), None);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let events = session.subscribe().await.unwrap();
    let task = tokio::spawn(
        tracker
            .clone()
            .run(events, shutdown_rx, Duration::from_millis(10)),
    );

    let artifact = artifact_for(&two_step_chain(), 5);
    let vk = registrar
        .register(&artifact.verifying_key_image, &CircuitVersion::default())
        .await
        .unwrap();
    let handle = submitter.submit(&artifact, vk, 0).await.unwrap();

    let record = tracker
        .wait_for(
            &handle.submission_id,
            |s| s == SubmissionState::Aggregated,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(record.aggregation_id, Some(1));

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
    session.close();
}

// ---------------------------------------------------------------------------
// Key registration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_key_registration_survives_restart() {
    let path = temp_db_path("keys");
    let image = vec![0x22; 32];
    let version = CircuitVersion::default();

    let first_network = LocalNetwork::new();
    let key_hash = {
        let store = Arc::new(RocksRecordStore::open(&path).unwrap());
        let registrar = VerificationKeyRegistrar::new(
            NetworkSession::open(Arc::new(first_network.clone()), 0),
            Some(store),
            Duration::from_secs(5),
        );
        let hash = registrar.register(&image, &version).await.unwrap();
        assert_eq!(registrar.register(&image, &version).await.unwrap(), hash);
        hash
    };
    assert_eq!(first_network.key_registrations(), 1);

    // Same store, fresh process: answered from the store.
    let second_network = LocalNetwork::new();
    let store = Arc::new(RocksRecordStore::open(&path).unwrap());
    let registrar = VerificationKeyRegistrar::new(
        NetworkSession::open(Arc::new(second_network.clone()), 0),
        Some(store),
        Duration::from_secs(5),
    );
    assert_eq!(registrar.register(&image, &version).await.unwrap(), key_hash);
    assert!(registrar.is_registered(&key_hash).await);
    assert_eq!(second_network.key_registrations(), 0);
}
