// crates/vnns-verify/src/local.rs
//
// LocalNetwork: an in-process verification network.
//
// Used by the daemon's `--local` mode and by tests. Key registrations
// finalize immediately (or after a configurable delay), submissions are
// accepted with sequential tickets, and inclusion / aggregation events are
// emitted either on demand through the helper methods or automatically
// after each submission when auto-aggregation is enabled.
//
// Aggregates are real Keccak Merkle trees over the included statements, so
// paths served by `statement_path` verify offline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use vnns_core::artifact::{KeyFinalization, KeyRegistrationRequest, NetworkTicket, ProofStatement};
use vnns_core::crypto::{hash_bytes, keccak_bytes, Hash32};
use vnns_core::error::NetworkError;
use vnns_core::event::{
    parse_grouped_integer, AggregationReceipt, EventFilter, InclusionEvent, NetworkEvent,
    RejectionEvent,
};
use vnns_core::merkle::{MerklePath, MerkleTree};
use vnns_core::traits::{EventStream, PathQuery, VerificationNetwork};

const SUBSCRIBER_BUFFER: usize = 256;

struct LocalSubmission {
    statement: Hash32,
    domain_id: u32,
}

struct Aggregate {
    block_hash: String,
    leaves: Vec<Hash32>,
    tree: MerkleTree,
}

#[derive(Default)]
struct LocalState {
    next_ticket: u64,
    block_height: u64,
    next_auto_aggregation: u64,
    submissions: HashMap<NetworkTicket, LocalSubmission>,
    /// Statements assigned to an aggregation that has not been published yet.
    assigned: HashMap<(u32, u64), Vec<Hash32>>,
    aggregates: HashMap<(u32, u64), Aggregate>,
    subscribers: Vec<(EventFilter, mpsc::Sender<NetworkEvent>)>,
}

impl LocalState {
    fn next_block_hash(&mut self) -> String {
        self.block_height += 1;
        format!("0x{}", hash_bytes(&self.block_height.to_be_bytes()).to_hex())
    }

    fn emit(&mut self, event: NetworkEvent) {
        self.subscribers.retain(|(filter, tx)| {
            if tx.is_closed() {
                return false;
            }
            if !filter.accepts(&event) {
                return true;
            }
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("Local subscriber lagging, dropped {} event", event.kind());
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<LocalState>,
    key_registrations: AtomicU64,
    submissions: AtomicU64,
    path_queries: AtomicU64,
    reject_keys: AtomicBool,
    refuse_submissions: AtomicBool,
    failing_submissions: AtomicU32,
    failing_path_queries: AtomicU32,
    finalization_delay_ms: AtomicU64,
    auto_delay_ms: Mutex<Option<u64>>,
}

/// In-process verification network. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    shared: Arc<Shared>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Include and aggregate every accepted submission on its own, `delay`
    /// after it was accepted.
    pub fn with_auto_aggregation(self, delay: Duration) -> Self {
        if let Ok(mut auto) = self.shared.auto_delay_ms.lock() {
            *auto = Some(delay.as_millis() as u64);
        }
        self
    }

    pub fn reject_keys(&self, reject: bool) {
        self.shared.reject_keys.store(reject, Ordering::SeqCst);
    }

    /// Refuse every submission at the door (invalid proof).
    pub fn refuse_submissions(&self, refuse: bool) {
        self.shared.refuse_submissions.store(refuse, Ordering::SeqCst);
    }

    /// Fail the next `n` submissions with a transport error.
    pub fn fail_next_submissions(&self, n: u32) {
        self.shared.failing_submissions.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` path queries with a transport error.
    pub fn fail_next_path_queries(&self, n: u32) {
        self.shared.failing_path_queries.store(n, Ordering::SeqCst);
    }

    pub fn set_finalization_delay(&self, delay: Duration) {
        self.shared
            .finalization_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn key_registrations(&self) -> u64 {
        self.shared.key_registrations.load(Ordering::SeqCst)
    }

    pub fn submissions(&self) -> u64 {
        self.shared.submissions.load(Ordering::SeqCst)
    }

    pub fn path_queries(&self) -> u64 {
        self.shared.path_queries.load(Ordering::SeqCst)
    }

    /// Canonical statement hash this network assigns to `statement`.
    pub fn statement_hash(statement: &ProofStatement) -> Hash32 {
        keccak_bytes(statement.submission_id().0.as_bytes())
    }

    /// Include the submission behind `ticket` in a block and assign it to
    /// `aggregation_id`. Returns the emitted event, or `None` for an unknown ticket.
    pub fn include(&self, ticket: &NetworkTicket, aggregation_id: u64) -> Option<InclusionEvent> {
        let mut state = self.lock();
        let (statement, domain_id) = {
            let submission = state.submissions.get(ticket)?;
            (submission.statement, submission.domain_id)
        };
        state
            .assigned
            .entry((domain_id, aggregation_id))
            .or_default()
            .push(statement);
        let event = InclusionEvent {
            ticket: ticket.clone(),
            block_hash: state.next_block_hash(),
            statement: format!("0x{}", statement.to_hex()),
            aggregation_id,
            domain_id,
        };
        tracing::debug!(
            "Local network included {} in aggregation {}",
            ticket,
            aggregation_id
        );
        state.emit(NetworkEvent::IncludedInBlock(event.clone()));
        Some(event)
    }

    /// Publish the aggregation `(domain_id, aggregation_id)` over every
    /// statement assigned to it so far. The ID is given in network display
    /// form and may carry grouping separators.
    pub fn publish_aggregation(
        &self,
        domain_id: u32,
        aggregation_id: &str,
    ) -> Result<AggregationReceipt, NetworkError> {
        let id = parse_grouped_integer(aggregation_id)?;
        let mut state = self.lock();
        let leaves = state.assigned.remove(&(domain_id, id)).unwrap_or_default();
        if leaves.is_empty() {
            return Err(NetworkError::Protocol(format!(
                "aggregation {} of domain {} has no statements",
                id, domain_id
            )));
        }
        let block_hash = state.next_block_hash();
        let tree = MerkleTree::from_leaves(leaves.clone());
        tracing::debug!(
            "Local network published aggregation {} ({} statements, root {})",
            id,
            leaves.len(),
            tree.root().truncated()
        );
        state.aggregates.insert(
            (domain_id, id),
            Aggregate {
                block_hash: block_hash.clone(),
                leaves,
                tree,
            },
        );
        let receipt = AggregationReceipt {
            block_hash,
            domain_id: domain_id.to_string(),
            aggregation_id: aggregation_id.to_string(),
        };
        state.emit(NetworkEvent::AggregationReceipt(receipt.clone()));
        Ok(receipt)
    }

    /// Reject an accepted submission.
    pub fn reject(&self, ticket: &NetworkTicket, reason: &str) -> RejectionEvent {
        let event = RejectionEvent {
            ticket: ticket.clone(),
            reason: reason.to_string(),
        };
        self.lock().emit(NetworkEvent::Rejected(event.clone()));
        event
    }

    /// Push an arbitrary event to subscribers.
    pub fn emit(&self, event: NetworkEvent) {
        self.lock().emit(event);
    }

    fn lock(&self) -> MutexGuard<'_, LocalState> {
        match self.shared.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn auto_delay(&self) -> Option<Duration> {
        self.shared
            .auto_delay_ms
            .lock()
            .ok()
            .and_then(|d| *d)
            .map(Duration::from_millis)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl VerificationNetwork for LocalNetwork {
    async fn register_key(
        &self,
        request: &KeyRegistrationRequest,
    ) -> Result<KeyFinalization, NetworkError> {
        self.shared.key_registrations.fetch_add(1, Ordering::SeqCst);

        let delay = self.shared.finalization_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.shared.reject_keys.load(Ordering::SeqCst) {
            return Err(NetworkError::Rejected("verifying key malformed".to_string()));
        }

        let mut material = request.image.clone();
        material.extend_from_slice(request.circuit_version.0.as_bytes());
        let block_hash = self.lock().next_block_hash();
        Ok(KeyFinalization {
            statement_hash: keccak_bytes(&material),
            block_hash: Some(block_hash),
        })
    }

    async fn submit_statement(
        &self,
        statement: &ProofStatement,
    ) -> Result<NetworkTicket, NetworkError> {
        self.shared.submissions.fetch_add(1, Ordering::SeqCst);

        if Self::take_failure(&self.shared.failing_submissions) {
            return Err(NetworkError::Transport("connection reset".to_string()));
        }
        if self.shared.refuse_submissions.load(Ordering::SeqCst) {
            return Err(NetworkError::Rejected("invalid proof".to_string()));
        }

        let ticket = {
            let mut state = self.lock();
            state.next_ticket += 1;
            let ticket = NetworkTicket(format!("local-{}", state.next_ticket));
            state.submissions.insert(
                ticket.clone(),
                LocalSubmission {
                    statement: Self::statement_hash(statement),
                    domain_id: statement.domain_id,
                },
            );
            ticket
        };

        if let Some(delay) = self.auto_delay() {
            let network = self.clone();
            let ticket = ticket.clone();
            let domain_id = statement.domain_id;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let aggregation_id = {
                    let mut state = network.lock();
                    state.next_auto_aggregation += 1;
                    state.next_auto_aggregation
                };
                if network.include(&ticket, aggregation_id).is_none() {
                    return;
                }
                tokio::time::sleep(delay).await;
                if let Err(e) =
                    network.publish_aggregation(domain_id, &group_digits(aggregation_id))
                {
                    tracing::warn!("Local auto-aggregation failed: {}", e);
                }
            });
        }

        Ok(ticket)
    }

    async fn subscribe(&self, filter: EventFilter) -> Result<EventStream, NetworkError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.lock().subscribers.push((filter, tx));
        Ok(rx)
    }

    async fn statement_path(&self, query: &PathQuery) -> Result<MerklePath, NetworkError> {
        self.shared.path_queries.fetch_add(1, Ordering::SeqCst);

        if Self::take_failure(&self.shared.failing_path_queries) {
            return Err(NetworkError::Transport("node unavailable".to_string()));
        }

        let statement = Hash32::from_hex(&query.statement)
            .map_err(|e| NetworkError::Protocol(format!("bad statement hash: {}", e)))?;

        let state = self.lock();
        let aggregate = state
            .aggregates
            .get(&(query.domain_id, query.aggregation_id))
            .ok_or_else(|| {
                NetworkError::Protocol(format!(
                    "aggregation {} of domain {} not published",
                    query.aggregation_id, query.domain_id
                ))
            })?;
        if aggregate.block_hash != query.block_hash {
            return Err(NetworkError::Protocol(format!(
                "aggregation {} not found in block {}",
                query.aggregation_id, query.block_hash
            )));
        }
        let index = aggregate
            .leaves
            .iter()
            .position(|leaf| *leaf == statement)
            .ok_or_else(|| {
                NetworkError::Protocol(format!(
                    "statement not part of aggregation {}",
                    query.aggregation_id
                ))
            })?;
        aggregate
            .tree
            .path(index)
            .ok_or_else(|| NetworkError::Protocol("leaf index out of range".to_string()))
    }
}

/// Format an integer with comma grouping (`1024` -> `"1,024"`), the way the
/// network displays IDs.
pub fn group_digits(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
