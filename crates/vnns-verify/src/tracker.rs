// crates/vnns-verify/src/tracker.rs
//
// AggregationTracker: correlates asynchronous network events with in-flight
// submissions and drives each SubmissionRecord through its state machine.
//
// Correlation rules:
// - Inclusion and rejection events are matched by network ticket.
// - Aggregation receipts are matched by exact (domain_id, aggregation_id)
//   after normalizing the receipt's grouped decimal ID. Nothing else matches.
// - Events for a ticket the tracker has not seen yet (the submit call has not
//   returned) are buffered and applied when the ticket is tracked. A receipt
//   matching a buffered inclusion is buffered behind it.
// - Any other receipt nobody is waiting for is logged and dropped.
//
// All state sits behind one async mutex that is held only while mutating;
// no network call happens under it. State changes are broadcast so callers
// can wait for a record to reach a state.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::MissedTickBehavior;

use vnns_core::artifact::{NetworkTicket, SubmissionId};
use vnns_core::error::{CorrelationTimeout, ResolutionError};
use vnns_core::event::{AggregationReceipt, InclusionEvent, NetworkEvent, RejectionEvent};
use vnns_core::merkle::MerklePath;
use vnns_core::submission::{SubmissionRecord, SubmissionState};
use vnns_core::traits::EventStream;

/// Upper bound on not-yet-tracked tickets with buffered events.
const BUFFER_CAPACITY: usize = 1024;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// How long a submission may wait for block inclusion.
    pub inclusion_timeout: Duration,
    /// How long an included submission may wait for its aggregation receipt.
    pub aggregation_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            inclusion_timeout: Duration::from_secs(300),
            aggregation_timeout: Duration::from_secs(1800),
        }
    }
}

/// A state change, broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerUpdate {
    pub submission_id: SubmissionId,
    pub from: SubmissionState,
    pub to: SubmissionState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
    Tracked,
    AlreadyTracked(SubmissionState),
}

#[derive(Default)]
struct TrackerInner {
    records: HashMap<SubmissionId, SubmissionRecord>,
    by_ticket: HashMap<NetworkTicket, SubmissionId>,
    /// Submissions waiting for a receipt, keyed by (domain_id, aggregation_id).
    pending: HashMap<(u32, u64), HashSet<SubmissionId>>,
    orphans: HashMap<NetworkTicket, Vec<NetworkEvent>>,
    orphan_order: VecDeque<NetworkTicket>,
}

impl TrackerInner {
    fn advance(
        record: &mut SubmissionRecord,
        to: SubmissionState,
        now: DateTime<Utc>,
        updates: &mut Vec<TrackerUpdate>,
    ) -> bool {
        let from = record.state;
        match record.transition(to, now) {
            Ok(()) => {
                tracing::debug!("Submission {:?}: {} -> {}", record.submission_id, from, to);
                updates.push(TrackerUpdate {
                    submission_id: record.submission_id,
                    from,
                    to,
                });
                true
            }
            Err(e) => {
                tracing::warn!("Submission {:?}: {}", record.submission_id, e);
                false
            }
        }
    }

    fn buffer_orphan(&mut self, ticket: NetworkTicket, event: NetworkEvent) {
        if !self.orphans.contains_key(&ticket) {
            if self.orphan_order.len() >= BUFFER_CAPACITY {
                if let Some(oldest) = self.orphan_order.pop_front() {
                    tracing::warn!("Dropping buffered events for unknown ticket {}", oldest);
                    self.orphans.remove(&oldest);
                }
            }
            self.orphan_order.push_back(ticket.clone());
        }
        tracing::debug!("Buffering {} event for untracked ticket {}", event.kind(), ticket);
        self.orphans.entry(ticket).or_default().push(event);
    }

    /// Untracked tickets whose buffered inclusion names `key`.
    fn orphans_included_in(&self, key: (u32, u64)) -> Vec<NetworkTicket> {
        self.orphans
            .iter()
            .filter(|(_, events)| {
                events.iter().any(|event| {
                    matches!(
                        event,
                        NetworkEvent::IncludedInBlock(e)
                            if (e.domain_id, e.aggregation_id) == key
                    )
                })
            })
            .map(|(ticket, _)| ticket.clone())
            .collect()
    }

    fn apply_inclusion(
        &mut self,
        event: InclusionEvent,
        now: DateTime<Utc>,
        updates: &mut Vec<TrackerUpdate>,
    ) -> Option<SubmissionId> {
        let Some(id) = self.by_ticket.get(&event.ticket).copied() else {
            let ticket = event.ticket.clone();
            self.buffer_orphan(ticket, NetworkEvent::IncludedInBlock(event));
            return None;
        };
        let record = self.records.get_mut(&id)?;

        if record.waiting_in() != SubmissionState::Submitted {
            tracing::debug!(
                "Ignoring duplicate inclusion for {:?} (state {})",
                id,
                record.state
            );
            return None;
        }
        if event.domain_id != record.domain_id {
            tracing::warn!(
                "Inclusion for {:?} names domain {}, submission targets domain {}",
                id,
                event.domain_id,
                record.domain_id
            );
            return None;
        }

        record.block_hash = Some(event.block_hash.clone());
        record.statement_hash = Some(event.statement.clone());
        record.aggregation_id = Some(event.aggregation_id);
        if !Self::advance(record, SubmissionState::IncludedInBlock, now, updates) {
            return None;
        }
        Self::advance(record, SubmissionState::AggregationPending, now, updates);

        tracing::info!(
            "Submission {:?} included in block {} (aggregation {})",
            id,
            vnns_core::crypto::truncate_hash(&event.block_hash),
            event.aggregation_id
        );

        let key = (event.domain_id, event.aggregation_id);
        self.pending.entry(key).or_default().insert(id);
        Some(id)
    }

    fn apply_receipt(
        &mut self,
        key: (u32, u64),
        receipt: &AggregationReceipt,
        now: DateTime<Utc>,
        updates: &mut Vec<TrackerUpdate>,
    ) -> Vec<SubmissionId> {
        let Some(waiting) = self.pending.remove(&key) else {
            return Vec::new();
        };

        let mut aggregated = Vec::new();
        for id in waiting {
            let Some(record) = self.records.get_mut(&id) else {
                continue;
            };
            if record.waiting_in() != SubmissionState::AggregationPending
                || record.aggregation_id != Some(key.1)
            {
                continue;
            }
            record.aggregation_block_hash = Some(receipt.block_hash.clone());
            if Self::advance(record, SubmissionState::Aggregated, now, updates) {
                aggregated.push(id);
            }
        }
        aggregated
    }

    fn apply_rejection(
        &mut self,
        event: RejectionEvent,
        now: DateTime<Utc>,
        updates: &mut Vec<TrackerUpdate>,
    ) -> Option<SubmissionId> {
        let Some(id) = self.by_ticket.get(&event.ticket).copied() else {
            let ticket = event.ticket.clone();
            self.buffer_orphan(ticket, NetworkEvent::Rejected(event));
            return None;
        };
        let record = self.records.get_mut(&id)?;
        if !record.can_transition(SubmissionState::Failed) {
            tracing::debug!("Ignoring rejection for {:?} in state {}", id, record.state);
            return None;
        }

        tracing::warn!("Submission {:?} rejected: {}", id, event.reason);
        record.last_error = Some(event.reason);
        let key = record.aggregation_id.map(|agg| (record.domain_id, agg));
        Self::advance(record, SubmissionState::Failed, now, updates);
        if let Some(key) = key {
            self.unpend(key, &id);
        }
        Some(id)
    }

    fn forget(&mut self, id: &SubmissionId) -> Option<SubmissionRecord> {
        let record = self.records.remove(id)?;
        self.by_ticket.remove(&record.ticket);
        if let Some(agg) = record.aggregation_id {
            self.unpend((record.domain_id, agg), id);
        }
        Some(record)
    }

    fn unpend(&mut self, key: (u32, u64), id: &SubmissionId) {
        if let Some(set) = self.pending.get_mut(&key) {
            set.remove(id);
            if set.is_empty() {
                self.pending.remove(&key);
            }
        }
    }

    fn apply(
        &mut self,
        event: NetworkEvent,
        now: DateTime<Utc>,
        updates: &mut Vec<TrackerUpdate>,
    ) -> Vec<SubmissionId> {
        match event {
            NetworkEvent::IncludedInBlock(e) => {
                self.apply_inclusion(e, now, updates).into_iter().collect()
            }
            NetworkEvent::Rejected(e) => self.apply_rejection(e, now, updates).into_iter().collect(),
            NetworkEvent::AggregationReceipt(receipt) => {
                let key = match receipt.normalized() {
                    Ok(key) => key,
                    Err(e) => {
                        tracing::warn!("Discarding malformed aggregation receipt: {}", e);
                        return Vec::new();
                    }
                };
                let held = self.orphans_included_in(key);
                let any_held = !held.is_empty();
                for ticket in held {
                    self.buffer_orphan(ticket, NetworkEvent::AggregationReceipt(receipt.clone()));
                }
                if !self.pending.contains_key(&key) {
                    if !any_held {
                        tracing::debug!(
                            "No submission waiting for aggregation {} of domain {}, ignoring receipt",
                            key.1,
                            key.0
                        );
                    }
                    return Vec::new();
                }
                let aggregated = self.apply_receipt(key, &receipt, now, updates);
                tracing::info!(
                    "Aggregation {} of domain {} confirmed for {} submission(s)",
                    key.1,
                    key.0,
                    aggregated.len()
                );
                aggregated
            }
        }
    }
}

/// Tracks in-flight submissions until they reach a terminal state and are evicted.
pub struct AggregationTracker {
    config: TrackerConfig,
    inner: Mutex<TrackerInner>,
    updates: broadcast::Sender<TrackerUpdate>,
}

impl AggregationTracker {
    pub fn new(config: TrackerConfig) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            config,
            inner: Mutex::new(TrackerInner::default()),
            updates,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<TrackerUpdate> {
        self.updates.subscribe()
    }

    fn publish(&self, updates: Vec<TrackerUpdate>) {
        for update in updates {
            // No receivers is fine.
            let _ = self.updates.send(update);
        }
    }

    /// Start tracking a freshly submitted record. Buffered events for its
    /// ticket are applied immediately.
    pub async fn track(&self, record: SubmissionRecord) -> TrackOutcome {
        let mut updates = Vec::new();
        let outcome = {
            let mut inner = self.inner.lock().await;
            if let Some(existing) = inner.records.get(&record.submission_id) {
                return TrackOutcome::AlreadyTracked(existing.state);
            }

            let id = record.submission_id;
            let ticket = record.ticket.clone();
            tracing::info!("Tracking submission {:?} (ticket {})", id, ticket);
            inner.by_ticket.insert(ticket.clone(), id);
            inner.records.insert(id, record);

            if let Some(buffered) = inner.orphans.remove(&ticket) {
                inner.orphan_order.retain(|t| t != &ticket);
                for event in buffered {
                    inner.apply(event, Utc::now(), &mut updates);
                }
            }
            TrackOutcome::Tracked
        };
        self.publish(updates);
        outcome
    }

    pub async fn get(&self, id: &SubmissionId) -> Option<SubmissionRecord> {
        self.inner.lock().await.records.get(id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<SubmissionRecord> {
        self.inner.lock().await.records.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn on_inclusion(&self, event: InclusionEvent, now: DateTime<Utc>) -> Option<SubmissionId> {
        let mut updates = Vec::new();
        let id = self.inner.lock().await.apply_inclusion(event, now, &mut updates);
        self.publish(updates);
        id
    }

    /// Apply a receipt; returns the submissions it moved to Aggregated.
    pub async fn on_aggregation_receipt(
        &self,
        receipt: AggregationReceipt,
        now: DateTime<Utc>,
    ) -> Vec<SubmissionId> {
        self.dispatch(NetworkEvent::AggregationReceipt(receipt), now).await
    }

    pub async fn on_rejection(&self, event: RejectionEvent, now: DateTime<Utc>) -> Option<SubmissionId> {
        let mut updates = Vec::new();
        let id = self.inner.lock().await.apply_rejection(event, now, &mut updates);
        self.publish(updates);
        id
    }

    /// Apply any network event; returns the submissions it advanced.
    pub async fn dispatch(&self, event: NetworkEvent, now: DateTime<Utc>) -> Vec<SubmissionId> {
        let mut updates = Vec::new();
        let advanced = self.inner.lock().await.apply(event, now, &mut updates);
        self.publish(updates);
        advanced
    }

    /// Move every record past its deadline to TimedOut. A record times out
    /// at most once; once recovered it has no further deadline.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Vec<CorrelationTimeout> {
        let mut updates = Vec::new();
        let mut expired = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            for record in inner.records.values_mut() {
                if record.timed_out_from.is_some() {
                    continue;
                }
                let limit = match record.state {
                    SubmissionState::Submitted => self.config.inclusion_timeout,
                    SubmissionState::AggregationPending => self.config.aggregation_timeout,
                    _ => continue,
                };
                let overdue = (now - record.state_entered_at)
                    .to_std()
                    .map(|elapsed| elapsed >= limit)
                    .unwrap_or(false);
                if !overdue {
                    continue;
                }

                let timeout = CorrelationTimeout {
                    submission_id: record.submission_id.to_string(),
                    waiting_in: record.state,
                    after_secs: limit.as_secs(),
                };
                tracing::warn!("{}", timeout);
                record.last_error = Some(timeout.to_string());
                if TrackerInner::advance(record, SubmissionState::TimedOut, now, &mut updates) {
                    expired.push(timeout);
                }
            }
        }
        self.publish(updates);
        expired
    }

    /// Attach a verified statement path to an Aggregated record.
    pub async fn attach_path(
        &self,
        id: &SubmissionId,
        path: MerklePath,
        now: DateTime<Utc>,
    ) -> Result<SubmissionRecord, ResolutionError> {
        let mut updates = Vec::new();
        let result = {
            let mut inner = self.inner.lock().await;
            let record = inner
                .records
                .get_mut(id)
                .ok_or_else(|| ResolutionError::UnknownSubmission(id.to_string()))?;
            match record.state {
                SubmissionState::PathResolved if record.statement_path.as_ref() == Some(&path) => {
                    Ok(record.clone())
                }
                SubmissionState::Aggregated => {
                    record.statement_path = Some(path);
                    record.last_error = None;
                    TrackerInner::advance(record, SubmissionState::PathResolved, now, &mut updates);
                    Ok(record.clone())
                }
                other => Err(ResolutionError::NotYetAvailable(other)),
            }
        };
        self.publish(updates);
        result
    }

    /// Note a non-fatal error against a record without changing its state.
    pub async fn record_error(&self, id: &SubmissionId, error: impl Into<String>) {
        if let Some(record) = self.inner.lock().await.records.get_mut(id) {
            record.last_error = Some(error.into());
        }
    }

    /// Stop tracking a record that is still waiting on the network (a timed
    /// out one included). Local only: its state is left as it was, nothing
    /// is broadcast, and the network may still finalize the submission.
    /// Settled records are removed with `evict` instead.
    pub async fn cancel(&self, id: &SubmissionId, reason: &str) -> Option<SubmissionRecord> {
        let mut inner = self.inner.lock().await;
        let settled = inner
            .records
            .get(id)
            .map(|r| r.state.is_terminal() && !r.state.is_recoverable())?;
        if settled {
            tracing::debug!("Not cancelling settled submission {:?}", id);
            return None;
        }
        let record = inner.forget(id)?;
        tracing::info!(
            "Stopped tracking submission {:?} in state {}: {}",
            id,
            record.state,
            reason
        );
        Some(record)
    }

    /// Drop a terminal record from memory once it has been persisted.
    pub async fn evict(&self, id: &SubmissionId) -> Option<SubmissionRecord> {
        let mut inner = self.inner.lock().await;
        let terminal = inner.records.get(id).map(|r| r.state.is_terminal())?;
        if !terminal {
            tracing::warn!("Refusing to evict in-flight submission {:?}", id);
            return None;
        }
        let record = inner.forget(id)?;
        tracing::debug!("Evicted submission {:?} ({})", id, record.state);
        Some(record)
    }

    /// Wait until the record's state satisfies `done`. Returns the record at
    /// that point, or `None` if it is unknown or `timeout` elapses first.
    pub async fn wait_for<P>(
        &self,
        id: &SubmissionId,
        done: P,
        timeout: Duration,
    ) -> Option<SubmissionRecord>
    where
        P: Fn(SubmissionState) -> bool,
    {
        let mut updates = self.updates.subscribe();
        let wait = async {
            loop {
                match self.get(id).await {
                    None => return None,
                    Some(record) if done(record.state) => return Some(record),
                    Some(_) => {}
                }
                loop {
                    match updates.recv().await {
                        Ok(update) if update.submission_id == *id => break,
                        Ok(_) => continue,
                        Err(RecvError::Lagged(_)) => break,
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    pub async fn wait_terminal(&self, id: &SubmissionId, timeout: Duration) -> Option<SubmissionRecord> {
        self.wait_for(id, |state| state.is_terminal(), timeout).await
    }

    /// Event loop: applies events from `events` and expires overdue records
    /// every `sweep_interval` until `shutdown` flips or the stream ends.
    pub async fn run(
        self: Arc<Self>,
        mut events: EventStream,
        mut shutdown: watch::Receiver<bool>,
        sweep_interval: Duration,
    ) {
        tracing::info!("Aggregation tracker started (sweep every {:?})", sweep_interval);
        let mut sweep = tokio::time::interval(sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_event = events.recv() => {
                    match maybe_event {
                        Some(event) => {
                            self.dispatch(event, Utc::now()).await;
                        }
                        None => {
                            tracing::warn!("Network event stream closed");
                            break;
                        }
                    }
                }
                _ = sweep.tick() => {
                    self.expire_overdue(Utc::now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Aggregation tracker received shutdown signal");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use vnns_core::artifact::ProofStatement;
    use vnns_core::crypto::hash_bytes;
    use vnns_core::merkle::MerkleTree;

    fn record(tag: u8, ticket: &str, now: DateTime<Utc>) -> SubmissionRecord {
        let statement = ProofStatement {
            proof: vec![tag],
            verifying_key_hash: hash_bytes(b"vk"),
            public_inputs: vec![tag],
            domain_id: 0,
        };
        SubmissionRecord::new(statement, NetworkTicket(ticket.to_string()), now)
    }

    fn inclusion(ticket: &str, aggregation_id: u64) -> InclusionEvent {
        InclusionEvent {
            ticket: NetworkTicket(ticket.to_string()),
            block_hash: "0xblock".to_string(),
            statement: format!("0x{}", hash_bytes(ticket.as_bytes()).to_hex()),
            aggregation_id,
            domain_id: 0,
        }
    }

    fn receipt(domain: &str, aggregation_id: &str) -> AggregationReceipt {
        AggregationReceipt {
            block_hash: "0xaggblock".to_string(),
            domain_id: domain.to_string(),
            aggregation_id: aggregation_id.to_string(),
        }
    }

    fn tracker() -> AggregationTracker {
        AggregationTracker::new(TrackerConfig {
            inclusion_timeout: Duration::from_secs(60),
            aggregation_timeout: Duration::from_secs(600),
        })
    }

    #[tokio::test]
    async fn test_receipt_with_grouped_id_matches() {
        let tracker = tracker();
        let now = Utc::now();
        let r = record(1, "t-1", now);
        let id = r.submission_id;
        tracker.track(r).await;

        assert_eq!(tracker.on_inclusion(inclusion("t-1", 42), now).await, Some(id));
        assert_eq!(
            tracker.get(&id).await.unwrap().state,
            SubmissionState::AggregationPending
        );

        let advanced = tracker.on_aggregation_receipt(receipt("0", "4,2"), now).await;
        assert_eq!(advanced, vec![id]);
        let rec = tracker.get(&id).await.unwrap();
        assert_eq!(rec.state, SubmissionState::Aggregated);
        assert_eq!(rec.aggregation_block_hash.as_deref(), Some("0xaggblock"));
    }

    #[tokio::test]
    async fn test_only_exact_aggregation_id_matches() {
        let tracker = tracker();
        let now = Utc::now();
        let r = record(1, "t-1", now);
        let id = r.submission_id;
        tracker.track(r).await;
        tracker.on_inclusion(inclusion("t-1", 42), now).await;

        for other in ["4", "420", "41", "43"] {
            assert!(tracker.on_aggregation_receipt(receipt("0", other), now).await.is_empty());
        }
        // Same aggregation ID in another domain.
        assert!(tracker.on_aggregation_receipt(receipt("1", "42"), now).await.is_empty());
        assert_eq!(
            tracker.get(&id).await.unwrap().state,
            SubmissionState::AggregationPending
        );
    }

    #[tokio::test]
    async fn test_duplicate_inclusion_is_noop() {
        let tracker = tracker();
        let now = Utc::now();
        let r = record(1, "t-1", now);
        let id = r.submission_id;
        tracker.track(r).await;

        assert!(tracker.on_inclusion(inclusion("t-1", 42), now).await.is_some());
        let before = tracker.get(&id).await.unwrap();
        assert!(tracker.on_inclusion(inclusion("t-1", 42), now).await.is_none());
        assert!(tracker.on_inclusion(inclusion("t-1", 7), now).await.is_none());
        assert_eq!(tracker.get(&id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_one_receipt_completes_every_matching_submission() {
        let tracker = tracker();
        let now = Utc::now();
        let mut ids = Vec::new();
        for (tag, ticket) in [(1, "t-1"), (2, "t-2"), (3, "t-3")] {
            let r = record(tag, ticket, now);
            ids.push(r.submission_id);
            tracker.track(r).await;
        }
        tracker.on_inclusion(inclusion("t-1", 5), now).await;
        tracker.on_inclusion(inclusion("t-2", 5), now).await;
        tracker.on_inclusion(inclusion("t-3", 6), now).await;

        let mut advanced = tracker.on_aggregation_receipt(receipt("0", "5"), now).await;
        advanced.sort();
        let mut expected = vec![ids[0], ids[1]];
        expected.sort();
        assert_eq!(advanced, expected);
        assert_eq!(
            tracker.get(&ids[2]).await.unwrap().state,
            SubmissionState::AggregationPending
        );
    }

    #[tokio::test]
    async fn test_timeout_then_late_receipt_recovers() {
        let tracker = tracker();
        let start = Utc::now();
        let r = record(1, "t-1", start);
        let id = r.submission_id;
        tracker.track(r).await;
        tracker.on_inclusion(inclusion("t-1", 42), start).await;

        assert!(tracker.expire_overdue(start + ChronoDuration::seconds(10)).await.is_empty());
        let expired = tracker.expire_overdue(start + ChronoDuration::seconds(601)).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].waiting_in, SubmissionState::AggregationPending);

        let timed_out = tracker.get(&id).await.unwrap();
        assert_eq!(timed_out.state, SubmissionState::TimedOut);
        assert!(timed_out.last_error.is_some());

        let late = start + ChronoDuration::seconds(900);
        assert_eq!(tracker.on_aggregation_receipt(receipt("0", "42"), late).await, vec![id]);
        assert_eq!(tracker.get(&id).await.unwrap().state, SubmissionState::Aggregated);

        // No second deadline after recovery.
        assert!(tracker
            .expire_overdue(late + ChronoDuration::days(1))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_inclusion_timeout() {
        let tracker = tracker();
        let start = Utc::now();
        let r = record(1, "t-1", start);
        let id = r.submission_id;
        tracker.track(r).await;

        let expired = tracker.expire_overdue(start + ChronoDuration::seconds(61)).await;
        assert_eq!(expired[0].waiting_in, SubmissionState::Submitted);

        // Late inclusion resumes progress.
        assert_eq!(tracker.on_inclusion(inclusion("t-1", 1), Utc::now()).await, Some(id));
        assert_eq!(
            tracker.get(&id).await.unwrap().state,
            SubmissionState::AggregationPending
        );
    }

    #[tokio::test]
    async fn test_rejection_fails_record() {
        let tracker = tracker();
        let now = Utc::now();
        let r = record(1, "t-1", now);
        let id = r.submission_id;
        tracker.track(r).await;

        let rejected = tracker
            .on_rejection(
                RejectionEvent {
                    ticket: NetworkTicket("t-1".to_string()),
                    reason: "invalid proof".to_string(),
                },
                now,
            )
            .await;
        assert_eq!(rejected, Some(id));
        let rec = tracker.get(&id).await.unwrap();
        assert_eq!(rec.state, SubmissionState::Failed);
        assert_eq!(rec.last_error.as_deref(), Some("invalid proof"));

        // Failed is final.
        assert!(tracker.on_inclusion(inclusion("t-1", 1), now).await.is_none());
        assert_eq!(tracker.get(&id).await.unwrap().state, SubmissionState::Failed);
    }

    #[tokio::test]
    async fn test_events_before_track_are_buffered() {
        let tracker = tracker();
        let now = Utc::now();
        assert!(tracker.on_inclusion(inclusion("t-1", 42), now).await.is_none());
        assert!(tracker.on_aggregation_receipt(receipt("0", "42"), now).await.is_empty());

        let r = record(1, "t-1", now);
        let id = r.submission_id;
        assert_eq!(tracker.track(r).await, TrackOutcome::Tracked);
        assert_eq!(tracker.get(&id).await.unwrap().state, SubmissionState::Aggregated);
    }

    #[tokio::test]
    async fn test_receipt_nobody_waits_for_is_dropped() {
        let tracker = tracker();
        let now = Utc::now();
        assert!(tracker.on_aggregation_receipt(receipt("0", "42"), now).await.is_empty());

        // A live inclusion for that aggregation afterwards still waits for
        // its own receipt.
        let r = record(1, "t-1", now);
        let id = r.submission_id;
        tracker.track(r).await;
        assert_eq!(tracker.on_inclusion(inclusion("t-1", 42), now).await, Some(id));
        assert_eq!(
            tracker.get(&id).await.unwrap().state,
            SubmissionState::AggregationPending
        );

        assert_eq!(tracker.on_aggregation_receipt(receipt("0", "42"), now).await, vec![id]);
        assert_eq!(tracker.get(&id).await.unwrap().state, SubmissionState::Aggregated);
    }

    #[tokio::test]
    async fn test_buffered_receipt_only_follows_its_own_inclusion() {
        let tracker = tracker();
        let now = Utc::now();
        assert!(tracker.on_inclusion(inclusion("t-1", 7), now).await.is_none());
        // Matches nothing buffered: dropped.
        assert!(tracker.on_aggregation_receipt(receipt("0", "42"), now).await.is_empty());

        let r = record(1, "t-1", now);
        let id = r.submission_id;
        tracker.track(r).await;
        assert_eq!(
            tracker.get(&id).await.unwrap().state,
            SubmissionState::AggregationPending
        );
    }

    #[tokio::test]
    async fn test_track_twice_reports_existing() {
        let tracker = tracker();
        let now = Utc::now();
        let r = record(1, "t-1", now);
        assert_eq!(tracker.track(r.clone()).await, TrackOutcome::Tracked);
        assert_eq!(
            tracker.track(r).await,
            TrackOutcome::AlreadyTracked(SubmissionState::Submitted)
        );
        assert_eq!(tracker.len().await, 1);
    }

    #[tokio::test]
    async fn test_attach_path_requires_aggregation() {
        let tracker = tracker();
        let now = Utc::now();
        let r = record(1, "t-1", now);
        let id = r.submission_id;
        tracker.track(r).await;

        let tree = MerkleTree::from_leaves(vec![hash_bytes(b"t-1")]);
        let path = tree.path(0).unwrap();
        assert!(matches!(
            tracker.attach_path(&id, path.clone(), now).await,
            Err(ResolutionError::NotYetAvailable(SubmissionState::Submitted))
        ));

        tracker.on_inclusion(inclusion("t-1", 3), now).await;
        tracker.on_aggregation_receipt(receipt("0", "3"), now).await;
        let resolved = tracker.attach_path(&id, path.clone(), now).await.unwrap();
        assert_eq!(resolved.state, SubmissionState::PathResolved);
        // Idempotent for the same path.
        assert!(tracker.attach_path(&id, path, now).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_only_stops_local_tracking() {
        let tracker = tracker();
        let now = Utc::now();
        let r = record(1, "t-1", now);
        let id = r.submission_id;
        tracker.track(r).await;
        tracker.on_inclusion(inclusion("t-1", 42), now).await;
        let mut updates = tracker.subscribe_updates();

        // In flight: not evictable, but cancellable.
        assert!(tracker.evict(&id).await.is_none());
        let cancelled = tracker.cancel(&id, "operator abort").await.unwrap();
        assert_eq!(cancelled.state, SubmissionState::AggregationPending);
        assert_eq!(cancelled.history.len(), 2);
        assert!(tracker.get(&id).await.is_none());
        assert!(tracker.is_empty().await);
        assert!(tracker.cancel(&id, "again").await.is_none());
        assert!(updates.try_recv().is_err());

        // Later events for it no longer match anything.
        assert!(tracker.on_aggregation_receipt(receipt("0", "42"), now).await.is_empty());
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_settled_records_are_evicted_not_cancelled() {
        let tracker = tracker();
        let now = Utc::now();
        let r = record(1, "t-1", now);
        let id = r.submission_id;
        tracker.track(r).await;
        tracker
            .on_rejection(
                RejectionEvent {
                    ticket: NetworkTicket("t-1".to_string()),
                    reason: "invalid proof".to_string(),
                },
                now,
            )
            .await;

        assert!(tracker.cancel(&id, "operator abort").await.is_none());
        let evicted = tracker.evict(&id).await.unwrap();
        assert_eq!(evicted.state, SubmissionState::Failed);
        assert!(tracker.is_empty().await);
    }

    #[tokio::test]
    async fn test_timed_out_record_can_be_cancelled() {
        let tracker = tracker();
        let start = Utc::now();
        let r = record(1, "t-1", start);
        let id = r.submission_id;
        tracker.track(r).await;
        tracker.expire_overdue(start + ChronoDuration::seconds(61)).await;

        let cancelled = tracker.cancel(&id, "giving up").await.unwrap();
        assert_eq!(cancelled.state, SubmissionState::TimedOut);
        assert!(tracker.is_empty().await);
    }

    #[tokio::test]
    async fn test_wait_for_sees_later_update() {
        let tracker = Arc::new(tracker());
        let now = Utc::now();
        let r = record(1, "t-1", now);
        let id = r.submission_id;
        tracker.track(r).await;

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker
                    .wait_for(&id, |s| s == SubmissionState::Aggregated, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        tracker.on_inclusion(inclusion("t-1", 8), now).await;
        tracker.on_aggregation_receipt(receipt("0", "8"), now).await;

        let rec = waiter.await.unwrap().unwrap();
        assert_eq!(rec.state, SubmissionState::Aggregated);

        assert!(tracker
            .wait_terminal(&id, Duration::from_millis(20))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_run_loop_applies_stream_and_stops() {
        let tracker = Arc::new(tracker());
        let now = Utc::now();
        let r = record(1, "t-1", now);
        let id = r.submission_id;
        tracker.track(r).await;

        let (tx, rx) = tokio::sync::mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(tracker.clone().run(rx, shutdown_rx, Duration::from_millis(5)));

        tx.send(NetworkEvent::IncludedInBlock(inclusion("t-1", 42))).await.unwrap();
        tx.send(NetworkEvent::AggregationReceipt(receipt("0", "4,2"))).await.unwrap();

        let rec = tracker
            .wait_for(&id, |s| s == SubmissionState::Aggregated, Duration::from_secs(5))
            .await;
        assert!(rec.is_some());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
