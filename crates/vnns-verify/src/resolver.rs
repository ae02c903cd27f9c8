// crates/vnns-verify/src/resolver.rs
//
// StatementPathResolver: fetches the Merkle inclusion path of an aggregated
// statement and attaches it to the record.
//
// A path is requested only once the tracker has confirmed aggregation; any
// earlier call fails locally with `ResolutionError::NotYetAvailable` and no
// network traffic. Aggregation state persists on the network, so transient
// fetch failures are retried and a failed resolution can be repeated later.

use std::sync::Arc;

use chrono::Utc;

use vnns_core::artifact::SubmissionId;
use vnns_core::crypto::Hash32;
use vnns_core::error::ResolutionError;
use vnns_core::merkle::MerklePath;
use vnns_core::submission::{SubmissionRecord, SubmissionState};
use vnns_core::traits::PathQuery;

use crate::retry::{Retry, RetryConfig};
use crate::session::NetworkSession;
use crate::tracker::AggregationTracker;

pub struct StatementPathResolver {
    session: Arc<NetworkSession>,
    tracker: Arc<AggregationTracker>,
    retry: RetryConfig,
}

impl StatementPathResolver {
    pub fn new(
        session: Arc<NetworkSession>,
        tracker: Arc<AggregationTracker>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            session,
            tracker,
            retry,
        }
    }

    /// Resolve and attach the statement path for an Aggregated submission.
    pub async fn resolve_path(&self, id: &SubmissionId) -> Result<SubmissionRecord, ResolutionError> {
        let record = self
            .tracker
            .get(id)
            .await
            .ok_or_else(|| ResolutionError::UnknownSubmission(id.to_string()))?;

        if record.state == SubmissionState::PathResolved {
            return Ok(record);
        }
        if record.state != SubmissionState::Aggregated {
            return Err(ResolutionError::NotYetAvailable(record.state));
        }

        let query = path_query(&record)?;
        let path = match self.fetch_path(&query).await {
            Ok(path) => path,
            Err(e) => {
                self.tracker
                    .record_error(id, format!("path resolution failed: {}", e))
                    .await;
                return Err(e);
            }
        };

        if !statement_matches(&path, &query.statement) || !path.verify() {
            tracing::warn!(
                "Statement path for {:?} does not verify against root {}",
                id,
                path.root.truncated()
            );
            self.tracker
                .record_error(id, ResolutionError::InvalidPath.to_string())
                .await;
            return Err(ResolutionError::InvalidPath);
        }

        tracing::info!(
            "Statement path resolved for {:?} (leaf {}/{}, root {})",
            id,
            path.leaf_index,
            path.number_of_leaves,
            path.root.truncated()
        );
        self.tracker.attach_path(id, path, Utc::now()).await
    }

    /// Fetch a path from the network, retrying transient failures.
    pub async fn fetch_path(&self, query: &PathQuery) -> Result<MerklePath, ResolutionError> {
        let network = self.session.network().map_err(ResolutionError::Network)?;
        Retry::new(self.retry.clone())
            .run_with_predicate(
                "statement_path",
                || async move {
                    network
                        .statement_path(query)
                        .await
                        .map_err(ResolutionError::Network)
                },
                ResolutionError::is_transient,
            )
            .await
            .into_result()
    }
}

/// Build the path query for an aggregated record. The receipt's block is
/// where the aggregate lives; the inclusion block is the fallback.
fn path_query(record: &SubmissionRecord) -> Result<PathQuery, ResolutionError> {
    let (Some(aggregation_id), Some(statement)) = (record.aggregation_id, &record.statement_hash)
    else {
        return Err(ResolutionError::NotYetAvailable(record.state));
    };
    let block_hash = record
        .aggregation_block_hash
        .clone()
        .or_else(|| record.block_hash.clone())
        .ok_or(ResolutionError::NotYetAvailable(record.state))?;
    Ok(PathQuery {
        block_hash,
        domain_id: record.domain_id,
        aggregation_id,
        statement: statement.clone(),
    })
}

fn statement_matches(path: &MerklePath, statement: &str) -> bool {
    Hash32::from_hex(statement)
        .map(|s| s == path.leaf)
        .unwrap_or(false)
}
