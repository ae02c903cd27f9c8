// crates/vnns-store/src/export.rs
//
// JSON exports for downstream verifiers:
//   - `vkey.json`: the finalized verifying-key hash.
//   - `aggregation-<submission>.json`: statement path plus the domain and
//     aggregation IDs needed to check it against the on-chain aggregate.
//
// Files are written to a temporary sibling and renamed into place, so a
// reader never observes a partial document.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use vnns_core::artifact::RegisteredKey;
use vnns_core::crypto::{encode_hex_prefixed, Hash32};
use vnns_core::error::StorageError;
use vnns_core::merkle::MerklePath;
use vnns_core::submission::PersistedRecord;

#[derive(Debug, Serialize)]
struct VkeyDocument<'a> {
    hash: String,
    #[serde(rename = "circuitVersion")]
    circuit_version: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AggregationDocument<'a> {
    submission_id: String,
    domain_id: u32,
    aggregation_id: u64,
    block_hash: Option<&'a str>,
    statement: &'a str,
    receipt: &'a MerklePath,
}

/// Serialize `value` to `path` through a temp file and rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn prefixed(hash: &Hash32) -> String {
    encode_hex_prefixed(hash.as_bytes())
}

/// Write `{dir}/vkey.json` for a finalized key.
pub fn export_vkey(dir: &Path, key: &RegisteredKey) -> Result<PathBuf, StorageError> {
    let path = dir.join("vkey.json");
    write_json_atomic(
        &path,
        &VkeyDocument {
            hash: prefixed(&key.key_hash),
            circuit_version: &key.circuit_version.0,
        },
    )?;
    tracing::info!("Exported verifying key to {}", path.display());
    Ok(path)
}

/// Write `{dir}/aggregation-<submission>.json` for a PathResolved record.
pub fn export_aggregation(dir: &Path, record: &PersistedRecord) -> Result<PathBuf, StorageError> {
    let id = record.submission_id.to_string();
    let (Some(path), Some(aggregation_id), Some(statement)) = (
        record.statement_path.as_ref(),
        record.aggregation_id,
        record.statement_hash.as_deref(),
    ) else {
        return Err(StorageError::NotTerminal(format!(
            "{} has no resolved statement path",
            id
        )));
    };

    let file = dir.join(format!("aggregation-{}.json", &id[..16]));
    write_json_atomic(
        &file,
        &AggregationDocument {
            submission_id: id.clone(),
            domain_id: record.domain_id,
            aggregation_id,
            block_hash: record
                .aggregation_block_hash
                .as_deref()
                .or(record.block_hash.as_deref()),
            statement,
            receipt: path,
        },
    )?;
    tracing::info!("Exported aggregation proof to {}", file.display());
    Ok(file)
}
