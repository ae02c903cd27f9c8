// crates/vnns-store/src/lib.rs
//
// vnns-store: durable storage for the attestation pipeline.
//
// Provides the RocksDB-backed record store (terminal submission records and
// the key registration cache) and atomic JSON exports of verifying keys and
// aggregation proofs.

pub mod export;
pub mod rocks;

// Re-export key types for ergonomic access from downstream crates.
pub use export::{export_aggregation, export_vkey, write_json_atomic};
pub use rocks::RocksRecordStore;
