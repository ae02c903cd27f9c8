// crates/vnns-daemon/src/main.rs
//
// Binary entrypoint for the VNNS attestation daemon.
//
// Parses CLI arguments, loads configuration, initializes tracing, connects
// to the verification network (in-process or HTTP relay), and runs one
// proof artifact through the attestation pipeline.

mod config;
mod pipeline;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use config::DaemonConfig;
use pipeline::{AttestationPipeline, PipelineSettings};
use uuid::Uuid;

use vnns_core::artifact::{CircuitVersion, ProofArtifact};
use vnns_core::chain::ProofChain;
use vnns_core::traits::VerificationNetwork;
use vnns_store::RocksRecordStore;
use vnns_verify::{HttpNetwork, LocalNetwork};

const ACCOUNT_SEED_VAR: &str = "VNNS_ACCOUNT_SEED";

/// VNNS attestation daemon: submits a similarity-search proof for
/// verification and records its aggregation proof.
#[derive(Parser, Debug)]
#[command(name = "vnns-daemon", version = "0.1.0", about = "Verifiable vector search attestation daemon")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "~/.vnns/config.toml")]
    config: String,

    /// Proof artifact JSON written by the prover host.
    #[arg(long)]
    proof: String,

    /// Proof chain JSON the artifact closes (checked before submission).
    #[arg(long)]
    chain: Option<String>,

    /// Aggregation domain, overriding the config file.
    #[arg(long)]
    domain_id: Option<u32>,

    /// Use the in-process network instead of the relay.
    #[arg(long)]
    local: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration from TOML file, falling back to defaults if the file
    // is not found. The outcome is logged once tracing is up.
    let config_path = expand_tilde(&args.config);
    let loaded = DaemonConfig::load(&config_path);
    let mut daemon_config = match &loaded {
        Ok(cfg) => cfg.clone(),
        Err(_) => DaemonConfig::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&daemon_config.log_level)),
        )
        .init();

    match loaded {
        Ok(_) => tracing::info!("Loaded configuration from {}", config_path),
        Err(e) => tracing::warn!(
            "Could not load config from {}: {}. Using defaults.",
            config_path,
            e
        ),
    }

    // CLI flags override the config file values.
    if let Some(domain_id) = args.domain_id {
        daemon_config.network.domain_id = domain_id;
    }
    if args.local {
        daemon_config.network.mode = "local".to_string();
    }

    let run_id = Uuid::now_v7();
    tracing::info!("Attestation run {}", run_id);

    let artifact = ProofArtifact::load(&PathBuf::from(expand_tilde(&args.proof)))?;
    tracing::info!(
        "Loaded proof artifact {} ({} proof bytes)",
        artifact.artifact_hash().truncated(),
        artifact.proof.len()
    );

    let chain = match &args.chain {
        Some(path) => {
            let json = std::fs::read_to_string(expand_tilde(path))?;
            let chain = ProofChain::from_json(&json)?;
            let summary = chain.summary();
            tracing::info!(
                "Proof chain: {} steps, {} vectors, final commitment {} ({} ms)",
                summary.step_count,
                summary.total_batch_size,
                summary.final_commitment.truncated(),
                summary.processing_duration_ms
            );
            Some(chain)
        }
        None => None,
    };

    let network = build_network(&daemon_config)?;

    let data_dir = expand_tilde(&daemon_config.data_dir);
    let db_path = format!("{}/rocksdb", data_dir);
    let store = RocksRecordStore::open(&db_path)?;
    tracing::info!("RocksDB opened at {}", db_path);

    let settings = PipelineSettings {
        domain_id: daemon_config.network.domain_id,
        circuit_version: CircuitVersion::new(daemon_config.network.circuit_version.clone()),
        explorer_url: daemon_config.network.explorer_url.clone(),
        export_dir: PathBuf::from(expand_tilde(&daemon_config.export_dir)),
        tracker: daemon_config.tracker.tracker_config(),
        sweep_interval: daemon_config.tracker.sweep_interval(),
        retry: daemon_config.retry.clone(),
        registration_timeout: Duration::from_secs(daemon_config.network.registration_timeout_secs),
    };

    let mut pipeline = AttestationPipeline::new(network, Arc::new(store), settings);
    pipeline.start().await?;

    let result = pipeline.attest(&artifact, chain.as_ref()).await;
    pipeline.shutdown().await;

    match result {
        Ok(outcome) => {
            tracing::info!(
                "Attested submission {:?} ({}): aggregation {:?}",
                outcome.submission_id,
                outcome.record.terminal_state,
                outcome.record.aggregation_id
            );
            tracing::info!("Verify at {}", outcome.explorer_link);
            tracing::info!("Verifying key exported to {}", outcome.vkey_export.display());
            if let Some(path) = &outcome.aggregation_export {
                tracing::info!("Aggregation proof written to {}", path.display());
            }
            println!("{}", serde_json::to_string_pretty(&outcome.record)?);
            Ok(())
        }
        Err(e) => {
            tracing::error!("Attestation failed: {}", e);
            Err(e.into())
        }
    }
}

fn build_network(
    config: &DaemonConfig,
) -> Result<Arc<dyn VerificationNetwork>, Box<dyn std::error::Error>> {
    match config.network.mode.as_str() {
        "local" => {
            tracing::info!("Using in-process verification network");
            Ok(Arc::new(
                LocalNetwork::new().with_auto_aggregation(Duration::from_millis(200)),
            ))
        }
        "http" => {
            let mut relay = HttpNetwork::new(
                &config.network.relay_url,
                Duration::from_secs(config.network.request_timeout_secs),
                Duration::from_millis(config.network.poll_interval_ms),
            )?;
            match std::env::var(ACCOUNT_SEED_VAR) {
                Ok(seed) if !seed.trim().is_empty() => {
                    relay = relay.with_account_seed(seed.trim());
                }
                _ => tracing::warn!("{} not set; relay requests are anonymous", ACCOUNT_SEED_VAR),
            }
            tracing::info!("Using verification relay at {}", relay.base_url);
            Ok(Arc::new(relay))
        }
        other => Err(format!("unknown network mode '{}' (expected local or http)", other).into()),
    }
}

/// Expand `~` at the start of a path to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if rest.starts_with('/') {
            if let Some(home) = dirs::home_dir() {
                return format!("{}{}", home.display(), rest);
            }
        }
    }
    path.to_string()
}
