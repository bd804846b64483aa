//! CLI for the syncguard sync reliability engine.
//!
//! Integrity tooling (checksum, verify, manifest) plus an in-memory burst
//! simulator that exercises the queue, breaker and retry policy end to end.

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use syncguard_core::manifest::Manifest;
use syncguard_core::types::unix_millis;
use syncguard_core::{validate_manifest, ChecksumValidator, ResilienceConfig, SyncError};
use syncguard_engine::{system_clock, RegistryStatus, ResilienceRegistry, ServiceStatus, SyncService};
use syncguard_provider::{MemoryEditLocks, MemoryStore};

#[derive(Parser, Debug)]
#[command(name = "syncguard", version, about = "Sync reliability engine tooling")]
struct Cli {
    #[command(flatten)]
    overrides: ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Configuration source and per-value overrides.
#[derive(Args, Debug)]
struct ConfigArgs {
    /// JSON file with a `ResilienceConfig`; missing fields take defaults.
    #[arg(long, global = true, env = "SYNCGUARD_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    debounce_ms: Option<u64>,

    #[arg(long, global = true)]
    failure_threshold: Option<u32>,

    #[arg(long, global = true)]
    open_timeout_ms: Option<u64>,

    #[arg(long, global = true)]
    max_attempts: Option<u32>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the checksum of a file.
    Checksum { file: PathBuf },

    /// Check a file against an expected checksum; exits 1 on mismatch.
    Verify {
        file: PathBuf,

        #[arg(long)]
        expected: String,
    },

    /// Validate a snapshot manifest JSON file.
    Manifest { file: PathBuf },

    /// Burst writes against an in-memory store and report the outcome.
    Simulate {
        /// Total number of saves.
        #[arg(long, default_value_t = 20)]
        updates: u32,

        /// Distinct records the saves are spread over.
        #[arg(long, default_value_t = 3)]
        keys: u32,

        /// Remote writes that fail before the store recovers.
        #[arg(long, default_value_t = 0)]
        fail_first: u32,
    },

    /// Print the effective configuration.
    Config,
}

impl ConfigArgs {
    fn load(&self) -> Result<ResilienceConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                tracing::debug!(path = %path.display(), "loaded config file");
                serde_json::from_str(&raw)?
            }
            None => ResilienceConfig::default(),
        };

        if let Some(v) = self.debounce_ms {
            config.sync_queue.debounce_ms = v;
        }
        if let Some(v) = self.failure_threshold {
            config.circuit_breaker.failure_threshold = v;
        }
        if let Some(v) = self.open_timeout_ms {
            config.circuit_breaker.open_timeout_ms = v;
        }
        if let Some(v) = self.max_attempts {
            config.retry.max_attempts = v;
        }
        Ok(config)
    }
}

#[derive(Debug, Default, Serialize)]
struct Outcomes {
    written: u32,
    superseded: u32,
    failed: u32,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    updates: u32,
    keys: u32,
    elapsed_ms: u64,
    remote_writes: u64,
    outcomes: Outcomes,
    service: ServiceStatus,
    registry: RegistryStatus,
}

fn read_file(path: &Path) -> std::io::Result<Vec<u8>> {
    std::fs::read(path)
}

async fn simulate(
    config: &ResilienceConfig,
    updates: u32,
    keys: u32,
    fail_first: u32,
) -> Result<SimulationReport, Box<dyn std::error::Error>> {
    let t0 = Instant::now();
    let keys = keys.max(1);

    let store = Arc::new(MemoryStore::new());
    store.fail_next_puts(fail_first);
    let registry = ResilienceRegistry::new(system_clock());
    let service = SyncService::new(
        store.clone(),
        Arc::new(MemoryEditLocks::new("cli", "syncguard CLI")),
        "cli",
        &registry,
        config,
    );

    tracing::info!(updates, keys, fail_first, "starting simulation");
    let tickets: Vec<_> = (0..updates)
        .map(|i| {
            let record = (i % keys).to_string();
            service.save("envelope", &record, json!({"revision": i, "budgeted": i * 100}))
        })
        .collect();

    let flushed = service.flush().await;
    tracing::info!(flushed = flushed.len(), "flush complete");

    let mut outcomes = Outcomes::default();
    for ticket in tickets {
        match ticket.await {
            Ok(_) => outcomes.written += 1,
            Err(e) if e.is_superseded() => outcomes.superseded += 1,
            Err(e) => {
                tracing::warn!(error = %e, "save failed");
                outcomes.failed += 1;
            }
        }
    }

    Ok(SimulationReport {
        updates,
        keys,
        elapsed_ms: t0.elapsed().as_millis() as u64,
        remote_writes: store.put_calls(),
        outcomes,
        service: service.status(),
        registry: registry.status(),
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.overrides.load()?;
    let validator = ChecksumValidator::default();

    match cli.command {
        Commands::Checksum { file } => {
            let data = read_file(&file)?;
            println!("{}  {}", validator.generate(&data), file.display());
        }

        Commands::Verify { file, expected } => {
            let data = read_file(&file)?;
            match validator.verify(&file.display().to_string(), &data, &expected) {
                Ok(()) => println!("OK  {}", file.display()),
                Err(SyncError::ChecksumMismatch { actual, .. }) => {
                    eprintln!("MISMATCH  {}: got {}", file.display(), actual);
                    std::process::exit(1);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Commands::Manifest { file } => {
            let raw = std::fs::read_to_string(&file)?;
            let value: Value = serde_json::from_str(&raw)?;
            let report = validate_manifest(&value, "cli", unix_millis());
            let is_valid = report.is_valid;

            let checksum_ok = if is_valid {
                match serde_json::from_value::<Manifest>(value) {
                    Ok(manifest) => Some(manifest.verify_checksum().is_ok()),
                    Err(e) => {
                        tracing::warn!(error = %e, "manifest does not match the typed layout");
                        None
                    }
                }
            } else {
                None
            };

            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "report": report,
                    "checksumValid": checksum_ok,
                }))?
            );
            if !is_valid || checksum_ok == Some(false) {
                std::process::exit(1);
            }
        }

        Commands::Simulate {
            updates,
            keys,
            fail_first,
        } => {
            let report = simulate(&config, updates, keys, fail_first).await?;
            tracing::info!(
                remote_writes = report.remote_writes,
                superseded = report.outcomes.superseded,
                failed = report.outcomes.failed,
                elapsed_ms = report.elapsed_ms,
                "simulation done"
            );
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
