//! Kasse Point-of-Sale Reference Runtime: Demo CLI
//!
//! Runs one or all of the four point-of-sale scenarios, and audits a ledger
//! left on disk by a previous run.  Each scenario uses the real Kasse
//! components (hash-chained ledger, outbox, coordinator, retry policy) wired
//! to a simulated signing device.
//!
//! Usage:
//!   cargo run -p demo -- run-all
//!   cargo run -p demo -- sale
//!   cargo run -p demo -- device-outage
//!   cargo run -p demo -- crash-recovery --data-dir ./till
//!   cargo run -p demo -- tamper-audit
//!   cargo run -p demo -- verify --data-dir ./till
//!   cargo run -p demo -- --policy crates/kasse-pos/policies/default.toml sale

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use kasse_contracts::error::{KasseError, KasseResult};
use kasse_policy::TomlRetryPolicy;
use kasse_pos::{
    runtime::demo_policy,
    scenarios::{crash_recovery, device_outage, sale, tamper_audit},
};

// ── CLI definition ────────────────────────────────────────────────────────────

/// Kasse: hash-chained fiscal ledger point-of-sale demo.
///
/// Each subcommand runs one or all of the four till scenarios, demonstrating
/// exactly-once signing, retry and escalation, crash recovery, and tamper
/// detection.
#[derive(Parser)]
#[command(
    name = "demo",
    about = "Kasse point-of-sale reference runtime demo",
    long_about = "Runs Kasse point-of-sale scenarios showing exactly-once fiscal signing,\n\
                  retry and escalation, crash recovery, and ledger integrity audits."
)]
struct Cli {
    /// Retry policy TOML file.  Defaults to the fast demo timings.
    #[arg(long, global = true)]
    policy: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run all four scenarios in sequence.
    RunAll,
    /// Scenario 1: Everyday sales (commit once, concurrent sales).
    Sale,
    /// Scenario 2: Signing device outage (retry, escalation, resolution).
    DeviceOutage,
    /// Scenario 3: Crash between signing and commit, then recovery.
    CrashRecovery {
        /// Keep the ledger files here instead of a temporary directory.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Scenario 4: Edit a ledger file and audit it.
    TamperAudit {
        /// Keep the ledger files here instead of a temporary directory.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Verify every chain of a ledger on disk.  Exits 1 if any chain is broken.
    Verify {
        #[arg(long)]
        data_dir: PathBuf,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Initialize structured logging.  Set RUST_LOG=debug for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    print_banner();

    let result = match load_policy(cli.policy) {
        Ok(policy) => match cli.command {
            Command::RunAll => run_all(&policy).await,
            Command::Sale => sale::run_scenario(&policy).await,
            Command::DeviceOutage => device_outage::run_scenario(&policy).await,
            Command::CrashRecovery { data_dir } => {
                crash_recovery::run_scenario(&policy, data_dir.as_deref()).await
            }
            Command::TamperAudit { data_dir } => {
                tamper_audit::run_scenario(&policy, data_dir.as_deref()).await
            }
            Command::Verify { data_dir } => run_verify(data_dir),
        },
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => {
            println!("All selected commands completed successfully.");
        }
        Err(e) => {
            eprintln!("Demo error: {}", e);
            std::process::exit(1);
        }
    }
}

fn load_policy(path: Option<PathBuf>) -> KasseResult<TomlRetryPolicy> {
    match path {
        Some(path) => {
            let policy = TomlRetryPolicy::from_file(&path)?;
            info!(path = %path.display(), "retry policy loaded");
            Ok(policy)
        }
        None => demo_policy(),
    }
}

// ── Command dispatch ──────────────────────────────────────────────────────────

async fn run_all(policy: &TomlRetryPolicy) -> KasseResult<()> {
    sale::run_scenario(policy).await?;
    device_outage::run_scenario(policy).await?;
    crash_recovery::run_scenario(policy, None).await?;
    tamper_audit::run_scenario(policy, None).await?;
    Ok(())
}

fn run_verify(data_dir: PathBuf) -> KasseResult<()> {
    if !data_dir.is_dir() {
        return Err(KasseError::storage(format!(
            "data directory {} does not exist",
            data_dir.display()
        )));
    }

    println!("=== Ledger audit: {} ===", data_dir.display());
    println!();
    let reports = tamper_audit::audit_ledger(&data_dir)?;
    let mut broken = Vec::new();
    for v in &reports {
        match &v.broken_at {
            None => println!("  {:<12} VERIFIED ({} checked)", v.chain.as_str(), v.checked),
            Some(at) => {
                broken.push(v.chain.as_str());
                println!(
                    "  {:<12} BROKEN at sequence {} ({:?}, log id {})",
                    v.chain.as_str(),
                    at.sequence,
                    at.kind,
                    at.log_id
                );
            }
        }
    }
    println!();

    if !broken.is_empty() {
        return Err(KasseError::Integrity {
            chain: broken.join(","),
            reason: format!("{} of {} chains failed verification", broken.len(), reports.len()),
        });
    }
    Ok(())
}

// ── Banner ────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("Kasse: Hash-chained Fiscal Ledger");
    println!("Point-of-Sale Reference Demo");
    println!("=================================");
    println!();
    println!("Fiscal pipeline per sale:");
    println!("  [1] Outbox row recorded as PENDING (deduplicated by operation id)");
    println!("  [2] Signing device called under a timeout; failures retried with backoff");
    println!("  [3] Signature stored on the row as DEVICE_SUCCESS before any ledger write");
    println!("  [4] Fiscal entry appended to the SHA-256 chain, row marked COMMITTED");
    println!("  [5] Exhausted or rejected operations escalated to the shift manager");
    println!();
}
