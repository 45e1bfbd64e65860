//! Usage Ledger CLI
//!
//! Ingests a CSV batch of facts, advances every organization's checkpoint,
//! and prints the resulting balances.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- facts.csv --checkpoints checkpoints.csv > balances.csv
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Set to `debug` or `info` to control logging verbosity

use chrono::{DateTime, Utc};
use clap::Parser;
use log::info;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use usage_ledger::io::{read_checkpoints, read_facts, save_checkpoints, write_balances};
use usage_ledger::{
    BalanceEngine, CheckpointStore, EngineConfig, Fact, LedgerStore, MemoryCheckpoints,
    MemoryLedger, Result,
};

/// Exit status when some organizations could not be advanced.
const EXIT_PARTIAL: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "usage-ledger", version, about)]
struct Args {
    /// CSV file of transactions and payments to ingest
    facts: PathBuf,

    /// Checkpoint log to resume from; replaced atomically with the new log
    #[arg(long)]
    checkpoints: Option<PathBuf>,

    /// Upper bound of the window (RFC 3339); defaults to now
    #[arg(long)]
    cutoff: Option<DateTime<Utc>>,

    /// Organizations committed per atomic unit
    #[arg(long, default_value_t = EngineConfig::DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Abort before committing once this many milliseconds have passed
    #[arg(long)]
    timeout_ms: Option<u64>,
}

fn main() {
    env_logger::init();

    let args = Args::parse();
    match run(args) {
        Ok(true) => {}
        Ok(false) => process::exit(EXIT_PARTIAL),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

/// Returns `Ok(false)` when the run finished but some organizations failed.
fn run(args: Args) -> Result<bool> {
    let history = match &args.checkpoints {
        Some(path) if path.exists() => read_checkpoints(BufReader::new(File::open(path)?))?,
        _ => Vec::new(),
    };
    let facts = read_facts(BufReader::new(File::open(&args.facts)?))?;

    // Organizations are owned elsewhere; here, any id seen in the inputs
    // counts as registered.
    let ledger = Arc::new(MemoryLedger::new());
    for org in history
        .iter()
        .map(|cp| cp.organization_id)
        .chain(facts.iter().map(|fact| fact.organization_id()))
    {
        ledger.register_organization(org);
    }
    info!(
        "Loaded {} checkpoints and {} facts for {} organizations",
        history.len(),
        facts.len(),
        ledger.organization_ids()?.len()
    );

    let checkpoints = Arc::new(MemoryCheckpoints::from_history(history)?);

    let mut config = EngineConfig::default().with_chunk_size(args.chunk_size);
    if let Some(ms) = args.timeout_ms {
        config = config.with_timeout(Duration::from_millis(ms));
    }
    let engine = BalanceEngine::with_config(ledger, Arc::clone(&checkpoints), config);

    // Facts inside an already checkpointed window were consumed by an
    // earlier run; only the rest are ingested.
    let (fresh, covered) = split_covered(facts, &*checkpoints)?;
    if covered > 0 {
        eprintln!(
            "skipped {} facts at or before their organization's checkpoint",
            covered
        );
    }
    engine.ingestor().ingest(fresh)?;

    let report = match args.cutoff {
        Some(cutoff) => engine.recompute_at(&[], cutoff)?,
        None => engine.recompute(&[])?,
    };

    if let Some(path) = &args.checkpoints {
        save_checkpoints(path, &checkpoints.snapshot())?;
    }

    let stdout = io::stdout();
    write_balances(stdout.lock(), report.committed.values())?;

    for (org, error) in &report.failures {
        eprintln!("organization {}: {}", org, error);
    }
    Ok(report.is_complete())
}

/// Splits off facts that the organization's latest checkpoint already covers.
fn split_covered<C: CheckpointStore>(
    facts: Vec<Fact>,
    checkpoints: &C,
) -> Result<(Vec<Fact>, usize)> {
    let mut fresh = Vec::with_capacity(facts.len());
    let mut covered = 0;
    for fact in facts {
        match checkpoints.latest(fact.organization_id())? {
            Some(cp) if fact.timestamp() <= cp.timestamp => {
                info!(
                    "Skipping fact for organization {} at {}: checkpointed at {}",
                    fact.organization_id(),
                    fact.timestamp(),
                    cp.timestamp
                );
                covered += 1;
            }
            _ => fresh.push(fact),
        }
    }
    Ok((fresh, covered))
}
