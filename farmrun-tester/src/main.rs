//! Drives the full run pipeline against an in-memory store and a
//! scriptable mock ledger, for local QA without a real economy backend.

use anyhow::{Context, Result, bail};
use chrono::{Duration as ChronoDuration, Utc};
use clap::Parser;
use colored::Colorize;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use farmrun_core::{
    DispatchBudget, GrantBatch, LedgerAuth, LedgerClient, LedgerError, MemorySessionStore,
    RunConfig, RunPipeline, RunSession, SessionStore,
};
use farmrun_service::handle_end_run;

#[derive(Debug, Parser)]
#[command(name = "farmrun-tester", version = "0.1.0")]
#[command(about = "Local QA driver for the Farmrun reward pipeline")]
struct Args {
    /// Number of runs to simulate
    #[arg(long, default_value_t = 3)]
    runs: usize,

    /// Distinct loot item kinds claimed per run
    #[arg(long, default_value_t = 120)]
    loot_kinds: usize,

    /// Simulated elapsed seconds per run (sessions are backdated by this much)
    #[arg(long, default_value_t = 300)]
    elapsed: i64,

    /// Expected run duration in seconds
    #[arg(long, default_value_t = 300)]
    duration: u32,

    /// Validation buffer in seconds
    #[arg(long, default_value_t = 10)]
    buffer: u32,

    /// Permanently fail this 1-based batch of the first run
    #[arg(long)]
    fail_batch: Option<usize>,

    /// Transient failures injected before each batch succeeds
    #[arg(long, default_value_t = 0)]
    flaky: u32,

    /// Report runs as unsuccessful (no rewards expected)
    #[arg(long)]
    failed: bool,

    /// Resume the grant after an injected permanent failure
    #[arg(long)]
    resume: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Mock ledger: optional one-shot permanent failure by call index, plus a
/// configurable number of transient failures per idempotency key.
#[derive(Clone)]
struct MockLedger {
    inner: Arc<Mutex<MockState>>,
    flaky: u32,
}

struct MockState {
    calls: usize,
    fail_at_call: Option<usize>,
    transient_seen: HashMap<String, u32>,
}

impl MockLedger {
    fn new(fail_at_call: Option<usize>, flaky: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockState {
                calls: 0,
                fail_at_call,
                transient_seen: HashMap::new(),
            })),
            flaky,
        }
    }

    fn calls(&self) -> usize {
        self.inner.lock().expect("mock ledger poisoned").calls
    }
}

impl LedgerClient for MockLedger {
    fn execute_batch(
        &self,
        batch: &GrantBatch,
        _auth: &LedgerAuth,
        _timeout: Duration,
    ) -> Result<(), LedgerError> {
        let mut state = self.inner.lock().expect("mock ledger poisoned");
        state.calls += 1;

        let seen = state
            .transient_seen
            .entry(batch.idempotency_key.clone())
            .or_insert(0);
        if *seen < self.flaky {
            *seen += 1;
            return Err(LedgerError::Transient { status: 503 });
        }

        let calls = state.calls;
        if state.fail_at_call.take_if(|at| *at == calls).is_some() {
            return Err(LedgerError::Permanent {
                status: 400,
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let cfg = RunConfig {
        run_duration_sec: args.duration,
        time_buffer_sec: args.buffer,
        retry_backoff_ms: 10,
        ..RunConfig::default()
    };
    cfg.validate().context("invalid run configuration")?;

    let store = MemorySessionStore::new();
    let ledger = MockLedger::new(args.fail_batch, args.flaky);
    let pipeline = RunPipeline::new(cfg.clone(), store.clone(), ledger.clone());
    let auth = LedgerAuth::new("local-player", "local-token");
    let mut rng = SmallRng::from_entropy();

    println!(
        "{} {} runs, {} loot kinds, {}s elapsed",
        "farmrun-tester".bold(),
        args.runs,
        args.loot_kinds,
        args.elapsed
    );

    let mut granted = 0usize;
    let mut incomplete = 0usize;
    for run in 0..args.runs {
        // Sessions are created directly in the store, backdated so the
        // time-window validation sees the requested elapsed time.
        let session = RunSession::start(
            None,
            &cfg,
            Utc::now() - ChronoDuration::seconds(args.elapsed),
            &mut rng,
        );
        store
            .create(&session)
            .context("creating backdated session")?;

        let body = end_run_body(&session.run_id, !args.failed, args.elapsed, args.loot_kinds);
        let response = handle_end_run(&pipeline, &body, Some(&auth), &DispatchBudget::unbounded());

        if response.ok {
            granted += 1;
            println!(
                "  run {}: {} rewards={} applied={}",
                run + 1,
                "ok".green(),
                response.rewards.len(),
                response.applied_count
            );
        } else {
            incomplete += 1;
            println!(
                "  run {}: {} applied={} ({})",
                run + 1,
                "failed".red(),
                response.applied_count,
                response.message.as_deref().unwrap_or("no message")
            );
            if args.resume && !response.rewards.is_empty() {
                let resumed = pipeline
                    .resume_grant(&session.run_id, &auth, &DispatchBudget::unbounded())
                    .context("resuming grant")?;
                println!(
                    "  run {}: {} applied={}",
                    run + 1,
                    "resumed".yellow(),
                    resumed.applied_ops
                );
            }
        }
        if args.verbose {
            log::info!("run {}: {} ledger calls so far", run + 1, ledger.calls());
        }
    }

    println!(
        "{}: {} granted, {} incomplete, {} ledger calls",
        "summary".bold(),
        granted.to_string().green(),
        incomplete.to_string().red(),
        ledger.calls()
    );

    if granted + incomplete != args.runs {
        bail!("accounting mismatch: {granted}+{incomplete} != {}", args.runs);
    }
    Ok(())
}

/// Bare end-run body with the requested number of distinct loot claims.
fn end_run_body(run_id: &str, success: bool, elapsed: i64, loot_kinds: usize) -> String {
    let looted: Vec<serde_json::Value> = (0..loot_kinds)
        .map(|i| {
            serde_json::json!({
                "itemId": format!("ITEM_{i:04}"),
                "amount": 1 + (i % 5) as i64,
                "containerId": format!("chest-{}", i / 10),
            })
        })
        .collect();
    serde_json::json!({
        "runId": run_id,
        "success": success,
        "clearTimeSec": elapsed,
        "lootedItems": looted,
    })
    .to_string()
}
