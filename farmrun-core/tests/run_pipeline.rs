use chrono::{Duration as ChronoDuration, Utc};
use farmrun_core::{
    BatchStatus, CancelToken, DispatchBudget, DispatchOutcome, EndRunError, EndRunRequest,
    GrantBatch, GrantDispatcher, LedgerAuth, LedgerClient, LedgerError, LootedItem,
    MemorySessionStore, RewardItem, RunConfig, RunPipeline, RunSession, SessionStore, aggregate,
    calculate_rewards, merge_rewards,
};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Counting mock ledger; clones share state so the test keeps a handle
/// after moving one into the pipeline.
#[derive(Default, Clone)]
struct CountingLedger {
    inner: Arc<Mutex<LedgerState>>,
}

#[derive(Default)]
struct LedgerState {
    script: Vec<Result<(), LedgerError>>,
    calls: Vec<String>,
}

impl CountingLedger {
    fn script(&self, script: Vec<Result<(), LedgerError>>) {
        self.inner.lock().unwrap().script = script;
    }

    fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }
}

impl LedgerClient for CountingLedger {
    fn execute_batch(
        &self,
        batch: &GrantBatch,
        _auth: &LedgerAuth,
        _timeout: Duration,
    ) -> Result<(), LedgerError> {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(batch.idempotency_key.clone());
        if state.script.is_empty() {
            Ok(())
        } else {
            state.script.remove(0)
        }
    }
}

fn quick_config() -> RunConfig {
    RunConfig {
        retry_backoff_ms: 1,
        ..RunConfig::default()
    }
}

fn harness() -> (
    RunPipeline<MemorySessionStore, CountingLedger>,
    MemorySessionStore,
    CountingLedger,
) {
    let store = MemorySessionStore::new();
    let ledger = CountingLedger::default();
    let pipeline = RunPipeline::new(quick_config(), store.clone(), ledger.clone());
    (pipeline, store, ledger)
}

fn backdated_run(store: &MemorySessionStore, elapsed_sec: i64) -> String {
    let mut rng = SmallRng::from_entropy();
    let session = RunSession::start(
        None,
        &quick_config(),
        Utc::now() - ChronoDuration::seconds(elapsed_sec),
        &mut rng,
    );
    store.create(&session).unwrap();
    session.run_id
}

fn auth() -> LedgerAuth {
    LedgerAuth::new("player-1", "token-1")
}

#[test]
fn start_run_produces_distinct_ids() {
    let (pipeline, _store, _ledger) = harness();
    let ids: HashSet<String> = (0..50)
        .map(|_| pipeline.start_run(None).unwrap().run_id)
        .collect();
    assert_eq!(ids.len(), 50);
}

#[test]
fn reward_computation_and_batching_are_reproducible() {
    let cfg = quick_config();
    let looted: Vec<LootedItem> = (0..130)
        .map(|i| LootedItem::new(format!("item-{i:03}"), i64::from(i % 7) + 1))
        .collect();

    let first = calculate_rewards(true, &looted, &cfg);
    let second = calculate_rewards(true, &looted, &cfg);
    assert_eq!(first, second);

    let batches_a = aggregate("run-fixed", &first, cfg.max_ops_per_call);
    let batches_b = aggregate("run-fixed", &second, cfg.max_ops_per_call);
    assert_eq!(batches_a, batches_b);
    assert_eq!(
        serde_json::to_vec(&batches_a).unwrap(),
        serde_json::to_vec(&batches_b).unwrap()
    );
}

#[test]
fn merged_set_is_ordered_and_summed() {
    let rewards = vec![
        RewardItem::new("a", 2),
        RewardItem::new("b", 1),
        RewardItem::new("a", 3),
    ];
    assert_eq!(
        merge_rewards(&rewards),
        vec![RewardItem::new("a", 5), RewardItem::new("b", 1)]
    );
}

#[test]
fn end_run_twice_dispatches_once() {
    let (pipeline, store, ledger) = harness();
    let run_id = backdated_run(&store, 300);
    let request = EndRunRequest {
        run_id: run_id.clone(),
        success: true,
        clear_time_sec: 300,
        looted_items: vec![
            LootedItem::new("ITEM_HERB", 2),
            LootedItem::new("ITEM_ORE", 1),
        ],
    };

    let first = pipeline
        .end_run(&request, &auth(), &DispatchBudget::unbounded())
        .unwrap();
    let second = pipeline
        .end_run(&request, &auth(), &DispatchBudget::unbounded())
        .unwrap();

    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(first.rewards, second.rewards);
    assert_eq!(first.applied_ops, second.applied_ops);
    assert_eq!(ledger.calls(), vec![run_id]);
}

#[test]
fn oversized_grant_splits_into_keyed_batches() {
    let (pipeline, store, ledger) = harness();
    let run_id = backdated_run(&store, 305);
    let looted: Vec<LootedItem> = (0..119)
        .map(|i| LootedItem::new(format!("item-{i:03}"), 1))
        .collect();
    let request = EndRunRequest {
        run_id: run_id.clone(),
        success: true,
        clear_time_sec: 305,
        looted_items: looted,
    };

    let outcome = pipeline
        .end_run(&request, &auth(), &DispatchBudget::unbounded())
        .unwrap();
    // 119 loot ids plus the base currency item, three chunks of 50/50/20.
    assert_eq!(outcome.applied_ops, 120);
    assert_eq!(
        ledger.calls(),
        vec![
            format!("{run_id}_1"),
            format!("{run_id}_2"),
            format!("{run_id}_3"),
        ]
    );
}

#[test]
fn transient_ledger_failure_is_absorbed_by_retry() {
    let (pipeline, store, ledger) = harness();
    let run_id = backdated_run(&store, 300);
    ledger.script(vec![Err(LedgerError::Transient { status: 503 }), Ok(())]);
    let request = EndRunRequest {
        run_id: run_id.clone(),
        success: true,
        clear_time_sec: 300,
        looted_items: vec![LootedItem::new("ITEM_HERB", 1)],
    };
    let outcome = pipeline
        .end_run(&request, &auth(), &DispatchBudget::unbounded())
        .unwrap();
    assert_eq!(outcome.applied_ops, 2);
    // Same key on both attempts; the ledger de-duplicates by it.
    assert_eq!(ledger.calls(), vec![run_id.clone(), run_id]);
}

#[test]
fn cancelled_budget_reports_partial_progress() {
    // Drive the dispatcher directly so cancellation lands between batches.
    let cfg = quick_config();
    let rewards: Vec<RewardItem> = (0..120)
        .map(|i| RewardItem::new(format!("item-{i:03}"), 1))
        .collect();
    let mut batches = aggregate("run-cancel", &rewards, cfg.max_ops_per_call);

    struct CancellingLedger {
        cancel: CancelToken,
    }
    impl LedgerClient for CancellingLedger {
        fn execute_batch(
            &self,
            _batch: &GrantBatch,
            _auth: &LedgerAuth,
            _timeout: Duration,
        ) -> Result<(), LedgerError> {
            // Caller cancels while the first batch is in flight.
            self.cancel.cancel();
            Ok(())
        }
    }

    let budget = DispatchBudget::unbounded();
    let ledger = CancellingLedger {
        cancel: budget.cancel.clone(),
    };
    let dispatcher = GrantDispatcher::from_config(&cfg);
    let report = dispatcher.dispatch(&ledger, &mut batches, &auth(), &budget);

    assert_eq!(report.applied_batches, 1);
    assert_eq!(report.applied_ops, 50);
    assert_eq!(report.outcome, DispatchOutcome::Cancelled { batch_index: 1 });
    // The applied batch is never rolled back.
    assert_eq!(batches[0].status, BatchStatus::Applied);
    assert_eq!(batches[1].status, BatchStatus::Pending);
}

#[test]
fn ended_session_survives_grant_failure_and_resumes() {
    let (pipeline, store, ledger) = harness();
    let run_id = backdated_run(&store, 295);
    ledger.script(vec![Err(LedgerError::Transient { status: 500 }); 3]);
    let request = EndRunRequest {
        run_id: run_id.clone(),
        success: true,
        clear_time_sec: 295,
        looted_items: vec![LootedItem::new("ITEM_HERB", 4)],
    };

    let err = pipeline
        .end_run(&request, &auth(), &DispatchBudget::unbounded())
        .unwrap_err();
    assert!(matches!(
        err,
        EndRunError::GrantIncomplete {
            applied_ops: 0,
            outcome: DispatchOutcome::RetriesExhausted { batch_index: 0, .. },
            ..
        }
    ));
    // The session is ended; the stored outcome backs the resume.
    let stored = store.stored_outcome(&run_id).unwrap().unwrap();
    assert_eq!(stored.applied_ops, 0);
    assert_eq!(stored.rewards.len(), 2);

    let resumed = pipeline
        .resume_grant(&run_id, &auth(), &DispatchBudget::unbounded())
        .unwrap();
    assert_eq!(resumed.applied_ops, 2);
    assert_eq!(
        store.stored_outcome(&run_id).unwrap().unwrap().applied_ops,
        2
    );
}
