//! End-to-end run pipeline: validate, fix the outcome, compute rewards,
//! aggregate, and dispatch.
//!
//! A session is marked `Ended` strictly before any ledger call, so a
//! concurrent duplicate end-run observes the stored outcome and never races
//! into double-dispatch. If the grant fails or is cancelled partway, the
//! session stays ended and only the dispatch step is resumed, from the same
//! stored reward set under the same keys.

use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::sync::Mutex;
use thiserror::Error;

use crate::config::RunConfig;
use crate::dispatch::{
    DispatchBudget, DispatchOutcome, DispatchReport, GrantDispatcher, LedgerAuth, LedgerClient,
};
use crate::grant::aggregate;
use crate::rewards::{LootedItem, RewardItem, calculate_rewards};
use crate::session::{
    MarkEnded, RunSession, SessionStore, StoreError, StoredOutcome, ValidationError, validate_window,
};

/// End-run request after transport decoding, before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct EndRunRequest {
    pub run_id: String,
    pub success: bool,
    /// Client-reported clear time; plausibility cross-check only.
    pub clear_time_sec: i64,
    pub looted_items: Vec<LootedItem>,
}

/// Result of a completed (or replayed) end-run.
#[derive(Debug, Clone, PartialEq)]
pub struct EndRunOutcome {
    pub success: bool,
    /// Full computed reward set, regardless of how much has been applied.
    pub rewards: Vec<RewardItem>,
    /// Merged operations confirmed applied by the ledger.
    pub applied_ops: usize,
    /// True when this call replayed a previously ended session.
    pub replayed: bool,
}

/// Failures surfaced by the pipeline. Ledger transient errors are retried
/// internally and only appear here once retries exhaust.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EndRunError {
    #[error("unknown run id {run_id}")]
    NotFound { run_id: String },
    #[error("run {run_id} has not ended; nothing to resume")]
    NotEnded { run_id: String },
    #[error("run validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("grant incomplete: {applied_ops} operations applied before {outcome:?}")]
    GrantIncomplete {
        /// The full computed reward set, so the caller can still show it.
        rewards: Vec<RewardItem>,
        /// Operations that actually landed, a prefix of the merged set.
        applied_ops: usize,
        outcome: DispatchOutcome,
    },
}

/// Owns the collaborators and drives start, end, and resume for run sessions.
///
/// Sessions for different run ids may be processed fully in parallel; all
/// mutation is keyed by run id and the store provides the only atomicity
/// the pipeline needs.
pub struct RunPipeline<S, L> {
    cfg: RunConfig,
    store: S,
    ledger: L,
    dispatcher: GrantDispatcher,
    rng: Mutex<SmallRng>,
}

impl<S: SessionStore, L: LedgerClient> RunPipeline<S, L> {
    #[must_use]
    pub fn new(cfg: RunConfig, store: S, ledger: L) -> Self {
        let dispatcher = GrantDispatcher::from_config(&cfg);
        Self {
            cfg,
            store,
            ledger,
            dispatcher,
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }

    /// Pipeline configuration.
    #[must_use]
    pub const fn config(&self) -> &RunConfig {
        &self.cfg
    }

    /// Session store collaborator.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Create and persist a new run session.
    ///
    /// # Errors
    ///
    /// Fails only when the session store is unavailable.
    pub fn start_run(&self, dungeon_id: Option<String>) -> Result<RunSession, StoreError> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| StoreError::new("pipeline rng poisoned"))?;
        let session = RunSession::start(dungeon_id, &self.cfg, Utc::now(), &mut *rng);
        drop(rng);
        self.store.create(&session)?;
        log::info!(
            "run {} started: dungeon={} seed={} duration={}s",
            session.run_id,
            session.dungeon_id,
            session.seed,
            session.duration_sec
        );
        Ok(session)
    }

    /// Validate and end a run, then grant its rewards.
    ///
    /// A replayed call for an already-ended run returns the stored outcome
    /// without re-validating or re-dispatching.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown run ids, `Validation` for time-window
    /// violations (the session stays `Created`), `Store` on store outage,
    /// and `GrantIncomplete` when dispatch stopped partway.
    pub fn end_run(
        &self,
        request: &EndRunRequest,
        auth: &LedgerAuth,
        budget: &DispatchBudget,
    ) -> Result<EndRunOutcome, EndRunError> {
        let session =
            self.store
                .get(&request.run_id)?
                .ok_or_else(|| EndRunError::NotFound {
                    run_id: request.run_id.clone(),
                })?;

        let now = Utc::now();
        if session.state == crate::session::RunState::Ended {
            return self.replayed_outcome(&request.run_id);
        }

        let elapsed = validate_window(
            &session,
            request.success,
            request.clear_time_sec,
            now,
            &self.cfg,
        )
        .inspect_err(|error| {
            log::warn!("run {} failed validation: {error}", request.run_id);
        })?;

        let rewards = calculate_rewards(request.success, &request.looted_items, &self.cfg);
        let outcome = StoredOutcome {
            success: request.success,
            rewards: rewards.clone(),
            applied_ops: 0,
            ended_at: now,
        };

        // Fix the outcome before any ledger call; the loser of a concurrent
        // duplicate observes AlreadyEnded and replays.
        if self.store.mark_ended(&request.run_id, &outcome)? == MarkEnded::AlreadyEnded {
            return self.replayed_outcome(&request.run_id);
        }
        log::info!(
            "run {} ended: success={} elapsed={elapsed}s rewards={}",
            request.run_id,
            request.success,
            rewards.len()
        );

        self.grant(&request.run_id, request.success, rewards, 0, auth, budget)
    }

    /// Re-run only the dispatch step for an ended run whose grant did not
    /// complete. Uses the stored reward set, so the keys are identical and
    /// already-applied batches are skipped.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown run ids, `NotEnded` when the session has not
    /// ended, `Store` on store outage, `GrantIncomplete` when dispatch
    /// stopped partway again.
    pub fn resume_grant(
        &self,
        run_id: &str,
        auth: &LedgerAuth,
        budget: &DispatchBudget,
    ) -> Result<EndRunOutcome, EndRunError> {
        let session = self
            .store
            .get(run_id)?
            .ok_or_else(|| EndRunError::NotFound {
                run_id: run_id.to_string(),
            })?;
        if session.state != crate::session::RunState::Ended {
            return Err(EndRunError::NotEnded {
                run_id: run_id.to_string(),
            });
        }
        let stored = self
            .store
            .stored_outcome(run_id)?
            .ok_or_else(|| StoreError::new(format!("ended run {run_id} has no stored outcome")))?;

        log::info!(
            "run {run_id}: resuming grant from {} applied operations",
            stored.applied_ops
        );
        self.grant(
            run_id,
            stored.success,
            stored.rewards,
            stored.applied_ops,
            auth,
            budget,
        )
    }

    /// Aggregate and dispatch, skipping batches already covered by
    /// `already_applied`, then persist the new progress.
    fn grant(
        &self,
        run_id: &str,
        success: bool,
        rewards: Vec<RewardItem>,
        already_applied: usize,
        auth: &LedgerAuth,
        budget: &DispatchBudget,
    ) -> Result<EndRunOutcome, EndRunError> {
        let mut batches = aggregate(run_id, &rewards, self.cfg.max_ops_per_call);

        // Applied operations always form a prefix of the merged list, so
        // whole batches can be skipped on resume.
        let mut skipped_ops = 0;
        let mut skip = 0;
        for batch in &batches {
            if skipped_ops + batch.ops() > already_applied {
                break;
            }
            skipped_ops += batch.ops();
            skip += 1;
        }

        let report: DispatchReport =
            self.dispatcher
                .dispatch(&self.ledger, &mut batches[skip..], auth, budget);
        let applied_ops = skipped_ops + report.applied_ops;
        self.store.record_applied(run_id, applied_ops)?;

        if report.is_complete() {
            Ok(EndRunOutcome {
                success,
                rewards,
                applied_ops,
                replayed: false,
            })
        } else {
            log::error!(
                "run {run_id}: grant stopped after {applied_ops} operations ({:?})",
                report.outcome
            );
            Err(EndRunError::GrantIncomplete {
                rewards,
                applied_ops,
                outcome: shift_outcome(report.outcome, skip),
            })
        }
    }

    fn replayed_outcome(&self, run_id: &str) -> Result<EndRunOutcome, EndRunError> {
        let stored = self
            .store
            .stored_outcome(run_id)?
            .ok_or_else(|| StoreError::new(format!("ended run {run_id} has no stored outcome")))?;
        log::info!("run {run_id}: replaying stored outcome");
        Ok(EndRunOutcome {
            success: stored.success,
            rewards: stored.rewards,
            applied_ops: stored.applied_ops,
            replayed: true,
        })
    }
}

/// Re-base batch indices reported against a resumed slice onto the full
/// batch sequence.
fn shift_outcome(outcome: DispatchOutcome, skip: usize) -> DispatchOutcome {
    match outcome {
        DispatchOutcome::Complete => DispatchOutcome::Complete,
        DispatchOutcome::PermanentFailure { batch_index, error } => {
            DispatchOutcome::PermanentFailure {
                batch_index: batch_index + skip,
                error,
            }
        }
        DispatchOutcome::RetriesExhausted { batch_index, error } => {
            DispatchOutcome::RetriesExhausted {
                batch_index: batch_index + skip,
                error,
            }
        }
        DispatchOutcome::Cancelled { batch_index } => DispatchOutcome::Cancelled {
            batch_index: batch_index + skip,
        },
        DispatchOutcome::DeadlineExceeded { batch_index } => DispatchOutcome::DeadlineExceeded {
            batch_index: batch_index + skip,
        },
    }
}
