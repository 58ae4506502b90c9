//! Sequential grant dispatch with retry classification and partial-failure
//! accounting.
//!
//! Batches apply strictly in index order so a failure always leaves a prefix
//! of successes, and the report states exactly how many operations landed.
//! Retrying a batch reuses its idempotency key, so the ledger either applies
//! it once or rejects the duplicate as already applied.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::RunConfig;
use crate::grant::{BatchStatus, GrantBatch};

/// Failure classes reported by the external economy ledger.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger call timed out")]
    Timeout,
    #[error("ledger server error {status}")]
    Transient { status: u16 },
    #[error("ledger rejected the call ({status}): {message}")]
    Permanent { status: u16, message: String },
}

impl LedgerError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transient { .. })
    }
}

/// Credentials and scope for ledger calls, passed explicitly into the
/// dispatcher. There is no process-wide ledger configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerAuth {
    /// Player entity the grant is scoped to.
    pub entity_id: String,
    /// Authorization token obtained from the identity collaborator.
    pub entity_token: String,
    /// Inventory collection receiving the items.
    pub collection_id: String,
}

impl LedgerAuth {
    /// Auth scoped to the default inventory collection.
    #[must_use]
    pub fn new(entity_id: impl Into<String>, entity_token: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_token: entity_token.into(),
            collection_id: "default".to_string(),
        }
    }
}

/// Capability interface over the external ledger, swappable in tests.
///
/// Implementations own the network transport and must enforce `timeout` on
/// the call, mapping transport timeouts to [`LedgerError::Timeout`].
pub trait LedgerClient {
    /// Apply one batch of add-item operations.
    ///
    /// # Errors
    ///
    /// Returns a [`LedgerError`] classified so the dispatcher can decide
    /// between retrying and aborting.
    fn execute_batch(
        &self,
        batch: &GrantBatch,
        auth: &LedgerAuth,
        timeout: Duration,
    ) -> Result<(), LedgerError>;
}

/// Cooperative cancellation shared between the caller and the dispatcher.
/// Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; the dispatcher stops before the next batch.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Caller-supplied deadline and cancellation signal for one dispatch pass.
#[derive(Debug, Clone, Default)]
pub struct DispatchBudget {
    /// Hard deadline; per-batch timeouts shrink to whatever remains.
    pub deadline: Option<Instant>,
    pub cancel: CancelToken,
}

impl DispatchBudget {
    /// No deadline, cancellable only via the token.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Budget expiring `limit` from now.
    #[must_use]
    pub fn with_deadline(limit: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + limit),
            cancel: CancelToken::new(),
        }
    }

    fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// Terminal state of one dispatch pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Every batch applied.
    Complete,
    /// The ledger rejected `batch_index` with a client error; no retry, no
    /// later batch was attempted.
    PermanentFailure {
        batch_index: usize,
        error: LedgerError,
    },
    /// Transient failures on `batch_index` outlived the retry allowance.
    RetriesExhausted {
        batch_index: usize,
        error: LedgerError,
    },
    /// Cancelled before `batch_index` was applied. Earlier batches stand.
    Cancelled { batch_index: usize },
    /// The deadline expired before `batch_index` was applied.
    DeadlineExceeded { batch_index: usize },
}

/// What a dispatch pass actually achieved. Applied batches are never undone;
/// progress is reported, not rolled back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// Batches confirmed applied, always a prefix of the input.
    pub applied_batches: usize,
    /// Merged operations confirmed applied across those batches.
    pub applied_ops: usize,
    pub outcome: DispatchOutcome,
}

impl DispatchReport {
    /// Whether every batch landed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.outcome == DispatchOutcome::Complete
    }
}

/// Sends batches to the ledger sequentially, retrying transient failures
/// with doubling backoff under an optional deadline.
#[derive(Debug, Clone)]
pub struct GrantDispatcher {
    call_timeout: Duration,
    max_transient_retries: u32,
    retry_backoff: Duration,
}

impl GrantDispatcher {
    #[must_use]
    pub const fn new(
        call_timeout: Duration,
        max_transient_retries: u32,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            call_timeout,
            max_transient_retries,
            retry_backoff,
        }
    }

    /// Dispatcher tuned from the run configuration.
    #[must_use]
    pub const fn from_config(cfg: &RunConfig) -> Self {
        Self::new(
            cfg.call_timeout(),
            cfg.max_transient_retries,
            cfg.retry_backoff(),
        )
    }

    /// Apply `batches` in index order, updating each batch's status.
    ///
    /// Stops at the first permanent failure, exhausted retry allowance,
    /// cancellation, or expired deadline, and reports how far it got.
    pub fn dispatch<L: LedgerClient>(
        &self,
        ledger: &L,
        batches: &mut [GrantBatch],
        auth: &LedgerAuth,
        budget: &DispatchBudget,
    ) -> DispatchReport {
        let mut applied_batches = 0;
        let mut applied_ops = 0;

        for (index, batch) in batches.iter_mut().enumerate() {
            if budget.cancel.is_cancelled() {
                log::warn!("grant dispatch cancelled before batch {index}");
                return report(applied_batches, applied_ops, DispatchOutcome::Cancelled {
                    batch_index: index,
                });
            }
            let Some(timeout) = self.per_call_timeout(budget) else {
                log::warn!("grant dispatch deadline expired before batch {index}");
                return report(applied_batches, applied_ops, DispatchOutcome::DeadlineExceeded {
                    batch_index: index,
                });
            };

            match self.apply_batch(ledger, batch, auth, timeout, budget, index) {
                Ok(()) => {
                    batch.status = BatchStatus::Applied;
                    applied_batches += 1;
                    applied_ops += batch.operations.len();
                }
                Err(stop) => {
                    batch.status = BatchStatus::Failed;
                    return report(applied_batches, applied_ops, stop);
                }
            }
        }

        report(applied_batches, applied_ops, DispatchOutcome::Complete)
    }

    /// One batch with its retry loop. Returns the terminal outcome on failure.
    fn apply_batch<L: LedgerClient>(
        &self,
        ledger: &L,
        batch: &GrantBatch,
        auth: &LedgerAuth,
        first_timeout: Duration,
        budget: &DispatchBudget,
        index: usize,
    ) -> Result<(), DispatchOutcome> {
        let mut timeout = first_timeout;
        let mut attempt = 0u32;
        loop {
            log::debug!(
                "batch {index}: ops={} key={} attempt={attempt}",
                batch.operations.len(),
                batch.idempotency_key
            );
            let error = match ledger.execute_batch(batch, auth, timeout) {
                Ok(()) => {
                    log::info!(
                        "batch {index} applied: ops={} key={}",
                        batch.operations.len(),
                        batch.idempotency_key
                    );
                    return Ok(());
                }
                Err(error) => error,
            };

            if !error.is_transient() {
                log::error!("batch {index} rejected permanently: {error}");
                return Err(DispatchOutcome::PermanentFailure {
                    batch_index: index,
                    error,
                });
            }
            if attempt >= self.max_transient_retries {
                log::error!("batch {index} failed after {attempt} retries: {error}");
                return Err(DispatchOutcome::RetriesExhausted {
                    batch_index: index,
                    error,
                });
            }

            let backoff = self.retry_backoff * 2u32.saturating_pow(attempt);
            log::warn!("batch {index} transient failure ({error}); retrying in {backoff:?}");
            if let Some(remaining) = budget.remaining() {
                if remaining <= backoff {
                    return Err(DispatchOutcome::DeadlineExceeded { batch_index: index });
                }
            }
            std::thread::sleep(backoff);
            if budget.cancel.is_cancelled() {
                return Err(DispatchOutcome::Cancelled { batch_index: index });
            }
            timeout = match self.per_call_timeout(budget) {
                Some(t) => t,
                None => return Err(DispatchOutcome::DeadlineExceeded { batch_index: index }),
            };
            attempt += 1;
        }
    }

    /// Timeout for the next call, clipped to the remaining budget.
    /// `None` when the deadline has already passed.
    fn per_call_timeout(&self, budget: &DispatchBudget) -> Option<Duration> {
        match budget.remaining() {
            None => Some(self.call_timeout),
            Some(remaining) if remaining.is_zero() => None,
            Some(remaining) => Some(self.call_timeout.min(remaining)),
        }
    }
}

const fn report(
    applied_batches: usize,
    applied_ops: usize,
    outcome: DispatchOutcome,
) -> DispatchReport {
    DispatchReport {
        applied_batches,
        applied_ops,
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grant::aggregate;
    use crate::rewards::RewardItem;
    use std::cell::RefCell;

    /// Scriptable ledger: a queue of per-call results, recording every call.
    #[derive(Default)]
    struct ScriptedLedger {
        script: RefCell<Vec<Result<(), LedgerError>>>,
        calls: RefCell<Vec<String>>,
    }

    impl ScriptedLedger {
        fn with_script(script: Vec<Result<(), LedgerError>>) -> Self {
            Self {
                script: RefCell::new(script),
                calls: RefCell::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.borrow().len()
        }
    }

    impl LedgerClient for ScriptedLedger {
        fn execute_batch(
            &self,
            batch: &GrantBatch,
            _auth: &LedgerAuth,
            _timeout: Duration,
        ) -> Result<(), LedgerError> {
            self.calls.borrow_mut().push(batch.idempotency_key.clone());
            let mut script = self.script.borrow_mut();
            if script.is_empty() {
                Ok(())
            } else {
                script.remove(0)
            }
        }
    }

    fn batches(run_id: &str, items: usize, limit: usize) -> Vec<GrantBatch> {
        let rewards: Vec<RewardItem> = (0..items)
            .map(|i| RewardItem::new(format!("item-{i:03}"), 1))
            .collect();
        aggregate(run_id, &rewards, limit)
    }

    fn dispatcher() -> GrantDispatcher {
        GrantDispatcher::new(Duration::from_millis(100), 2, Duration::from_millis(1))
    }

    fn auth() -> LedgerAuth {
        LedgerAuth::new("player-1", "token-1")
    }

    #[test]
    fn all_batches_apply_in_order() {
        let ledger = ScriptedLedger::default();
        let mut b = batches("run-a", 120, 50);
        let report = dispatcher().dispatch(&ledger, &mut b, &auth(), &DispatchBudget::unbounded());
        assert!(report.is_complete());
        assert_eq!(report.applied_batches, 3);
        assert_eq!(report.applied_ops, 120);
        assert_eq!(
            *ledger.calls.borrow(),
            vec!["run-a_1", "run-a_2", "run-a_3"]
        );
        assert!(b.iter().all(|batch| batch.status == BatchStatus::Applied));
    }

    #[test]
    fn empty_batch_list_is_trivial_success() {
        let ledger = ScriptedLedger::default();
        let report =
            dispatcher().dispatch(&ledger, &mut [], &auth(), &DispatchBudget::unbounded());
        assert!(report.is_complete());
        assert_eq!(report.applied_ops, 0);
        assert_eq!(ledger.call_count(), 0);
    }

    #[test]
    fn permanent_failure_stops_without_retry() {
        let ledger = ScriptedLedger::with_script(vec![
            Ok(()),
            Err(LedgerError::Permanent {
                status: 400,
                message: "unknown item".to_string(),
            }),
        ]);
        let mut b = batches("run-b", 120, 50);
        let report = dispatcher().dispatch(&ledger, &mut b, &auth(), &DispatchBudget::unbounded());
        assert_eq!(report.applied_batches, 1);
        assert_eq!(report.applied_ops, 50);
        assert!(matches!(
            report.outcome,
            DispatchOutcome::PermanentFailure { batch_index: 1, .. }
        ));
        // Batch 2 failed on its single attempt; batch 3 was never tried.
        assert_eq!(ledger.call_count(), 2);
        assert_eq!(b[1].status, BatchStatus::Failed);
        assert_eq!(b[2].status, BatchStatus::Pending);
    }

    #[test]
    fn transient_failure_retries_same_key_then_succeeds() {
        let ledger = ScriptedLedger::with_script(vec![
            Err(LedgerError::Transient { status: 503 }),
            Err(LedgerError::Timeout),
            Ok(()),
        ]);
        let mut b = batches("run-c", 10, 50);
        let report = dispatcher().dispatch(&ledger, &mut b, &auth(), &DispatchBudget::unbounded());
        assert!(report.is_complete());
        assert_eq!(ledger.call_count(), 3);
        assert!(ledger.calls.borrow().iter().all(|key| key == "run-c"));
    }

    #[test]
    fn retries_exhaust_after_allowance() {
        let ledger = ScriptedLedger::with_script(vec![
            Err(LedgerError::Transient { status: 500 }),
            Err(LedgerError::Transient { status: 500 }),
            Err(LedgerError::Transient { status: 500 }),
        ]);
        let mut b = batches("run-d", 10, 50);
        let report = dispatcher().dispatch(&ledger, &mut b, &auth(), &DispatchBudget::unbounded());
        assert_eq!(
            report.outcome,
            DispatchOutcome::RetriesExhausted {
                batch_index: 0,
                error: LedgerError::Transient { status: 500 }
            }
        );
        // Initial attempt plus two retries.
        assert_eq!(ledger.call_count(), 3);
        assert_eq!(report.applied_ops, 0);
    }

    #[test]
    fn cancellation_stops_between_batches() {
        let ledger = ScriptedLedger::default();
        let mut b = batches("run-e", 120, 50);
        let budget = DispatchBudget::unbounded();
        budget.cancel.cancel();
        let report = dispatcher().dispatch(&ledger, &mut b, &auth(), &budget);
        assert_eq!(report.outcome, DispatchOutcome::Cancelled { batch_index: 0 });
        assert_eq!(ledger.call_count(), 0);
    }

    #[test]
    fn expired_deadline_stops_before_first_call() {
        let ledger = ScriptedLedger::default();
        let mut b = batches("run-f", 10, 50);
        let budget = DispatchBudget {
            deadline: Some(Instant::now()),
            cancel: CancelToken::new(),
        };
        let report = dispatcher().dispatch(&ledger, &mut b, &auth(), &budget);
        assert_eq!(
            report.outcome,
            DispatchOutcome::DeadlineExceeded { batch_index: 0 }
        );
        assert_eq!(ledger.call_count(), 0);
    }

    #[test]
    fn per_call_timeout_shrinks_to_remaining_budget() {
        let d = GrantDispatcher::new(Duration::from_secs(5), 0, Duration::from_millis(1));
        let budget = DispatchBudget::with_deadline(Duration::from_millis(50));
        let timeout = d.per_call_timeout(&budget).unwrap();
        assert!(timeout <= Duration::from_millis(50));
    }
}
