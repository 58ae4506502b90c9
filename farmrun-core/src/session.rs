//! Run-session lifecycle and time-window validation.
//!
//! A session is created once, ended at most once, and immutable afterward.
//! The server-observed elapsed time is the source of truth for validation;
//! the client-reported clear time is only a plausibility cross-check because
//! it is attacker-controlled.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::config::RunConfig;
use crate::rewards::RewardItem;

/// Lifecycle state of a run session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// Started and awaiting its end-run report.
    Created,
    /// Ended exactly once; terminal.
    Ended,
}

/// One timed play session, bounded by its configured duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSession {
    pub run_id: String,
    pub dungeon_id: String,
    /// Map-generation input handed to the client.
    pub seed: u32,
    /// Server timestamp taken at start; authoritative for elapsed time.
    pub started_at: DateTime<Utc>,
    /// Expected run length in seconds.
    pub duration_sec: u32,
    pub state: RunState,
}

impl RunSession {
    /// Build a fresh session in `Created` state.
    ///
    /// The run id combines the start timestamp with a random suffix so ids
    /// stay unique for the lifetime of the store.
    pub fn start<R: Rng + ?Sized>(
        dungeon_id: Option<String>,
        cfg: &RunConfig,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Self {
        let suffix: u64 = rng.r#gen();
        Self {
            run_id: format!("run-{}-{suffix:016x}", now.timestamp_millis()),
            dungeon_id: dungeon_id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| cfg.default_dungeon_id.clone()),
            seed: rng.r#gen(),
            started_at: now,
            duration_sec: cfg.run_duration_sec,
            state: RunState::Created,
        }
    }

    /// Server-observed elapsed seconds at `now`.
    #[must_use]
    pub fn elapsed_sec(&self, now: DateTime<Utc>) -> i64 {
        (now - self.started_at).num_seconds()
    }
}

/// Time-window violations, with the observed and expected values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("run cleared too fast: {elapsed_sec}s elapsed, at least {min_sec}s required")]
    TooFast { elapsed_sec: i64, min_sec: i64 },
    #[error("run overran its window: {elapsed_sec}s elapsed, at most {max_sec}s allowed")]
    TooSlow { elapsed_sec: i64, max_sec: i64 },
    #[error("elapsed time {elapsed_sec}s is below the sane floor of {floor_sec}s")]
    OutOfRange { elapsed_sec: i64, floor_sec: i64 },
}

/// Validate the session's time window against the server clock.
///
/// Returns the server-observed elapsed seconds on success. The client's
/// `clear_time_sec` never drives the decision; a large divergence from the
/// server observation is only logged.
///
/// # Errors
///
/// Returns `ValidationError` naming the specific violation: below the sane
/// floor, past the window for any outcome, or (for successful runs) short of
/// the full duration minus the buffer.
pub fn validate_window(
    session: &RunSession,
    success: bool,
    client_elapsed_sec: i64,
    now: DateTime<Utc>,
    cfg: &RunConfig,
) -> Result<i64, ValidationError> {
    let elapsed = session.elapsed_sec(now);
    let duration = i64::from(session.duration_sec);
    let buffer = i64::from(cfg.time_buffer_sec);
    let floor = i64::from(cfg.min_elapsed_sec);

    if (elapsed - client_elapsed_sec).abs() > buffer {
        log::warn!(
            "run {}: client reported {client_elapsed_sec}s but server observed {elapsed}s",
            session.run_id
        );
    }

    if elapsed < floor {
        return Err(ValidationError::OutOfRange {
            elapsed_sec: elapsed,
            floor_sec: floor,
        });
    }
    if elapsed > duration + buffer {
        return Err(ValidationError::TooSlow {
            elapsed_sec: elapsed,
            max_sec: duration + buffer,
        });
    }
    if success && elapsed < duration - buffer {
        return Err(ValidationError::TooFast {
            elapsed_sec: elapsed,
            min_sec: duration - buffer,
        });
    }
    Ok(elapsed)
}

/// Outcome fixed at the moment a session is marked ended.
///
/// Replayed end-run calls return this verbatim, and a grant that failed
/// partway can be resumed from the stored reward set without re-validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredOutcome {
    pub success: bool,
    /// Full computed reward set, fixed at end time.
    pub rewards: Vec<RewardItem>,
    /// Merged operations confirmed applied by the ledger so far.
    pub applied_ops: usize,
    pub ended_at: DateTime<Utc>,
}

/// Session store unavailability. Deterministic business failures have their
/// own types; this is strictly the collaborator being unreachable or corrupt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("session store error: {reason}")]
pub struct StoreError {
    pub reason: String,
}

impl StoreError {
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Result of the atomic end transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkEnded {
    /// This call won the transition; dispatch may proceed.
    Marked,
    /// A previous call already ended the session; replay the stored outcome.
    AlreadyEnded,
}

/// Persistent session store collaborator, keyed by run id.
///
/// `mark_ended` must be atomic: exactly one caller observes [`MarkEnded::Marked`]
/// for a given run, which is what keeps concurrent duplicate end-run calls
/// from double-dispatching.
pub trait SessionStore {
    /// Fetch a session by run id.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` when the store is unavailable.
    fn get(&self, run_id: &str) -> Result<Option<RunSession>, StoreError>;

    /// Persist a freshly created session.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` when the store is unavailable.
    fn create(&self, session: &RunSession) -> Result<(), StoreError>;

    /// Atomically transition Created to Ended, recording the outcome.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` when the store is unavailable or the run is
    /// unknown.
    fn mark_ended(&self, run_id: &str, outcome: &StoredOutcome) -> Result<MarkEnded, StoreError>;

    /// Stored outcome of an ended session, for replay.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` when the store is unavailable.
    fn stored_outcome(&self, run_id: &str) -> Result<Option<StoredOutcome>, StoreError>;

    /// Record confirmed grant progress after a dispatch pass.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` when the store is unavailable or the run is
    /// unknown.
    fn record_applied(&self, run_id: &str, applied_ops: usize) -> Result<(), StoreError>;
}

/// In-memory reference store. Suitable for tests and single-process
/// deployments; clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore {
    inner: Arc<Mutex<HashMap<String, (RunSession, Option<StoredOutcome>)>>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, (RunSession, Option<StoredOutcome>)>>, StoreError>
    {
        self.inner
            .lock()
            .map_err(|_| StoreError::new("session map poisoned"))
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, run_id: &str) -> Result<Option<RunSession>, StoreError> {
        Ok(self.lock()?.get(run_id).map(|(session, _)| session.clone()))
    }

    fn create(&self, session: &RunSession) -> Result<(), StoreError> {
        let mut map = self.lock()?;
        if map.contains_key(&session.run_id) {
            return Err(StoreError::new(format!(
                "duplicate run id {}",
                session.run_id
            )));
        }
        map.insert(session.run_id.clone(), (session.clone(), None));
        Ok(())
    }

    fn mark_ended(&self, run_id: &str, outcome: &StoredOutcome) -> Result<MarkEnded, StoreError> {
        let mut map = self.lock()?;
        let (session, stored) = map
            .get_mut(run_id)
            .ok_or_else(|| StoreError::new(format!("unknown run id {run_id}")))?;
        if session.state == RunState::Ended {
            return Ok(MarkEnded::AlreadyEnded);
        }
        session.state = RunState::Ended;
        *stored = Some(outcome.clone());
        Ok(MarkEnded::Marked)
    }

    fn stored_outcome(&self, run_id: &str) -> Result<Option<StoredOutcome>, StoreError> {
        Ok(self.lock()?.get(run_id).and_then(|(_, stored)| stored.clone()))
    }

    fn record_applied(&self, run_id: &str, applied_ops: usize) -> Result<(), StoreError> {
        let mut map = self.lock()?;
        let (_, stored) = map
            .get_mut(run_id)
            .ok_or_else(|| StoreError::new(format!("unknown run id {run_id}")))?;
        if let Some(outcome) = stored {
            outcome.applied_ops = outcome.applied_ops.max(applied_ops);
        }
        Ok(())
    }
}
