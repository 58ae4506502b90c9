//! Farmrun Core
//!
//! Platform-agnostic backend logic for timed farming-dungeon runs: the
//! session lifecycle, time-window validation, deterministic reward
//! computation, reward aggregation under the ledger's per-call operation
//! limit, and idempotent grant dispatch with partial-failure accounting.
//! Transport, identity, and the external economy ledger are collaborators
//! reached through the traits defined here.

pub mod config;
pub mod dispatch;
pub mod grant;
pub mod pipeline;
pub mod rewards;
pub mod session;

// Re-export commonly used types
pub use config::{RunConfig, RunConfigError};
pub use dispatch::{
    CancelToken, DispatchBudget, DispatchOutcome, DispatchReport, GrantDispatcher, LedgerAuth,
    LedgerClient, LedgerError,
};
pub use grant::{BatchStatus, GrantBatch, aggregate, idempotency_key, merge_rewards};
pub use pipeline::{EndRunError, EndRunOutcome, EndRunRequest, RunPipeline};
pub use rewards::{LootedItem, RewardItem, calculate_rewards};
pub use session::{
    MarkEnded, MemorySessionStore, RunSession, RunState, SessionStore, StoreError, StoredOutcome,
    ValidationError, validate_window,
};
