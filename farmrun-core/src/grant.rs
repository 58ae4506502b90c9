//! Reward aggregation: merge, batch, and idempotency-key derivation.
//!
//! The merged set is ordered by item id, so recomputing the same logical
//! reward set always reproduces identical batch contents and keys. That
//! determinism is what makes resubmission after a crash or retry safe.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::rewards::RewardItem;

/// Lifecycle of a batch inside one dispatch pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Applied,
    Failed,
}

/// A bounded group of merged reward operations sent in one ledger call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantBatch {
    /// Deterministic token the ledger uses to de-duplicate retried calls.
    pub idempotency_key: String,
    /// Merged operations, ordered by item id, at most the per-call limit.
    pub operations: Vec<RewardItem>,
    pub status: BatchStatus,
}

impl GrantBatch {
    /// Number of operations carried by this batch.
    #[must_use]
    pub fn ops(&self) -> usize {
        self.operations.len()
    }
}

/// Merge duplicate item entries, summing amounts, ordered by item id.
///
/// Non-positive or empty-id entries were already filtered by the calculator,
/// but the merge drops any stragglers so the ledger never sees an invalid op.
#[must_use]
pub fn merge_rewards(rewards: &[RewardItem]) -> Vec<RewardItem> {
    let mut merged: BTreeMap<&str, RewardItem> = BTreeMap::new();
    for reward in rewards {
        let id = reward.item_id.trim();
        if id.is_empty() || reward.amount <= 0 {
            continue;
        }
        merged
            .entry(id)
            .and_modify(|entry| {
                entry.amount += reward.amount;
                if entry.display_name.is_none() {
                    entry.display_name.clone_from(&reward.display_name);
                }
            })
            .or_insert_with(|| RewardItem {
                item_id: id.to_string(),
                amount: reward.amount,
                display_name: reward.display_name.clone(),
            });
    }
    merged.into_values().collect()
}

/// Derive the idempotency key for one batch of a run's grant.
///
/// A single batch reuses the run id unchanged; multiple batches append a
/// 1-based sequence number so every chunk stays distinct across retries.
#[must_use]
pub fn idempotency_key(run_id: &str, batch_index: usize, batch_count: usize) -> String {
    if batch_count <= 1 {
        run_id.to_string()
    } else {
        format!("{run_id}_{}", batch_index + 1)
    }
}

/// Merge rewards and partition them into ledger-call-sized batches.
///
/// An empty merged set yields zero batches; dispatching nothing is a no-op
/// success for the caller.
#[must_use]
pub fn aggregate(run_id: &str, rewards: &[RewardItem], max_ops_per_call: usize) -> Vec<GrantBatch> {
    let merged = merge_rewards(rewards);
    if merged.is_empty() {
        return Vec::new();
    }

    let chunk = max_ops_per_call.max(1);
    let batch_count = merged.len().div_ceil(chunk);
    merged
        .chunks(chunk)
        .enumerate()
        .map(|(index, operations)| GrantBatch {
            idempotency_key: idempotency_key(run_id, index, batch_count),
            operations: operations.to_vec(),
            status: BatchStatus::Pending,
        })
        .collect()
}
