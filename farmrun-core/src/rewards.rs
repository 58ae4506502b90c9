//! Reward computation from a validated run outcome.
//!
//! The calculator is pure and deterministic: identical inputs always yield
//! the same list, which the aggregator relies on for stable idempotency keys.

use serde::{Deserialize, Serialize};

use crate::config::RunConfig;

/// Client-submitted loot claim. Untrusted input; each entry is validated
/// independently and invalid entries are dropped rather than failing the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LootedItem {
    pub item_id: String,
    pub amount: i64,
    /// Provenance tag (which container dropped it). Informational only.
    #[serde(default)]
    pub container_id: Option<String>,
}

impl LootedItem {
    /// Construct a claim without provenance.
    #[must_use]
    pub fn new(item_id: impl Into<String>, amount: i64) -> Self {
        Self {
            item_id: item_id.into(),
            amount,
            container_id: None,
        }
    }

    /// Whether this claim survives per-entry validation.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.item_id.trim().is_empty() && self.amount > 0
    }
}

/// Canonical unit of value transfer granted to the player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardItem {
    pub item_id: String,
    pub amount: i64,
    /// Cosmetic name; resolution belongs to the item catalog, not this crate.
    #[serde(default)]
    pub display_name: Option<String>,
}

impl RewardItem {
    /// Construct a reward without a display name.
    #[must_use]
    pub fn new(item_id: impl Into<String>, amount: i64) -> Self {
        Self {
            item_id: item_id.into(),
            amount,
            display_name: None,
        }
    }
}

/// Map a validated run outcome and its accepted loot claims to rewards.
///
/// A failed run earns nothing; callers must not assume a consolation grant
/// exists. A successful run keeps every valid claim and appends the
/// configured base currency grant.
#[must_use]
pub fn calculate_rewards(success: bool, looted: &[LootedItem], cfg: &RunConfig) -> Vec<RewardItem> {
    if !success {
        return Vec::new();
    }

    let mut rewards: Vec<RewardItem> = looted
        .iter()
        .filter(|item| item.is_valid())
        .map(|item| RewardItem::new(item.item_id.trim(), item.amount))
        .collect();

    rewards.push(RewardItem::new(
        cfg.base_reward_item.clone(),
        cfg.base_reward_amount,
    ));
    rewards
}
