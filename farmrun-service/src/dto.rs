//! Wire DTOs for the caller-facing contract.
//!
//! Field names match the client's JSON exactly (camelCase), independent of
//! what transport carries the bytes.

use serde::{Deserialize, Serialize};

use farmrun_core::{LootedItem, RewardItem};

/// Start-run request body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunRequest {
    #[serde(default)]
    pub dungeon_id: Option<String>,
}

/// Start-run response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default)]
    pub seed: u32,
    /// Server clock at start, unix milliseconds.
    #[serde(default)]
    pub server_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dungeon_id: Option<String>,
    #[serde(default)]
    pub run_duration_sec: u32,
}

/// Client-reported loot claim as it appears on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LootedItemDto {
    #[serde(default)]
    pub item_id: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub container_id: Option<String>,
}

impl From<LootedItemDto> for LootedItem {
    fn from(dto: LootedItemDto) -> Self {
        Self {
            item_id: dto.item_id,
            amount: dto.amount,
            container_id: dto.container_id,
        }
    }
}

/// End-run request body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndRunRequest {
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub clear_time_sec: i64,
    #[serde(default)]
    pub looted_items: Vec<LootedItemDto>,
}

/// Granted reward as it appears on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardItemDto {
    pub item_id: String,
    pub amount: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl From<RewardItem> for RewardItemDto {
    fn from(reward: RewardItem) -> Self {
        Self {
            item_id: reward.item_id,
            amount: reward.amount,
            display_name: reward.display_name,
        }
    }
}

/// End-run response body. On partial grant failure `ok` is false while
/// `rewards` still lists the full computed set and `applied_count` says how
/// many merged operations actually landed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndRunResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub rewards: Vec<RewardItemDto>,
    #[serde(default)]
    pub applied_count: usize,
}
