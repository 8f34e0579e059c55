//! API request and response models.

use std::collections::BTreeMap;

use anchor_core::nuclear::{NuclearSiteEntry, NuclearStage};
use anchor_storage::{DailyStats, SessionRecord};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Request body for POST /api/session/idle.
#[derive(Debug, Clone, Deserialize)]
pub struct IdleRequest {
    pub idle: bool,
}

/// Request body for POST /api/session/app.
#[derive(Debug, Clone, Deserialize)]
pub struct AppRequest {
    pub app: String,
}

/// Request body for POST /api/nuclear/{id}/block-again.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlockAgainRequest {
    /// Replaces the first cooldown when present.
    pub cooldown1_ms: Option<i64>,
}

/// Request body for the exception routes.
#[derive(Debug, Clone, Deserialize)]
pub struct ExceptionRequest {
    pub path: String,
}

/// Query string of the block pages.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PageQuery {
    pub domain: String,
}

/// A nuclear entry with its stage as of the request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NuclearSiteResponse {
    #[serde(flatten)]
    pub entry: NuclearSiteEntry,
    pub stage: NuclearStage,
    pub next_transition_at: Option<DateTime<Utc>>,
}

impl NuclearSiteResponse {
    pub fn at(entry: NuclearSiteEntry, now: DateTime<Utc>) -> Self {
        Self {
            stage: entry.stage_at(now),
            next_transition_at: entry.next_transition_at(now),
            entry,
        }
    }
}

/// Response for GET /api/nuclear.
#[derive(Debug, Clone, Serialize)]
pub struct NuclearListResponse {
    pub sites: Vec<NuclearSiteResponse>,
}

/// Response for POST /api/nuclear/{id}/unblock.
#[derive(Debug, Clone, Serialize)]
pub struct UnblockResponse {
    /// True when the entry had no second cooldown and is gone.
    pub removed: bool,
    pub site: NuclearSiteResponse,
}

/// Streak as seen today.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreakResponse {
    pub current_days: u32,
    pub best_days: u32,
    pub last_active_date: Option<NaiveDate>,
}

/// Response for GET /api/history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub session_history: Vec<SessionRecord>,
    pub daily_stats: BTreeMap<String, DailyStats>,
    pub today: DailyStats,
    pub streak: StreakResponse,
}
