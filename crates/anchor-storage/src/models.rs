//! Data models for the persisted document.

use std::collections::BTreeMap;

use anchor_core::lists::{UnifiedList, DEFAULT_LIST_ID};
use anchor_core::nuclear::NuclearSiteEntry;
use anchor_core::session::{SessionConfig, SessionStatus};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Current document schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Default proxy listen port.
pub const DEFAULT_PROXY_PORT: u16 = 8766;

/// Default block-page / control API port.
pub const DEFAULT_WEB_PORT: u16 = 8767;

/// The root persisted document.
///
/// Every field has a default, so a document missing keys still loads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageData {
    /// Document schema version.
    pub schema_version: u32,
    /// Productive minutes per reward.
    pub work_minutes: u32,
    /// Break minutes per reward.
    pub reward_minutes: u32,
    /// Configured lists.
    pub lists: Vec<UnifiedList>,
    /// Id of the list in effect.
    pub active_list_id: String,
    /// Nuclear blocks.
    pub nuclear_sites: Vec<NuclearSiteEntry>,
    /// Finished sessions, oldest first.
    pub session_history: Vec<SessionRecord>,
    /// Per-day totals keyed by local `YYYY-MM-DD`.
    pub daily_stats: BTreeMap<String, DailyStats>,
    /// Consecutive-day streak.
    pub streak: Streak,
    /// Status as of the last session event, for crash forensics.
    pub last_session_snapshot: Option<SessionStatus>,
    /// Proxy listen port.
    pub proxy_port: u16,
    /// Web server port.
    pub web_port: u16,
}

impl Default for StorageData {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            work_minutes: 25,
            reward_minutes: 5,
            lists: vec![UnifiedList::default()],
            active_list_id: DEFAULT_LIST_ID.to_string(),
            nuclear_sites: Vec::new(),
            session_history: Vec::new(),
            daily_stats: BTreeMap::new(),
            streak: Streak::default(),
            last_session_snapshot: None,
            proxy_port: DEFAULT_PROXY_PORT,
            web_port: DEFAULT_WEB_PORT,
        }
    }
}

impl StorageData {
    /// Returns the active list, falling back to the first list.
    pub fn active_list(&self) -> UnifiedList {
        self.lists
            .iter()
            .find(|l| l.id == self.active_list_id)
            .or_else(|| self.lists.first())
            .cloned()
            .unwrap_or_default()
    }

    /// Session engine config for the active list.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::from_list(&self.active_list(), self.work_minutes, self.reward_minutes)
    }
}

/// One finished session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub list_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    pub work_ms: u64,
    pub productive_ms: u64,
    pub reward_earned_ms: u64,
    pub reward_burned_ms: u64,
    pub blocked_attempts: u64,
}

impl SessionRecord {
    /// Builds a record from a session's final snapshot.
    ///
    /// Returns `None` for a snapshot that never had a session id.
    pub fn from_summary(summary: &SessionStatus, list_id: &str, ended_at: DateTime<Utc>) -> Option<Self> {
        let session_id = summary.session_id.clone()?;
        Some(Self {
            session_id,
            list_id: list_id.to_string(),
            started_at: summary.started_at,
            ended_at,
            work_ms: summary.work_timer_ms,
            productive_ms: summary.productive_ms,
            reward_earned_ms: summary.reward_earned_ms,
            reward_burned_ms: summary.reward_burned_ms,
            blocked_attempts: summary.blocked_attempts,
        })
    }
}

/// Totals for one local day.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DailyStats {
    pub sessions: u32,
    pub work_ms: u64,
    pub productive_ms: u64,
    pub blocked_attempts: u64,
    pub breaks_taken: u32,
}

/// Consecutive days with at least one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Streak {
    pub current_days: u32,
    pub best_days: u32,
    pub last_active_date: Option<NaiveDate>,
}
