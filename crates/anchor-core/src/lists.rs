//! Unified block/productive lists.
//!
//! A [`UnifiedList`] groups everything the rule engine and session engine need
//! from configuration: when blocking applies, what is blocked, which paths are
//! carved out, and what counts as productive. Exactly one list is active.

use serde::{Deserialize, Serialize};

use crate::domain::{normalize_host, DomainPath};
use crate::schedule::ScheduleWindow;

/// When blocking is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockingMode {
    /// Never block (nuclear blocks still apply).
    Off,
    /// Block while a session is running.
    #[default]
    Manual,
    /// Block while a session is running; sessions follow the list's schedule.
    Scheduled,
    /// Always block.
    AlwaysOn,
}

impl BlockingMode {
    /// Returns true if blocking applies given the session state.
    pub fn is_blocking(self, session_active: bool) -> bool {
        match self {
            BlockingMode::Off => false,
            BlockingMode::Manual | BlockingMode::Scheduled => session_active,
            BlockingMode::AlwaysOn => true,
        }
    }

    /// Returns the mode as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockingMode::Off => "off",
            BlockingMode::Manual => "manual",
            BlockingMode::Scheduled => "scheduled",
            BlockingMode::AlwaysOn => "always-on",
        }
    }
}

impl std::fmt::Display for BlockingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How productive time is recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProductiveMode {
    /// Only listed productive sites/apps count.
    Whitelist,
    /// Everything counts unless it is blocked.
    #[default]
    AllExceptBlocked,
}

/// A named configuration unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UnifiedList {
    /// Stable identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// When blocking applies.
    pub blocking_mode: BlockingMode,
    /// Blocked domains.
    pub blocked_sites: Vec<String>,
    /// Blocked application names.
    pub blocked_apps: Vec<String>,
    /// Domain+path exceptions that are always allowed.
    pub allowed_paths: Vec<String>,
    /// Productive domains (whitelist mode).
    pub productive_sites: Vec<String>,
    /// Productive application names (whitelist mode).
    pub productive_apps: Vec<String>,
    /// How productive time is recognized.
    pub productive_mode: ProductiveMode,
    /// Focus windows for scheduled mode.
    pub schedules: Vec<ScheduleWindow>,
}

impl Default for UnifiedList {
    fn default() -> Self {
        Self {
            id: DEFAULT_LIST_ID.to_string(),
            name: "Default".to_string(),
            blocking_mode: BlockingMode::default(),
            blocked_sites: Vec::new(),
            blocked_apps: Vec::new(),
            allowed_paths: Vec::new(),
            productive_sites: Vec::new(),
            productive_apps: Vec::new(),
            productive_mode: ProductiveMode::default(),
            schedules: Vec::new(),
        }
    }
}

/// Identifier of the list created on first run.
pub const DEFAULT_LIST_ID: &str = "default";

impl UnifiedList {
    /// Creates an empty list with the given id and name.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Canonicalizes entries: hosts normalized, paths re-rendered, apps trimmed,
    /// blanks and duplicates removed (first occurrence wins).
    pub fn normalize(&mut self) {
        normalize_hosts(&mut self.blocked_sites);
        normalize_hosts(&mut self.productive_sites);
        normalize_apps(&mut self.blocked_apps);
        normalize_apps(&mut self.productive_apps);

        let mut paths: Vec<String> = self
            .allowed_paths
            .iter()
            .filter_map(|p| DomainPath::parse(p))
            .map(|p| p.to_string())
            .collect();
        dedup_in_order(&mut paths);
        self.allowed_paths = paths;
    }
}

fn normalize_hosts(hosts: &mut Vec<String>) {
    let mut out: Vec<String> = hosts
        .iter()
        .map(|h| normalize_host(h))
        .filter(|h| !h.is_empty())
        .collect();
    dedup_in_order(&mut out);
    *hosts = out;
}

fn normalize_apps(apps: &mut Vec<String>) {
    let mut out: Vec<String> = apps
        .iter()
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect();
    dedup_in_order(&mut out);
    *apps = out;
}

fn dedup_in_order(items: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    items.retain(|item| seen.insert(item.to_ascii_lowercase()));
}

/// Returns true if `app` is in `apps`, ignoring ASCII case.
pub fn app_in(app: &str, apps: &[String]) -> bool {
    let app = app.trim();
    !app.is_empty() && apps.iter().any(|a| a.trim().eq_ignore_ascii_case(app))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_mode_activity() {
        assert!(!BlockingMode::Off.is_blocking(true));
        assert!(BlockingMode::Manual.is_blocking(true));
        assert!(!BlockingMode::Manual.is_blocking(false));
        assert!(!BlockingMode::Scheduled.is_blocking(false));
        assert!(BlockingMode::AlwaysOn.is_blocking(false));
    }

    #[test]
    fn blocking_mode_serde_names() {
        let json = serde_json::to_string(&BlockingMode::AlwaysOn).unwrap();
        assert_eq!(json, "\"always-on\"");
        let mode: BlockingMode = serde_json::from_str("\"scheduled\"").unwrap();
        assert_eq!(mode, BlockingMode::Scheduled);
        assert_eq!(BlockingMode::AlwaysOn.to_string(), "always-on");
    }

    #[test]
    fn productive_mode_serde_names() {
        let json = serde_json::to_string(&ProductiveMode::AllExceptBlocked).unwrap();
        assert_eq!(json, "\"all-except-blocked\"");
    }

    #[test]
    fn normalize_cleans_entries() {
        let mut list = UnifiedList::new("work", "Work");
        list.blocked_sites = vec![
            "WWW.YouTube.com".into(),
            "youtube.com".into(),
            " ".into(),
            "reddit.com".into(),
        ];
        list.allowed_paths = vec![
            "https://www.youtube.com/veritasium/".into(),
            "youtube.com/veritasium".into(),
            "/nohost".into(),
        ];
        list.blocked_apps = vec![" Steam ".into(), "steam".into()];
        list.normalize();

        assert_eq!(list.blocked_sites, vec!["youtube.com", "reddit.com"]);
        assert_eq!(list.allowed_paths, vec!["youtube.com/veritasium"]);
        assert_eq!(list.blocked_apps, vec!["Steam"]);
    }

    #[test]
    fn missing_fields_default() {
        let list: UnifiedList = serde_json::from_str(r#"{"id":"x","blockedSites":["a.com"]}"#).unwrap();
        assert_eq!(list.id, "x");
        assert_eq!(list.name, "Default");
        assert_eq!(list.blocking_mode, BlockingMode::Manual);
        assert_eq!(list.blocked_sites, vec!["a.com"]);
        assert!(list.schedules.is_empty());
    }

    #[test]
    fn app_membership_ignores_case() {
        let apps = vec!["Discord".to_string()];
        assert!(app_in("discord", &apps));
        assert!(!app_in("", &apps));
        assert!(!app_in("Slack", &apps));
    }
}
