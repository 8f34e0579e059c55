//! Rule engine: decides allow / block / nuclear-block for one request.
//!
//! [`evaluate`] is a pure function of the URL and a [`BlockingState`]
//! snapshot. The proxy calls it on every request; nothing here does I/O or
//! holds mutable state.
//!
//! ## Evaluation Order
//!
//! 1. Nuclear blocks (any stage), unless a nuclear exception covers the path
//! 2. Allowed-path exceptions
//! 3. Blocking inactive for the current mode
//! 4. Active break (reward)
//! 5. Blocked sites
//! 6. Default allow
//!
//! The first matching step decides.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{host_matches_normalized, normalize_host, DomainPath, RequestTarget};
use crate::lists::{BlockingMode, UnifiedList};
use crate::nuclear::{NuclearSiteEntry, NuclearStage};
use crate::session::SessionStatus;

/// Receives visit reports from the proxy.
pub trait VisitSink: Send + Sync {
    /// A non-loopback host was requested.
    fn visit(&self, host: &str);

    /// A request to `host` was redirected to a block page.
    fn blocked(&self, host: &str);
}

/// A nuclear entry as the rule engine sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NuclearSiteView {
    pub id: String,
    pub name: String,
    pub domains: Vec<String>,
    pub stage: NuclearStage,
}

/// Everything needed to evaluate one request.
///
/// Rebuilt from config, session status, and nuclear entries whenever any of
/// them changes; never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockingState {
    pub session_active: bool,
    pub reward_active: bool,
    pub blocked_sites: Vec<String>,
    pub allowed_paths: Vec<DomainPath>,
    pub nuclear_sites: Vec<NuclearSiteView>,
    pub nuclear_exceptions: Vec<DomainPath>,
    pub blocking_mode: BlockingMode,
}

impl BlockingState {
    /// Assembles a snapshot from its sources.
    pub fn assemble(
        list: &UnifiedList,
        session: &SessionStatus,
        nuclear: &[NuclearSiteEntry],
        now: DateTime<Utc>,
    ) -> Self {
        let nuclear_sites = nuclear
            .iter()
            .map(|entry| NuclearSiteView {
                id: entry.id.clone(),
                name: entry.name.clone(),
                domains: entry.domains.iter().map(|d| normalize_host(d)).collect(),
                stage: entry.stage_at(now),
            })
            .collect();

        let mut nuclear_exceptions: Vec<DomainPath> = nuclear
            .iter()
            .flat_map(|entry| entry.exceptions.iter())
            .filter_map(|path| DomainPath::parse(path))
            .collect();
        nuclear_exceptions.sort();
        nuclear_exceptions.dedup();

        Self {
            session_active: session.session_active,
            reward_active: session.reward_active,
            blocked_sites: list
                .blocked_sites
                .iter()
                .map(|s| normalize_host(s))
                .filter(|s| !s.is_empty())
                .collect(),
            allowed_paths: list
                .allowed_paths
                .iter()
                .filter_map(|p| DomainPath::parse(p))
                .collect(),
            nuclear_sites,
            nuclear_exceptions,
            blocking_mode: list.blocking_mode,
        }
    }

    /// Returns true if list blocking applies right now.
    pub fn is_blocking(&self) -> bool {
        self.blocking_mode.is_blocking(self.session_active)
    }
}

/// What to do with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleAction {
    /// Forward the request.
    #[default]
    Allow,
    /// Redirect to the blocked page.
    Block,
    /// Redirect to a nuclear page.
    NuclearBlock,
}

impl RuleAction {
    /// Returns true for either kind of block.
    pub fn is_block(&self) -> bool {
        !matches!(self, RuleAction::Allow)
    }
}

/// Which step of the evaluation decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    NuclearException,
    NuclearBlocked,
    AllowedPath,
    BlockingInactive,
    RewardActive,
    BlockedSite,
    NotListed,
}

impl DecisionReason {
    /// Human-readable reason.
    pub fn describe(&self) -> &'static str {
        match self {
            DecisionReason::NuclearException => "nuclear exception",
            DecisionReason::NuclearBlocked => "nuclear block",
            DecisionReason::AllowedPath => "allowed path",
            DecisionReason::BlockingInactive => "blocking inactive",
            DecisionReason::RewardActive => "reward active",
            DecisionReason::BlockedSite => "blocked site",
            DecisionReason::NotListed => "not listed",
        }
    }
}

/// Local page a blocked request is sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockPage {
    Blocked,
    NuclearBlocked,
    NuclearLastChance,
}

impl BlockPage {
    /// File name served by the web server.
    pub fn file_name(&self) -> &'static str {
        match self {
            BlockPage::Blocked => "blocked.html",
            BlockPage::NuclearBlocked => "nuclear-blocked.html",
            BlockPage::NuclearLastChance => "nuclear-block-last-chance.html",
        }
    }
}

/// Where a blocked request is redirected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectTarget {
    pub page: BlockPage,
    pub domain: String,
}

impl RedirectTarget {
    /// Absolute URL on the local web server.
    ///
    /// # Examples
    ///
    /// ```
    /// use anchor_core::rule_engine::{BlockPage, RedirectTarget};
    ///
    /// let target = RedirectTarget { page: BlockPage::Blocked, domain: "youtube.com".into() };
    /// assert_eq!(target.url(8767), "http://localhost:8767/blocked.html?domain=youtube.com");
    /// ```
    pub fn url(&self, web_port: u16) -> String {
        format!(
            "http://localhost:{}/{}?domain={}",
            web_port,
            self.page.file_name(),
            encode_query_value(&self.domain)
        )
    }
}

fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b':' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Result of evaluating one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub action: RuleAction,
    pub reason: DecisionReason,
    pub redirect: Option<RedirectTarget>,
}

impl Decision {
    fn allow(reason: DecisionReason) -> Self {
        Self {
            action: RuleAction::Allow,
            reason,
            redirect: None,
        }
    }

    fn redirect(action: RuleAction, reason: DecisionReason, page: BlockPage, host: &str) -> Self {
        Self {
            action,
            reason,
            redirect: Some(RedirectTarget {
                page,
                domain: host.to_string(),
            }),
        }
    }
}

/// Evaluates a URL against the snapshot.
///
/// # Examples
///
/// ```
/// use anchor_core::rule_engine::{evaluate, BlockingState, RuleAction};
/// use anchor_core::lists::BlockingMode;
///
/// let state = BlockingState {
///     session_active: true,
///     blocked_sites: vec!["youtube.com".into()],
///     blocking_mode: BlockingMode::Manual,
///     ..Default::default()
/// };
/// assert_eq!(evaluate("https://music.youtube.com/", &state).action, RuleAction::Block);
/// assert_eq!(evaluate("https://github.com/", &state).action, RuleAction::Allow);
/// ```
pub fn evaluate(url: &str, state: &BlockingState) -> Decision {
    match RequestTarget::parse(url) {
        Some(target) => evaluate_target(&target.host, &target.path, state),
        None => Decision::allow(DecisionReason::NotListed),
    }
}

/// Evaluates an already split host and path.
pub fn evaluate_target(host: &str, path: &str, state: &BlockingState) -> Decision {
    let host = normalize_host(host);
    let path = if path.is_empty() { "/" } else { path };

    if let Some(site) = state.nuclear_sites.iter().find(|site| {
        site.stage.is_blocking() && site.domains.iter().any(|d| host_matches_normalized(&host, d))
    }) {
        if state.nuclear_exceptions.iter().any(|e| e.matches(&host, path)) {
            return Decision::allow(DecisionReason::NuclearException);
        }

        let page = match site.stage {
            NuclearStage::Confirm => BlockPage::NuclearLastChance,
            _ => BlockPage::NuclearBlocked,
        };
        return Decision::redirect(
            RuleAction::NuclearBlock,
            DecisionReason::NuclearBlocked,
            page,
            &host,
        );
    }

    if state.allowed_paths.iter().any(|p| p.matches(&host, path)) {
        return Decision::allow(DecisionReason::AllowedPath);
    }

    if !state.is_blocking() {
        return Decision::allow(DecisionReason::BlockingInactive);
    }

    if state.reward_active {
        return Decision::allow(DecisionReason::RewardActive);
    }

    if state.blocked_sites.iter().any(|s| host_matches_normalized(&host, s)) {
        return Decision::redirect(
            RuleAction::Block,
            DecisionReason::BlockedSite,
            BlockPage::Blocked,
            &host,
        );
    }

    Decision::allow(DecisionReason::NotListed)
}
