//! Nuclear blocks: cooldown-gated, hard-to-reverse domain blocks.
//!
//! ## Lifecycle
//!
//! Stage is derived from timestamps on every read and never stored:
//!
//! - `locked`: less than `cooldown1_ms` since `added_at`
//! - `ready`: cooldown 1 has elapsed and nobody has clicked unblock
//! - `unblocking`: unblock clicked, less than `cooldown2_ms` ago
//! - `confirm`: cooldown 2 has elapsed, waiting for the destructive confirm
//!
//! Every stage blocks. An entry only disappears through [`NuclearBlockStore::confirm_unblock`]
//! (or an immediate click-unblock when `cooldown2_ms <= 0`), and
//! [`NuclearBlockStore::block_again`] re-arms it back to `locked`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::{host_matches_normalized, normalize_host, DomainPath};

/// Longest accepted cooldown: one year.
pub const MAX_COOLDOWN_MS: i64 = 366 * 24 * 60 * 60 * 1000;

/// Derived lifecycle position of a nuclear entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NuclearStage {
    /// Waiting out the first cooldown.
    Locked,
    /// First cooldown elapsed; unblock may be clicked.
    Ready,
    /// Unblock clicked; waiting out the second cooldown.
    Unblocking,
    /// Second cooldown elapsed; awaiting confirmation.
    Confirm,
}

impl NuclearStage {
    /// Returns the stage as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            NuclearStage::Locked => "locked",
            NuclearStage::Ready => "ready",
            NuclearStage::Unblocking => "unblocking",
            NuclearStage::Confirm => "confirm",
        }
    }

    /// Every stage an entry can be in keeps blocking.
    pub fn is_blocking(&self) -> bool {
        true
    }
}

impl std::fmt::Display for NuclearStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A persisted nuclear block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NuclearSiteEntry {
    /// Unique identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Normalized domains, never empty.
    pub domains: Vec<String>,
    /// When the entry was added or last re-armed.
    pub added_at: DateTime<Utc>,
    /// First cooldown.
    pub cooldown1_ms: i64,
    /// Second cooldown, after unblock is clicked.
    pub cooldown2_ms: i64,
    /// When unblock was clicked.
    #[serde(default)]
    pub unblock_clicked_at: Option<DateTime<Utc>>,
    /// Domain+path prefixes that stay reachable.
    #[serde(default)]
    pub exceptions: Vec<String>,
}

impl NuclearSiteEntry {
    /// Computes the stage at `now`.
    pub fn stage_at(&self, now: DateTime<Utc>) -> NuclearStage {
        match self.unblock_clicked_at {
            Some(clicked) => {
                if (now - clicked).num_milliseconds() >= self.cooldown2_ms {
                    NuclearStage::Confirm
                } else {
                    NuclearStage::Unblocking
                }
            }
            None => {
                if (now - self.added_at).num_milliseconds() >= self.cooldown1_ms {
                    NuclearStage::Ready
                } else {
                    NuclearStage::Locked
                }
            }
        }
    }

    /// Returns when the next stage change happens, if one is pending.
    pub fn next_transition_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.stage_at(now) {
            NuclearStage::Locked => Some(offset_by(self.added_at, self.cooldown1_ms)),
            NuclearStage::Unblocking => self
                .unblock_clicked_at
                .map(|clicked| offset_by(clicked, self.cooldown2_ms)),
            NuclearStage::Ready | NuclearStage::Confirm => None,
        }
    }

    /// Returns true if the host is one of the entry's domains or a subdomain.
    pub fn matches_host(&self, host: &str) -> bool {
        let host = normalize_host(host);
        self.domains.iter().any(|d| host_matches_normalized(&host, d))
    }

    /// Parses and validates an exception against the entry's domains.
    fn validate_exception(&self, path: &str) -> Result<DomainPath> {
        let rule = DomainPath::parse(path).ok_or_else(|| NuclearError::InvalidException {
            path: path.to_string(),
            reason: "no domain in exception".to_string(),
        })?;

        if self.domains.iter().any(|d| host_matches_normalized(&rule.host, d)) {
            Ok(rule)
        } else {
            Err(NuclearError::InvalidException {
                path: path.to_string(),
                reason: format!("{} is not one of {}", rule.host, self.domains.join(", ")),
            })
        }
    }
}

/// Request to create a nuclear block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewNuclearSite {
    /// Display name; defaults to the first domain.
    pub name: String,
    /// Domains to block.
    pub domains: Vec<String>,
    /// First cooldown.
    pub cooldown1_ms: i64,
    /// Second cooldown.
    pub cooldown2_ms: i64,
    /// Initial exceptions.
    pub exceptions: Vec<String>,
}

/// Outcome of clicking unblock.
#[derive(Debug, Clone, PartialEq)]
pub enum UnblockOutcome {
    /// The second cooldown has started.
    Unblocking(NuclearSiteEntry),
    /// No second cooldown; the entry was removed.
    Removed(NuclearSiteEntry),
}

/// Errors from nuclear block mutations.
#[derive(Debug, Error, PartialEq)]
pub enum NuclearError {
    #[error("nuclear block needs at least one domain")]
    NoDomains,

    #[error("domains already covered by nuclear block {0}")]
    AlreadyCovered(String),

    #[error("nuclear block not found: {0}")]
    NotFound(String),

    #[error("invalid exception {path}: {reason}")]
    InvalidException { path: String, reason: String },

    #[error("exception not found: {0}")]
    ExceptionNotFound(String),

    #[error("nuclear block {id} is {stage}, not ready")]
    NotReady { id: String, stage: NuclearStage },

    #[error("cooldown must not be negative")]
    NegativeCooldown,

    #[error("cooldown must not exceed {max_ms} ms")]
    CooldownTooLong { max_ms: i64 },
}

/// Result type for nuclear store operations.
pub type Result<T> = std::result::Result<T, NuclearError>;

/// Owns the nuclear entries and announces every change.
///
/// Mutations are validated before anything is touched, so a rejected call
/// leaves the store as it was. Successful mutations bump the revision seen by
/// [`NuclearBlockStore::subscribe`].
pub struct NuclearBlockStore {
    entries: Mutex<Vec<NuclearSiteEntry>>,
    revision: watch::Sender<u64>,
}

impl NuclearBlockStore {
    /// Creates a store from persisted entries, dropping any without domains.
    pub fn new(entries: Vec<NuclearSiteEntry>) -> Self {
        let entries = entries
            .into_iter()
            .filter_map(|mut entry| {
                entry.domains = normalize_domains(&entry.domains);
                entry.cooldown1_ms = entry.cooldown1_ms.clamp(0, MAX_COOLDOWN_MS);
                entry.cooldown2_ms = entry.cooldown2_ms.clamp(0, MAX_COOLDOWN_MS);
                if entry.domains.is_empty() {
                    tracing::warn!(id = %entry.id, "Dropping nuclear block with no domains");
                    None
                } else {
                    Some(entry)
                }
            })
            .collect();

        let (revision, _) = watch::channel(0);
        Self {
            entries: Mutex::new(entries),
            revision,
        }
    }

    /// Subscribes to change notifications.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Returns a copy of every entry.
    pub fn entries(&self) -> Vec<NuclearSiteEntry> {
        self.entries.lock().clone()
    }

    /// Puts back a copy taken with [`NuclearBlockStore::entries`].
    ///
    /// Used to undo an in-memory change that could not be saved.
    pub fn restore(&self, entries: Vec<NuclearSiteEntry>) {
        *self.entries.lock() = entries;
        tracing::debug!("Nuclear blocks restored from copy");
        self.bump();
    }

    /// Returns one entry by id.
    pub fn get(&self, id: &str) -> Option<NuclearSiteEntry> {
        self.entries.lock().iter().find(|e| e.id == id).cloned()
    }

    /// Adds a new block.
    pub fn add(&self, site: NewNuclearSite, now: DateTime<Utc>) -> Result<NuclearSiteEntry> {
        let domains = normalize_domains(&site.domains);
        if domains.is_empty() {
            return Err(NuclearError::NoDomains);
        }
        check_cooldown(site.cooldown1_ms)?;
        check_cooldown(site.cooldown2_ms)?;

        let name = if site.name.trim().is_empty() {
            domains[0].clone()
        } else {
            site.name.trim().to_string()
        };

        let mut entry = NuclearSiteEntry {
            id: generate_id(now),
            name,
            domains,
            added_at: now,
            cooldown1_ms: site.cooldown1_ms,
            cooldown2_ms: site.cooldown2_ms,
            unblock_clicked_at: None,
            exceptions: Vec::new(),
        };
        for path in &site.exceptions {
            let rule = entry.validate_exception(path)?.to_string();
            if !entry.exceptions.contains(&rule) {
                entry.exceptions.push(rule);
            }
        }

        {
            let mut entries = self.entries.lock();
            if let Some(existing) = entries.iter().find(|e| {
                entry
                    .domains
                    .iter()
                    .all(|d| e.domains.iter().any(|ed| host_matches_normalized(d, ed)))
            }) {
                return Err(NuclearError::AlreadyCovered(existing.id.clone()));
            }
            entries.push(entry.clone());
        }

        tracing::info!(id = %entry.id, domains = ?entry.domains, "Nuclear block added");
        self.bump();
        Ok(entry)
    }

    /// Starts the second cooldown, or removes the entry outright if it has none.
    pub fn click_unblock(&self, id: &str, now: DateTime<Utc>) -> Result<UnblockOutcome> {
        let outcome = {
            let mut entries = self.entries.lock();
            let idx = find_index(&entries, id)?;

            let stage = entries[idx].stage_at(now);
            if stage != NuclearStage::Ready {
                return Err(NuclearError::NotReady {
                    id: id.to_string(),
                    stage,
                });
            }

            if entries[idx].cooldown2_ms <= 0 {
                UnblockOutcome::Removed(entries.remove(idx))
            } else {
                entries[idx].unblock_clicked_at = Some(now);
                UnblockOutcome::Unblocking(entries[idx].clone())
            }
        };

        match &outcome {
            UnblockOutcome::Removed(_) => tracing::info!(id, "Nuclear block removed on unblock"),
            UnblockOutcome::Unblocking(_) => tracing::info!(id, "Nuclear unblock started"),
        }
        self.bump();
        Ok(outcome)
    }

    /// Removes the entry. The caller is trusted to have reached `confirm`.
    pub fn confirm_unblock(&self, id: &str) -> Result<NuclearSiteEntry> {
        let removed = {
            let mut entries = self.entries.lock();
            let idx = find_index(&entries, id)?;
            entries.remove(idx)
        };

        tracing::info!(id, "Nuclear block confirmed and removed");
        self.bump();
        Ok(removed)
    }

    /// Re-arms the entry back to `locked`.
    pub fn block_again(
        &self,
        id: &str,
        cooldown1_ms: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<NuclearSiteEntry> {
        if let Some(ms) = cooldown1_ms {
            check_cooldown(ms)?;
        }

        let entry = self.mutate(id, |entry| {
            entry.added_at = now;
            entry.unblock_clicked_at = None;
            if let Some(ms) = cooldown1_ms {
                entry.cooldown1_ms = ms;
            }
            Ok(())
        })?;

        tracing::info!(id, cooldown1_ms = entry.cooldown1_ms, "Nuclear block re-armed");
        Ok(entry)
    }

    /// Adds a path exception to the entry.
    pub fn add_exception(&self, id: &str, path: &str) -> Result<NuclearSiteEntry> {
        self.mutate(id, |entry| {
            let rule = entry.validate_exception(path)?.to_string();
            if !entry.exceptions.contains(&rule) {
                entry.exceptions.push(rule);
            }
            Ok(())
        })
    }

    /// Removes a path exception from the entry.
    pub fn remove_exception(&self, id: &str, path: &str) -> Result<NuclearSiteEntry> {
        self.mutate(id, |entry| {
            let rendered = DomainPath::parse(path)
                .map(|p| p.to_string())
                .unwrap_or_else(|| path.trim().to_string());
            let before = entry.exceptions.len();
            entry.exceptions.retain(|e| *e != rendered);
            if entry.exceptions.len() == before {
                return Err(NuclearError::ExceptionNotFound(path.to_string()));
            }
            Ok(())
        })
    }

    /// Earliest pending stage change across all entries.
    pub fn next_transition_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.entries
            .lock()
            .iter()
            .filter_map(|e| e.next_transition_at(now))
            .min()
    }

    /// Spawns a task that bumps the revision when a cooldown expires.
    ///
    /// The timer re-plans after every change, so adding a block with a short
    /// cooldown wakes it early.
    pub fn spawn_wakeup_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let mut changes = self.subscribe();

        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let sleep_for = store
                    .next_transition_at(now)
                    .map(|at| (at - now).to_std().unwrap_or_default());

                match sleep_for {
                    Some(wait) => {
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {
                                tracing::debug!("Nuclear cooldown elapsed");
                                store.bump();
                                // Skip the notification we just sent ourselves.
                                changes.borrow_and_update();
                            }
                            changed = changes.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    None => {
                        if changes.changed().await.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    }

    fn mutate<F>(&self, id: &str, f: F) -> Result<NuclearSiteEntry>
    where
        F: FnOnce(&mut NuclearSiteEntry) -> Result<()>,
    {
        let updated = {
            let mut entries = self.entries.lock();
            let idx = find_index(&entries, id)?;
            let mut candidate = entries[idx].clone();
            f(&mut candidate)?;
            entries[idx] = candidate.clone();
            candidate
        };
        self.bump();
        Ok(updated)
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev = rev.wrapping_add(1));
    }
}

fn find_index(entries: &[NuclearSiteEntry], id: &str) -> Result<usize> {
    entries
        .iter()
        .position(|e| e.id == id)
        .ok_or_else(|| NuclearError::NotFound(id.to_string()))
}

fn check_cooldown(ms: i64) -> Result<()> {
    if ms < 0 {
        Err(NuclearError::NegativeCooldown)
    } else if ms > MAX_COOLDOWN_MS {
        Err(NuclearError::CooldownTooLong {
            max_ms: MAX_COOLDOWN_MS,
        })
    } else {
        Ok(())
    }
}

/// `start + ms`, saturating at the end of the representable range.
fn offset_by(start: DateTime<Utc>, ms: i64) -> DateTime<Utc> {
    Duration::try_milliseconds(ms)
        .and_then(|delta| start.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn normalize_domains(domains: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for domain in domains {
        let host = normalize_host(domain);
        if !host.is_empty() && !out.contains(&host) {
            out.push(host);
        }
    }
    out
}

/// Generates an id like `nuc_<millis>_<hex>`.
fn generate_id(now: DateTime<Utc>) -> String {
    format!("nuc_{}_{:08x}", now.timestamp_millis(), rand::random::<u32>())
}
