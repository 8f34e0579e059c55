//! Focus session timer and reward economy.
//!
//! [`SessionState`] is the pure state machine: every method takes the current
//! monotonic instant and returns the events it produced. [`SessionEngine`] is
//! the actor that owns one `SessionState`, ticks it every 100ms, and serializes
//! ticks with site/app reports so elapsed time is always charged to the site
//! that was current while it elapsed.
//!
//! ## Accumulators
//!
//! - `work_timer_ms` grows while a session is active and not idle.
//! - `productive_ms` grows under the same condition while the current
//!   site/app counts as productive, so it never exceeds `work_timer_ms`.
//! - Every full `work_minutes` of productive time grants `reward_minutes` of
//!   break. Grants are computed from `productive_ms / chunk` against the
//!   number already paid, so one tick crossing two thresholds pays twice and
//!   no threshold is paid twice.
//! - During a break, time on a blocked site/app burns the banked reward.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::domain::{matches_any, normalize_host};
use crate::lists::{app_in, ProductiveMode, UnifiedList};
use crate::rule_engine::VisitSink;

/// Tick cadence of the session actor.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

const MS_PER_MINUTE: u64 = 60_000;

/// Session engine errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("a session is already running")]
    AlreadyActive,

    #[error("no session is running")]
    NotActive,

    #[error("a break is already running")]
    BreakActive,

    #[error("no break is running")]
    NoBreak,

    #[error("no reward time available")]
    NoReward,

    #[error("session engine has stopped")]
    EngineStopped,
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Live configuration the session engine works from.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Productive minutes needed per reward.
    pub work_minutes: u32,
    /// Break minutes granted per reward.
    pub reward_minutes: u32,
    /// How productive time is recognized.
    pub productive_mode: ProductiveMode,
    /// Productive domains.
    pub productive_sites: Vec<String>,
    /// Productive apps.
    pub productive_apps: Vec<String>,
    /// Blocked domains.
    pub blocked_sites: Vec<String>,
    /// Blocked apps.
    pub blocked_apps: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            work_minutes: 25,
            reward_minutes: 5,
            productive_mode: ProductiveMode::default(),
            productive_sites: Vec::new(),
            productive_apps: Vec::new(),
            blocked_sites: Vec::new(),
            blocked_apps: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// Builds the config from the active list and timer settings.
    pub fn from_list(list: &UnifiedList, work_minutes: u32, reward_minutes: u32) -> Self {
        Self {
            work_minutes,
            reward_minutes,
            productive_mode: list.productive_mode,
            productive_sites: list.productive_sites.clone(),
            productive_apps: list.productive_apps.clone(),
            blocked_sites: list.blocked_sites.clone(),
            blocked_apps: list.blocked_apps.clone(),
        }
    }

    fn work_chunk_ms(&self) -> u64 {
        self.work_minutes as u64 * MS_PER_MINUTE
    }

    fn reward_chunk_ms(&self) -> u64 {
        self.reward_minutes as u64 * MS_PER_MINUTE
    }
}

/// Snapshot of the session, published after every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionStatus {
    pub session_active: bool,
    pub session_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub work_timer_ms: u64,
    pub productive_ms: u64,
    pub reward_grant_count: u64,
    pub unused_reward_ms: u64,
    pub reward_earned_ms: u64,
    pub reward_active: bool,
    pub reward_burned_ms: u64,
    pub blocked_attempts: u64,
    pub is_idle: bool,
    pub current_site: Option<String>,
    pub current_app: Option<String>,
}

/// Something that happened to the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Started {
        session_id: String,
    },
    /// Carries the final snapshot taken before the session was cleared.
    Ended {
        summary: Box<SessionStatus>,
    },
    RewardGranted {
        grant_count: u64,
        amount_ms: u64,
    },
    BreakStarted {
        available_ms: u64,
    },
    BreakEnded {
        remaining_ms: u64,
    },
    /// The banked reward ran out; blocked apps should be closed.
    BreakExpired,
}

/// The session state machine.
#[derive(Debug, Clone)]
pub struct SessionState {
    status: SessionStatus,
    config: SessionConfig,
    last_tick: Option<Instant>,
}

impl SessionState {
    /// Creates an idle (no session) state.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            status: SessionStatus::default(),
            config,
            last_tick: None,
        }
    }

    /// Current status.
    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    /// Current config.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Replaces the live config. Applies from the next tick on.
    pub fn set_config(&mut self, config: SessionConfig) {
        self.config = config;
    }

    /// Advances the clock to `now`.
    pub fn tick(&mut self, now: Instant) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        // Only whole milliseconds are consumed; the remainder carries over.
        let elapsed = match self.last_tick {
            Some(prev) => {
                let ms = now.saturating_duration_since(prev).as_millis() as u64;
                self.last_tick = Some(prev + Duration::from_millis(ms));
                ms
            }
            None => {
                self.last_tick = Some(now);
                0
            }
        };

        if !self.status.session_active || self.status.is_idle || elapsed == 0 {
            return events;
        }

        self.status.work_timer_ms += elapsed;
        if self.is_currently_productive() {
            self.status.productive_ms += elapsed;
        }
        self.grant_rewards(&mut events);

        if self.status.reward_active && self.is_on_blocked() {
            let burn = elapsed.min(self.status.unused_reward_ms);
            self.status.unused_reward_ms -= burn;
            self.status.reward_burned_ms += burn;

            if self.status.unused_reward_ms == 0 {
                self.status.reward_active = false;
                tracing::info!(burned_ms = self.status.reward_burned_ms, "Break expired");
                events.push(SessionEvent::BreakExpired);
            }
        }

        events
    }

    fn grant_rewards(&mut self, events: &mut Vec<SessionEvent>) {
        let chunk = self.config.work_chunk_ms();
        if chunk == 0 {
            return;
        }

        let due = self.status.productive_ms / chunk;
        if due > self.status.reward_grant_count {
            let amount = (due - self.status.reward_grant_count) * self.config.reward_chunk_ms();
            self.status.reward_grant_count = due;
            self.status.unused_reward_ms += amount;
            self.status.reward_earned_ms += amount;

            tracing::info!(grant_count = due, amount_ms = amount, "Reward granted");
            events.push(SessionEvent::RewardGranted {
                grant_count: due,
                amount_ms: amount,
            });
        }
    }

    /// Returns true if the current site/app counts toward productive time.
    pub fn is_currently_productive(&self) -> bool {
        match self.config.productive_mode {
            ProductiveMode::Whitelist => {
                let site = self
                    .status
                    .current_site
                    .as_deref()
                    .is_some_and(|s| matches_any(s, &self.config.productive_sites));
                let app = self
                    .status
                    .current_app
                    .as_deref()
                    .is_some_and(|a| app_in(a, &self.config.productive_apps));
                site || app
            }
            ProductiveMode::AllExceptBlocked => !self.is_on_blocked(),
        }
    }

    fn is_on_blocked(&self) -> bool {
        let site = self
            .status
            .current_site
            .as_deref()
            .is_some_and(|s| matches_any(s, &self.config.blocked_sites));
        let app = self
            .status
            .current_app
            .as_deref()
            .is_some_and(|a| app_in(a, &self.config.blocked_apps));
        site || app
    }

    /// Records a visited host.
    pub fn report_site(&mut self, host: &str, now: Instant) -> Vec<SessionEvent> {
        let events = self.tick(now);
        let host = normalize_host(host);
        self.status.current_site = (!host.is_empty()).then_some(host);
        events
    }

    /// Records a visit that the rule engine blocked.
    pub fn report_blocked(&mut self, host: &str, now: Instant) -> Vec<SessionEvent> {
        let events = self.report_site(host, now);
        if self.status.session_active {
            self.status.blocked_attempts += 1;
        }
        events
    }

    /// Records the focused application.
    pub fn report_app(&mut self, app: &str, now: Instant) -> Vec<SessionEvent> {
        let events = self.tick(now);
        let app = app.trim();
        self.status.current_app = (!app.is_empty()).then(|| app.to_string());
        events
    }

    /// Freezes or resumes the accumulators.
    pub fn set_idle(&mut self, idle: bool, now: Instant) -> Vec<SessionEvent> {
        let events = if idle {
            self.tick(now)
        } else {
            // Idle time is never charged.
            self.last_tick = Some(now);
            Vec::new()
        };
        self.status.is_idle = idle;
        events
    }

    /// Starts a new session.
    pub fn start(&mut self, now: Instant, wall: DateTime<Utc>) -> Result<Vec<SessionEvent>> {
        if self.status.session_active {
            return Err(SessionError::AlreadyActive);
        }

        let session_id = generate_session_id(wall);
        self.status = SessionStatus {
            session_active: true,
            session_id: Some(session_id.clone()),
            started_at: Some(wall),
            current_site: self.status.current_site.take(),
            current_app: self.status.current_app.take(),
            ..SessionStatus::default()
        };
        self.last_tick = Some(now);

        tracing::info!(session_id = %session_id, "Session started");
        Ok(vec![SessionEvent::Started { session_id }])
    }

    /// Starts a break using the banked reward.
    pub fn start_break(&mut self, now: Instant) -> Result<Vec<SessionEvent>> {
        if !self.status.session_active {
            return Err(SessionError::NotActive);
        }
        if self.status.reward_active {
            return Err(SessionError::BreakActive);
        }

        let mut events = self.tick(now);
        if self.status.unused_reward_ms == 0 {
            return Err(SessionError::NoReward);
        }

        self.status.reward_active = true;
        tracing::info!(available_ms = self.status.unused_reward_ms, "Break started");
        events.push(SessionEvent::BreakStarted {
            available_ms: self.status.unused_reward_ms,
        });
        Ok(events)
    }

    /// Ends a break early, keeping what is left of the reward.
    pub fn end_break(&mut self, now: Instant) -> Result<Vec<SessionEvent>> {
        if !self.status.reward_active {
            return Err(SessionError::NoBreak);
        }

        let mut events = self.tick(now);
        // The tick may have burned the last of the reward.
        if !self.status.reward_active {
            return Ok(events);
        }

        self.status.reward_active = false;
        tracing::info!(remaining_ms = self.status.unused_reward_ms, "Break ended early");
        events.push(SessionEvent::BreakEnded {
            remaining_ms: self.status.unused_reward_ms,
        });
        Ok(events)
    }

    /// Ends the session, returning the final snapshot.
    pub fn end(&mut self, now: Instant) -> Result<(SessionStatus, Vec<SessionEvent>)> {
        if !self.status.session_active {
            return Err(SessionError::NotActive);
        }

        let mut events = self.tick(now);
        let summary = self.status.clone();

        self.status = SessionStatus {
            current_site: self.status.current_site.take(),
            current_app: self.status.current_app.take(),
            ..SessionStatus::default()
        };
        self.last_tick = None;

        tracing::info!(
            session_id = summary.session_id.as_deref().unwrap_or_default(),
            work_ms = summary.work_timer_ms,
            productive_ms = summary.productive_ms,
            "Session ended"
        );
        events.push(SessionEvent::Ended {
            summary: Box::new(summary.clone()),
        });
        Ok((summary, events))
    }
}

/// Generates an id like `sess_<millis>_<hex>`.
fn generate_session_id(now: DateTime<Utc>) -> String {
    format!("sess_{}_{:016x}", now.timestamp_millis(), rand::random::<u64>())
}

enum Command {
    Start(oneshot::Sender<Result<SessionStatus>>),
    End(oneshot::Sender<Result<SessionStatus>>),
    StartBreak(oneshot::Sender<Result<SessionStatus>>),
    EndBreak(oneshot::Sender<Result<SessionStatus>>),
    SetConfig(SessionConfig, oneshot::Sender<()>),
    SetIdle(bool),
    ReportSite(String),
    ReportBlocked(String),
    ReportApp(String),
}

/// Handle to the session actor.
///
/// Cloning the handle is cheap; every clone talks to the same actor.
#[derive(Clone)]
pub struct SessionEngine {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionEngine {
    /// Spawns the actor. Events go out on `events`.
    pub fn spawn(
        config: SessionConfig,
        events: broadcast::Sender<SessionEvent>,
    ) -> (Self, JoinHandle<()>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(SessionStatus::default());

        let actor = Actor {
            state: SessionState::new(config),
            status: status_tx,
            events,
        };
        let handle = tokio::spawn(actor.run(rx));

        (Self { commands, status }, handle)
    }

    /// Latest published status.
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Watches status changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Starts a session.
    pub async fn start(&self) -> Result<SessionStatus> {
        self.request(Command::Start).await?
    }

    /// Ends the session and returns its final snapshot.
    pub async fn end(&self) -> Result<SessionStatus> {
        self.request(Command::End).await?
    }

    /// Starts a break.
    pub async fn start_break(&self) -> Result<SessionStatus> {
        self.request(Command::StartBreak).await?
    }

    /// Ends the running break early.
    pub async fn end_break(&self) -> Result<SessionStatus> {
        self.request(Command::EndBreak).await?
    }

    /// Replaces the live config; resolves once the actor has applied it.
    pub async fn set_config(&self, config: SessionConfig) -> Result<()> {
        self.request(|reply| Command::SetConfig(config, reply)).await
    }

    /// Marks the user idle or active.
    pub fn set_idle(&self, idle: bool) {
        self.send(Command::SetIdle(idle));
    }

    /// Reports the focused application.
    pub fn report_app(&self, app: &str) {
        self.send(Command::ReportApp(app.to_string()));
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| SessionError::EngineStopped)?;
        rx.await.map_err(|_| SessionError::EngineStopped)
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::warn!("Session engine has stopped, dropping report");
        }
    }
}

impl VisitSink for SessionEngine {
    fn visit(&self, host: &str) {
        self.send(Command::ReportSite(host.to_string()));
    }

    fn blocked(&self, host: &str) {
        self.send(Command::ReportBlocked(host.to_string()));
    }
}

struct Actor {
    state: SessionState,
    status: watch::Sender<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let events = self.state.tick(Instant::now());
                    self.publish(events);
                }
                command = rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
        }

        tracing::debug!("Session engine stopped");
    }

    fn handle(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::Start(reply) => {
                let result = self.state.start(now, Utc::now());
                self.reply(reply, result);
            }
            Command::End(reply) => {
                let result = self.state.end(now).map(|(summary, events)| {
                    self.publish(events);
                    summary
                });
                let _ = reply.send(result);
            }
            Command::StartBreak(reply) => {
                let result = self.state.start_break(now);
                self.reply(reply, result);
            }
            Command::EndBreak(reply) => {
                let result = self.state.end_break(now);
                self.reply(reply, result);
            }
            Command::SetConfig(config, reply) => {
                let events = self.state.tick(now);
                self.state.set_config(config);
                self.publish(events);
                let _ = reply.send(());
            }
            Command::SetIdle(idle) => {
                let events = self.state.set_idle(idle, now);
                self.publish(events);
            }
            Command::ReportSite(host) => {
                let events = self.state.report_site(&host, now);
                self.publish(events);
            }
            Command::ReportBlocked(host) => {
                let events = self.state.report_blocked(&host, now);
                self.publish(events);
            }
            Command::ReportApp(app) => {
                let events = self.state.report_app(&app, now);
                self.publish(events);
            }
        }
    }

    fn reply(
        &self,
        reply: oneshot::Sender<Result<SessionStatus>>,
        result: Result<Vec<SessionEvent>>,
    ) {
        let result = result.map(|events| {
            self.publish(events);
            self.state.status().clone()
        });
        let _ = reply.send(result);
    }

    /// Publishes the status before the events, so event listeners see it.
    fn publish(&self, events: Vec<SessionEvent>) {
        let current = self.state.status();
        self.status.send_if_modified(|published| {
            if published != current {
                *published = current.clone();
                true
            } else {
                false
            }
        });

        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig {
            work_minutes: 1,
            reward_minutes: 2,
            blocked_sites: vec!["youtube.com".into()],
            blocked_apps: vec!["Steam".into()],
            productive_sites: vec!["github.com".into()],
            productive_apps: vec!["Code".into()],
            ..SessionConfig::default()
        }
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn started(config: SessionConfig) -> (SessionState, Instant) {
        let mut state = SessionState::new(config);
        let t0 = Instant::now();
        state.start(t0, Utc::now()).unwrap();
        (state, t0)
    }

    #[test]
    fn work_timer_freezes_while_idle_or_inactive() {
        let mut state = SessionState::new(config());
        let t0 = Instant::now();
        state.tick(t0 + secs(5));
        assert_eq!(state.status().work_timer_ms, 0);

        state.start(t0 + secs(5), Utc::now()).unwrap();
        state.tick(t0 + secs(15));
        assert_eq!(state.status().work_timer_ms, 10_000);

        state.set_idle(true, t0 + secs(20));
        state.tick(t0 + secs(100));
        assert_eq!(state.status().work_timer_ms, 15_000);

        // Resuming does not charge the idle stretch.
        state.set_idle(false, t0 + secs(200));
        state.tick(t0 + secs(201));
        assert_eq!(state.status().work_timer_ms, 16_000);
    }

    #[test]
    fn work_timer_never_decreases() {
        let (mut state, t0) = started(config());
        let mut last = 0;
        for i in 1..50u64 {
            // Out-of-order instants must not subtract time.
            let at = if i % 7 == 0 { t0 } else { t0 + Duration::from_millis(i * 130) };
            state.tick(at);
            assert!(state.status().work_timer_ms >= last);
            last = state.status().work_timer_ms;
        }
    }

    #[test]
    fn productive_never_exceeds_work() {
        let (mut state, t0) = started(config());
        let sites = ["github.com", "youtube.com", "example.com", "music.youtube.com"];
        for (i, site) in sites.iter().cycle().take(40).enumerate() {
            let at = t0 + Duration::from_millis(250 * (i as u64 + 1));
            state.report_site(site, at);
            if i % 3 == 0 {
                state.report_app(if i % 2 == 0 { "Steam" } else { "Code" }, at);
            }
            let s = state.status();
            assert!(s.productive_ms <= s.work_timer_ms);
        }
    }

    #[test]
    fn all_except_blocked_mode() {
        let (mut state, t0) = started(config());
        state.report_site("example.com", t0);
        state.tick(t0 + secs(10));
        assert_eq!(state.status().productive_ms, 10_000);

        state.report_site("m.youtube.com", t0 + secs(10));
        state.tick(t0 + secs(20));
        assert_eq!(state.status().productive_ms, 10_000);
        assert_eq!(state.status().work_timer_ms, 20_000);

        // A blocked app also makes the time unproductive.
        state.report_site("example.com", t0 + secs(20));
        state.report_app("steam", t0 + secs(20));
        state.tick(t0 + secs(30));
        assert_eq!(state.status().productive_ms, 10_000);
    }

    #[test]
    fn whitelist_mode() {
        let mut cfg = config();
        cfg.productive_mode = ProductiveMode::Whitelist;
        let (mut state, t0) = started(cfg);

        state.report_site("example.com", t0);
        state.tick(t0 + secs(10));
        assert_eq!(state.status().productive_ms, 0);

        state.report_site("gist.github.com", t0 + secs(10));
        state.tick(t0 + secs(20));
        assert_eq!(state.status().productive_ms, 10_000);

        state.report_site("example.com", t0 + secs(20));
        state.report_app("code", t0 + secs(20));
        state.tick(t0 + secs(30));
        assert_eq!(state.status().productive_ms, 20_000);
    }

    #[test]
    fn time_is_charged_to_previous_site() {
        let (mut state, t0) = started(config());
        state.report_site("example.com", t0);
        // Ten seconds on example.com, then switch to a blocked site.
        state.report_site("youtube.com", t0 + secs(10));
        assert_eq!(state.status().productive_ms, 10_000);
    }

    #[test]
    fn reward_granted_once_per_threshold() {
        let (mut state, t0) = started(config());
        let events = state.tick(t0 + Duration::from_millis(59_999));
        assert!(events.is_empty());

        let events = state.tick(t0 + Duration::from_millis(60_001));
        assert_eq!(
            events,
            vec![SessionEvent::RewardGranted {
                grant_count: 1,
                amount_ms: 120_000
            }]
        );

        let events = state.tick(t0 + Duration::from_millis(60_100));
        assert!(events.is_empty());
        assert_eq!(state.status().reward_grant_count, 1);
        assert_eq!(state.status().unused_reward_ms, 120_000);
    }

    #[test]
    fn one_tick_crossing_two_thresholds_pays_both() {
        let (mut state, t0) = started(config());
        let events = state.tick(t0 + secs(125));
        assert_eq!(
            events,
            vec![SessionEvent::RewardGranted {
                grant_count: 2,
                amount_ms: 240_000
            }]
        );
        assert_eq!(state.status().reward_earned_ms, 240_000);
    }

    #[test]
    fn break_requires_active_session_and_reward() {
        let mut state = SessionState::new(config());
        let t0 = Instant::now();
        assert_eq!(state.start_break(t0), Err(SessionError::NotActive));

        state.start(t0, Utc::now()).unwrap();
        assert_eq!(state.start_break(t0 + secs(1)), Err(SessionError::NoReward));

        state.tick(t0 + secs(60));
        assert!(state.start_break(t0 + secs(60)).is_ok());
        assert_eq!(state.start_break(t0 + secs(61)), Err(SessionError::BreakActive));
    }

    #[test]
    fn break_burns_only_on_blocked() {
        let (mut state, t0) = started(config());
        state.tick(t0 + secs(60));
        state.start_break(t0 + secs(60)).unwrap();

        state.report_site("example.com", t0 + secs(60));
        state.tick(t0 + secs(70));
        assert_eq!(state.status().unused_reward_ms, 120_000);

        state.report_site("youtube.com", t0 + secs(70));
        state.tick(t0 + secs(100));
        assert_eq!(state.status().unused_reward_ms, 90_000);
        assert_eq!(state.status().reward_burned_ms, 30_000);
        assert!(state.status().reward_burned_ms <= state.status().reward_earned_ms);
    }

    #[test]
    fn break_expires_when_reward_runs_out() {
        let (mut state, t0) = started(config());
        state.tick(t0 + secs(60));
        state.start_break(t0 + secs(60)).unwrap();
        state.report_site("youtube.com", t0 + secs(60));

        let events = state.tick(t0 + secs(500));
        assert!(events.contains(&SessionEvent::BreakExpired));
        let s = state.status();
        assert!(!s.reward_active);
        assert_eq!(s.unused_reward_ms, 0);
        assert_eq!(s.reward_burned_ms, 120_000);
    }

    #[test]
    fn end_break_keeps_remainder() {
        let (mut state, t0) = started(config());
        state.tick(t0 + secs(60));
        assert_eq!(state.end_break(t0 + secs(60)), Err(SessionError::NoBreak));

        state.start_break(t0 + secs(60)).unwrap();
        let events = state.end_break(t0 + secs(61)).unwrap();
        assert_eq!(
            events,
            vec![SessionEvent::BreakEnded {
                remaining_ms: 120_000
            }]
        );
        assert!(!state.status().reward_active);
    }

    #[test]
    fn end_flushes_final_tick_and_clears() {
        let (mut state, t0) = started(config());
        state.report_blocked("youtube.com", t0);
        let (summary, events) = state.end(t0 + secs(30)).unwrap();

        assert_eq!(summary.work_timer_ms, 30_000);
        assert_eq!(summary.blocked_attempts, 1);
        assert!(summary.session_id.is_some());
        assert!(matches!(events.last(), Some(SessionEvent::Ended { .. })));

        let s = state.status();
        assert!(!s.session_active);
        assert_eq!(s.session_id, None);
        assert_eq!(s.work_timer_ms, 0);
        assert_eq!(s.current_site.as_deref(), Some("youtube.com"));
        assert_eq!(state.end(t0 + secs(31)).unwrap_err(), SessionError::NotActive);
    }

    #[test]
    fn blocked_attempts_only_count_in_session() {
        let mut state = SessionState::new(config());
        let t0 = Instant::now();
        state.report_blocked("youtube.com", t0);
        assert_eq!(state.status().blocked_attempts, 0);

        state.start(t0, Utc::now()).unwrap();
        state.report_blocked("youtube.com", t0);
        assert_eq!(state.status().blocked_attempts, 1);
        assert_eq!(state.start(t0, Utc::now()), Err(SessionError::AlreadyActive));
    }

    #[test]
    fn status_serializes_camel_case() {
        let json = serde_json::to_value(SessionStatus::default()).unwrap();
        assert!(json.get("workTimerMs").is_some());
        assert!(json.get("rewardActive").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn engine_ticks_and_reports() {
        let (events_tx, mut events_rx) = broadcast::channel(16);
        let (engine, handle) = SessionEngine::spawn(config(), events_tx);

        let status = engine.start().await.unwrap();
        assert!(status.session_active);
        assert!(matches!(events_rx.recv().await, Ok(SessionEvent::Started { .. })));

        engine.visit("example.com");
        tokio::time::sleep(secs(61)).await;

        let status = engine.status();
        assert!(status.work_timer_ms >= 60_000);
        assert_eq!(status.current_site.as_deref(), Some("example.com"));
        assert!(matches!(
            events_rx.recv().await,
            Ok(SessionEvent::RewardGranted { grant_count: 1, .. })
        ));

        engine.blocked("youtube.com");
        let summary = engine.end().await.unwrap();
        assert_eq!(summary.blocked_attempts, 1);
        assert!(!engine.status().session_active);

        drop(engine);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn engine_set_config_applies_before_returning() {
        let (events_tx, _) = broadcast::channel(16);
        let (engine, _handle) = SessionEngine::spawn(SessionConfig::default(), events_tx);

        engine.set_config(config()).await.unwrap();
        engine.start().await.unwrap();
        tokio::time::sleep(secs(61)).await;
        assert_eq!(engine.status().reward_grant_count, 1);
        assert_eq!(engine.end_break().await, Err(SessionError::NoBreak));
        assert!(engine.start_break().await.is_ok());
    }
}
