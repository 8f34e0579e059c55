//! Shared application state for the control API.
//!
//! [`Controller`] owns the live pieces: the document store, the session actor,
//! the nuclear store and the snapshot the proxy reads. Every mutation goes
//! through it, persists first, then pushes the change into the session config
//! and the snapshot before returning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anchor_core::lists::{BlockingMode, UnifiedList};
use anchor_core::nuclear::{
    NewNuclearSite, NuclearBlockStore, NuclearError, NuclearSiteEntry, UnblockOutcome,
};
use anchor_core::rule_engine::{BlockingState, VisitSink};
use anchor_core::schedule::any_active_at;
use anchor_core::session::{SessionEngine, SessionEvent, SessionStatus};
use anchor_proxy::StateCache;
use anchor_storage::history::{self, record_break, record_session};
use anchor_storage::{PersistentStore, SessionRecord, StorageData};
use chrono::{DateTime, Local, NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{ApiError, Result};
use crate::models::{HistoryResponse, StreakResponse};

/// How often the schedule watcher checks the active list's windows.
pub const SCHEDULE_INTERVAL: Duration = Duration::from_secs(30);

/// Capacity of the session event channel.
const EVENT_CAPACITY: usize = 64;

/// Document keys that only the server itself writes.
const PROTECTED_KEYS: &[&str] = &[
    "schemaVersion",
    "nuclearSites",
    "sessionHistory",
    "dailyStats",
    "streak",
    "lastSessionSnapshot",
];

/// Shared application state.
///
/// Cloning is cheap; every clone drives the same session and store.
#[derive(Clone)]
pub struct Controller {
    store: Arc<PersistentStore>,
    session: SessionEngine,
    nuclear: Arc<NuclearBlockStore>,
    cache: StateCache,
    events: broadcast::Sender<SessionEvent>,
    /// Active list, cached so rebuilds don't clone the whole document.
    active_list: Arc<RwLock<UnifiedList>>,
    /// Set while the running session was started by the schedule watcher.
    schedule_owned: Arc<AtomicBool>,
    /// Held across a nuclear change and the write that saves it.
    nuclear_lock: Arc<tokio::sync::Mutex<()>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Controller {
    /// Builds the live state from the document and spawns the background
    /// tasks. Must be called inside a tokio runtime.
    pub fn spawn(store: Arc<PersistentStore>) -> Self {
        let data = store.get_all();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (session, session_task) = SessionEngine::spawn(data.session_config(), events.clone());
        let nuclear = Arc::new(NuclearBlockStore::new(data.nuclear_sites.clone()));
        let active_list = data.active_list();

        let cache = StateCache::new(BlockingState::assemble(
            &active_list,
            &session.status(),
            &nuclear.entries(),
            Utc::now(),
        ));

        let controller = Self {
            store,
            session,
            nuclear,
            cache,
            events,
            active_list: Arc::new(RwLock::new(active_list)),
            schedule_owned: Arc::new(AtomicBool::new(false)),
            nuclear_lock: Arc::new(tokio::sync::Mutex::new(())),
            tasks: Arc::new(Mutex::new(Vec::new())),
        };

        let tasks = vec![
            session_task,
            controller.nuclear.spawn_wakeup_timer(),
            controller.spawn_rebuilder(),
            controller.spawn_snapshot_writer(),
            controller.spawn_schedule_watcher(),
        ];
        *controller.tasks.lock() = tasks;

        info!(
            list = %controller.active_list.read().id,
            nuclear = controller.nuclear.entries().len(),
            "Controller started"
        );
        controller
    }

    /// Snapshot cache shared with the proxy.
    pub fn cache(&self) -> StateCache {
        self.cache.clone()
    }

    /// Visit sink for the proxy.
    pub fn visit_sink(&self) -> Arc<dyn VisitSink> {
        Arc::new(self.session.clone())
    }

    /// Subscribes to session events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Reassembles the blocking state and swaps it in if it changed.
    pub fn rebuild(&self) -> bool {
        let next = BlockingState::assemble(
            &self.active_list.read(),
            &self.session.status(),
            &self.nuclear.entries(),
            Utc::now(),
        );

        if *self.cache.snapshot() == next {
            return false;
        }

        let generation = self.cache.replace(next);
        debug!(generation, "Blocking state rebuilt");
        true
    }

    // Session

    pub fn session_status(&self) -> SessionStatus {
        self.session.status()
    }

    pub async fn start_session(&self) -> Result<SessionStatus> {
        let status = self.session.start().await?;
        self.rebuild();
        Ok(status)
    }

    /// Ends the session and records it in the history.
    pub async fn end_session(&self) -> Result<SessionStatus> {
        let summary = self.session.end().await?;
        self.schedule_owned.store(false, Ordering::SeqCst);

        let list_id = self.active_list.read().id.clone();
        if let Some(record) = SessionRecord::from_summary(&summary, &list_id, Utc::now()) {
            let day = Local::now().date_naive();
            self.store
                .update(move |data| record_session(data, record, day))
                .await?;
        }

        self.rebuild();
        Ok(summary)
    }

    pub async fn start_break(&self) -> Result<SessionStatus> {
        let status = self.session.start_break().await?;

        let day = Local::now().date_naive();
        self.store.update(move |data| record_break(data, day)).await?;

        self.rebuild();
        Ok(status)
    }

    pub async fn end_break(&self) -> Result<SessionStatus> {
        let status = self.session.end_break().await?;
        self.rebuild();
        Ok(status)
    }

    pub fn set_idle(&self, idle: bool) {
        self.session.set_idle(idle);
    }

    pub fn report_app(&self, app: &str) {
        self.session.report_app(app);
    }

    // Config

    pub fn config(&self) -> StorageData {
        self.store.get_all()
    }

    /// Shallow-merges `partial` into the document and applies it.
    pub async fn update_config(&self, partial: Value) -> Result<StorageData> {
        if let Value::Object(map) = &partial {
            if let Some(key) = PROTECTED_KEYS.iter().find(|k| map.contains_key(**k)) {
                return Err(ApiError::BadRequest(format!("{key} cannot be set directly")));
            }
        }

        let data = self.store.set(partial).await?;
        self.apply_config(&data).await?;
        Ok(data)
    }

    /// Restores defaults in one write. Nuclear blocks survive a reset.
    pub async fn reset_config(&self) -> Result<StorageData> {
        {
            let _guard = self.nuclear_lock.lock().await;
            self.store
                .update(|data| {
                    let nuclear_sites = std::mem::take(&mut data.nuclear_sites);
                    *data = StorageData {
                        nuclear_sites,
                        ..StorageData::default()
                    };
                })
                .await?;
        }

        let data = self.store.get_all();
        self.apply_config(&data).await?;
        Ok(data)
    }

    async fn apply_config(&self, data: &StorageData) -> Result<()> {
        *self.active_list.write() = data.active_list();
        self.session.set_config(data.session_config()).await?;
        self.rebuild();
        Ok(())
    }

    // Nuclear

    pub fn nuclear_sites(&self) -> Vec<NuclearSiteEntry> {
        self.nuclear.entries()
    }

    pub async fn add_nuclear(&self, site: NewNuclearSite) -> Result<NuclearSiteEntry> {
        self.mutate_nuclear(|nuclear| nuclear.add(site, Utc::now()))
            .await
    }

    pub async fn click_unblock(&self, id: &str) -> Result<UnblockOutcome> {
        self.mutate_nuclear(|nuclear| nuclear.click_unblock(id, Utc::now()))
            .await
    }

    pub async fn confirm_unblock(&self, id: &str) -> Result<NuclearSiteEntry> {
        self.mutate_nuclear(|nuclear| nuclear.confirm_unblock(id))
            .await
    }

    pub async fn block_again(&self, id: &str, cooldown1_ms: Option<i64>) -> Result<NuclearSiteEntry> {
        self.mutate_nuclear(|nuclear| nuclear.block_again(id, cooldown1_ms, Utc::now()))
            .await
    }

    pub async fn add_exception(&self, id: &str, path: &str) -> Result<NuclearSiteEntry> {
        self.mutate_nuclear(|nuclear| nuclear.add_exception(id, path))
            .await
    }

    pub async fn remove_exception(&self, id: &str, path: &str) -> Result<NuclearSiteEntry> {
        self.mutate_nuclear(|nuclear| nuclear.remove_exception(id, path))
            .await
    }

    /// Applies a nuclear change and saves it before anyone else can.
    ///
    /// The entries are read under the store's write lock, so saves land in
    /// the order the changes were made. A change that cannot be saved is
    /// undone in memory.
    async fn mutate_nuclear<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&NuclearBlockStore) -> std::result::Result<T, NuclearError>,
    {
        let _guard = self.nuclear_lock.lock().await;
        let before = self.nuclear.entries();
        let value = f(self.nuclear.as_ref())?;

        let nuclear = Arc::clone(&self.nuclear);
        let saved = self
            .store
            .update(move |data| data.nuclear_sites = nuclear.entries())
            .await;
        if let Err(e) = saved {
            warn!("Failed to save nuclear blocks, undoing change: {}", e);
            self.nuclear.restore(before);
            self.rebuild();
            return Err(e.into());
        }

        self.rebuild();
        Ok(value)
    }

    // History

    pub fn history(&self, today: NaiveDate) -> HistoryResponse {
        let data = self.store.get_all();
        HistoryResponse {
            today: history::stats_for(&data, today),
            streak: StreakResponse {
                current_days: data.streak.current_at(today),
                best_days: data.streak.best_days,
                last_active_date: data.streak.last_active_date,
            },
            session_history: data.session_history,
            daily_stats: data.daily_stats,
        }
    }

    // Schedule

    /// Starts or ends a session to follow the active list's schedule.
    ///
    /// Only sessions this watcher started are ended by it.
    pub async fn check_schedule(&self, now: DateTime<Local>) {
        let in_window = {
            let list = self.active_list.read();
            list.blocking_mode == BlockingMode::Scheduled && any_active_at(&list.schedules, &now)
        };
        let active = self.session.status().session_active;

        if in_window && !active {
            match self.session.start().await {
                Ok(status) => {
                    self.schedule_owned.store(true, Ordering::SeqCst);
                    info!(
                        session_id = status.session_id.as_deref().unwrap_or_default(),
                        "Scheduled session started"
                    );
                    self.rebuild();
                }
                Err(e) => warn!("Failed to start scheduled session: {}", e),
            }
        } else if !in_window && active && self.schedule_owned.load(Ordering::SeqCst) {
            info!("Schedule window closed, ending session");
            if let Err(e) = self.end_session().await {
                warn!("Failed to end scheduled session: {}", e);
            }
        }
    }

    /// Ends a running session so it lands in the history, then stops the
    /// background tasks.
    pub async fn shutdown(&self) {
        if self.session.status().session_active {
            if let Err(e) = self.end_session().await {
                warn!("Failed to record session on shutdown: {}", e);
            }
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("Controller stopped");
    }

    fn spawn_rebuilder(&self) -> JoinHandle<()> {
        let this = self.clone();
        let mut status = self.session.subscribe();
        let mut revision = self.nuclear.subscribe();

        tokio::spawn(async move {
            loop {
                let changed = tokio::select! {
                    changed = status.changed() => changed,
                    changed = revision.changed() => changed,
                };
                if changed.is_err() {
                    break;
                }
                this.rebuild();
            }
        })
    }

    fn spawn_snapshot_writer(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let session = self.session.clone();
        let mut events = self.events.subscribe();

        tokio::spawn(async move {
            loop {
                let snapshot = match events.recv().await {
                    Ok(SessionEvent::Ended { summary }) => *summary,
                    Ok(_) => session.status(),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Session event listener lagged");
                        session.status()
                    }
                    Err(RecvError::Closed) => break,
                };

                if let Err(e) = store
                    .update(move |data| data.last_session_snapshot = Some(snapshot))
                    .await
                {
                    warn!("Failed to persist session snapshot: {}", e);
                }
            }
        })
    }

    fn spawn_schedule_watcher(&self) -> JoinHandle<()> {
        let this = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SCHEDULE_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                this.check_schedule(Local::now()).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use anchor_core::schedule::{ScheduleWindow, TimeOfDay, Weekday};
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    async fn controller() -> (Controller, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = PersistentStore::open(dir.path().join("anchor.json"))
            .await
            .unwrap();
        (Controller::spawn(Arc::new(store)), dir)
    }

    fn list(mode: BlockingMode, blocked: &[&str]) -> UnifiedList {
        UnifiedList {
            blocking_mode: mode,
            blocked_sites: blocked.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn nuclear_site(domain: &str, cooldown1_ms: i64) -> NewNuclearSite {
        NewNuclearSite {
            domains: vec![domain.to_string()],
            cooldown1_ms,
            cooldown2_ms: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn config_update_reaches_snapshot() {
        let (controller, _dir) = controller().await;
        assert!(!controller.cache().snapshot().is_blocking());

        controller
            .update_config(json!({ "lists": [list(BlockingMode::AlwaysOn, &["YouTube.com"])] }))
            .await
            .unwrap();

        let snapshot = controller.cache().snapshot();
        assert!(snapshot.is_blocking());
        assert_eq!(snapshot.blocked_sites, vec!["youtube.com"]);
    }

    #[tokio::test]
    async fn protected_keys_are_rejected() {
        let (controller, _dir) = controller().await;

        let err = controller
            .update_config(json!({ "nuclearSites": [] }))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));

        let err = controller.update_config(json!([1, 2])).await.unwrap_err();
        assert!(matches!(err, ApiError::Storage(_)));
    }

    #[tokio::test]
    async fn session_start_and_end_records_history() {
        let (controller, _dir) = controller().await;

        controller.start_session().await.unwrap();
        assert!(controller.cache().snapshot().session_active);

        let summary = controller.end_session().await.unwrap();
        assert!(summary.session_id.is_some());
        assert!(!controller.cache().snapshot().session_active);

        let history = controller.history(Local::now().date_naive());
        assert_eq!(history.session_history.len(), 1);
        assert_eq!(history.today.sessions, 1);
        assert_eq!(history.streak.current_days, 1);
    }

    #[tokio::test]
    async fn session_errors_propagate() {
        let (controller, _dir) = controller().await;

        assert!(matches!(
            controller.end_session().await,
            Err(ApiError::Session(anchor_core::SessionError::NotActive))
        ));

        controller.start_session().await.unwrap();
        assert!(matches!(
            controller.start_break().await,
            Err(ApiError::Session(anchor_core::SessionError::NoReward))
        ));
    }

    #[tokio::test]
    async fn session_events_write_last_snapshot() {
        let (controller, _dir) = controller().await;
        controller.start_session().await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while controller.config().last_session_snapshot.is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let snapshot = controller.config().last_session_snapshot.unwrap();
        assert!(snapshot.session_active);
    }

    #[tokio::test]
    async fn nuclear_changes_persist_and_rebuild() {
        let (controller, _dir) = controller().await;

        let entry = controller
            .add_nuclear(nuclear_site("reddit.com", 60_000))
            .await
            .unwrap();
        assert_eq!(controller.config().nuclear_sites.len(), 1);
        assert_eq!(controller.cache().snapshot().nuclear_sites[0].id, entry.id);

        controller
            .add_exception(&entry.id, "reddit.com/r/rust")
            .await
            .unwrap();
        assert_eq!(controller.cache().snapshot().nuclear_exceptions.len(), 1);

        let err = controller.click_unblock(&entry.id).await.unwrap_err();
        assert!(matches!(err, ApiError::Nuclear(_)));

        controller.confirm_unblock(&entry.id).await.unwrap();
        assert!(controller.config().nuclear_sites.is_empty());
        assert!(controller.cache().snapshot().nuclear_sites.is_empty());
    }

    #[tokio::test]
    async fn reset_keeps_nuclear_blocks() {
        let (controller, dir) = controller().await;
        controller
            .update_config(json!({ "workMinutes": 50 }))
            .await
            .unwrap();
        controller
            .add_nuclear(nuclear_site("reddit.com", 60_000))
            .await
            .unwrap();

        let data = controller.reset_config().await.unwrap();
        assert_eq!(data.work_minutes, 25);
        assert_eq!(data.nuclear_sites.len(), 1);

        let on_disk = PersistentStore::open(dir.path().join("anchor.json"))
            .await
            .unwrap()
            .get_all();
        assert_eq!(on_disk.work_minutes, 25);
        assert_eq!(on_disk.nuclear_sites, data.nuclear_sites);
    }

    #[tokio::test]
    async fn concurrent_nuclear_changes_all_reach_disk() {
        let (controller, dir) = controller().await;

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let controller = controller.clone();
                tokio::spawn(async move {
                    controller
                        .add_nuclear(nuclear_site(&format!("site{i}.com"), 60_000))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let on_disk = PersistentStore::open(dir.path().join("anchor.json"))
            .await
            .unwrap()
            .get_all();
        assert_eq!(on_disk.nuclear_sites.len(), 16);
        assert_eq!(on_disk.nuclear_sites, controller.nuclear_sites());
    }

    #[tokio::test]
    async fn failed_save_undoes_nuclear_change() {
        let (controller, dir) = controller().await;
        let entry = controller
            .add_nuclear(nuclear_site("reddit.com", 0))
            .await
            .unwrap();

        // Without its directory the document can't be written.
        std::fs::remove_dir_all(dir.path()).unwrap();

        let err = controller.confirm_unblock(&entry.id).await.unwrap_err();
        assert!(matches!(err, ApiError::Storage(_)));
        assert_eq!(controller.nuclear_sites(), vec![entry.clone()]);
        assert_eq!(controller.cache().snapshot().nuclear_sites[0].id, entry.id);

        assert!(controller.add_nuclear(nuclear_site("x.com", 0)).await.is_err());
        assert_eq!(controller.nuclear_sites().len(), 1);
    }

    #[tokio::test]
    async fn schedule_starts_and_ends_owned_sessions() {
        let (controller, _dir) = controller().await;
        let mut scheduled = list(BlockingMode::Scheduled, &["youtube.com"]);
        scheduled.schedules = vec![ScheduleWindow::new(
            Weekday::weekdays(),
            TimeOfDay::new(9, 0),
            TimeOfDay::new(17, 0),
        )];
        controller
            .update_config(json!({ "lists": [scheduled] }))
            .await
            .unwrap();

        // 2026-03-04 is a Wednesday.
        let morning = Local.with_ymd_and_hms(2026, 3, 4, 10, 0, 0).unwrap();
        let evening = Local.with_ymd_and_hms(2026, 3, 4, 18, 0, 0).unwrap();

        controller.check_schedule(morning).await;
        assert!(controller.session_status().session_active);
        assert!(controller.cache().snapshot().is_blocking());

        controller.check_schedule(evening).await;
        assert!(!controller.session_status().session_active);
        assert_eq!(controller.history(Local::now().date_naive()).session_history.len(), 1);
    }

    #[tokio::test]
    async fn schedule_leaves_manual_sessions_alone() {
        let (controller, _dir) = controller().await;
        controller
            .update_config(json!({ "lists": [list(BlockingMode::Scheduled, &[])] }))
            .await
            .unwrap();

        controller.start_session().await.unwrap();
        let evening = Local.with_ymd_and_hms(2026, 3, 4, 18, 0, 0).unwrap();
        controller.check_schedule(evening).await;

        assert!(controller.session_status().session_active);
    }

    #[tokio::test]
    async fn shutdown_records_running_session() {
        let (controller, _dir) = controller().await;
        controller.start_session().await.unwrap();

        controller.shutdown().await;

        assert_eq!(controller.config().session_history.len(), 1);
    }
}
