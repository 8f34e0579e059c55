//! Session history, daily totals, and streaks.

use chrono::NaiveDate;

use crate::models::{DailyStats, SessionRecord, StorageData, Streak};

/// Maximum number of sessions kept in history.
pub const HISTORY_LIMIT: usize = 500;

/// Formats a local date as a `daily_stats` key.
pub fn day_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

/// Appends a finished session and folds it into the day's totals and the streak.
pub fn record_session(data: &mut StorageData, record: SessionRecord, day: NaiveDate) {
    let stats = data.daily_stats.entry(day_key(day)).or_default();
    stats.sessions += 1;
    stats.work_ms += record.work_ms;
    stats.productive_ms += record.productive_ms;
    stats.blocked_attempts += record.blocked_attempts;

    data.streak.record_day(day);

    data.session_history.push(record);
    if data.session_history.len() > HISTORY_LIMIT {
        let excess = data.session_history.len() - HISTORY_LIMIT;
        data.session_history.drain(..excess);
    }
}

/// Counts a break taken on `day`.
pub fn record_break(data: &mut StorageData, day: NaiveDate) {
    data.daily_stats.entry(day_key(day)).or_default().breaks_taken += 1;
}

/// Returns the totals for `day`, or zeroes.
pub fn stats_for(data: &StorageData, day: NaiveDate) -> DailyStats {
    data.daily_stats.get(&day_key(day)).cloned().unwrap_or_default()
}

impl Streak {
    /// Marks `day` as active.
    ///
    /// The streak grows on the day after the last active one and restarts
    /// at 1 after a gap. Days earlier than the last active one are ignored.
    pub fn record_day(&mut self, day: NaiveDate) {
        match self.last_active_date {
            Some(last) if day <= last => return,
            Some(last) if last.succ_opt() == Some(day) => self.current_days += 1,
            _ => self.current_days = 1,
        }
        self.best_days = self.best_days.max(self.current_days);
        self.last_active_date = Some(day);
    }

    /// Current streak as seen on `today`: zero once a full day has been missed.
    pub fn current_at(&self, today: NaiveDate) -> u32 {
        match self.last_active_date {
            Some(last) if last == today || last.succ_opt() == Some(today) => self.current_days,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use anchor_core::session::SessionStatus;
    use chrono::Utc;

    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    fn record(id: &str, work_ms: u64) -> SessionRecord {
        let summary = SessionStatus {
            session_id: Some(id.to_string()),
            work_timer_ms: work_ms,
            productive_ms: work_ms / 2,
            blocked_attempts: 3,
            ..Default::default()
        };
        SessionRecord::from_summary(&summary, "default", Utc::now()).unwrap()
    }

    #[test]
    fn streak_grows_and_resets() {
        let mut streak = Streak::default();
        streak.record_day(day(1));
        streak.record_day(day(1));
        streak.record_day(day(2));
        streak.record_day(day(3));
        assert_eq!(streak.current_days, 3);

        streak.record_day(day(5));
        assert_eq!(streak.current_days, 1);
        assert_eq!(streak.best_days, 3);

        // Out-of-order days do not rewind.
        streak.record_day(day(4));
        assert_eq!(streak.last_active_date, Some(day(5)));

        assert_eq!(streak.current_at(day(6)), 1);
        assert_eq!(streak.current_at(day(7)), 0);
    }

    #[test]
    fn record_session_updates_totals() {
        let mut data = StorageData::default();
        record_session(&mut data, record("s1", 60_000), day(1));
        record_session(&mut data, record("s2", 30_000), day(1));
        record_break(&mut data, day(1));

        let stats = stats_for(&data, day(1));
        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.work_ms, 90_000);
        assert_eq!(stats.productive_ms, 45_000);
        assert_eq!(stats.blocked_attempts, 6);
        assert_eq!(stats.breaks_taken, 1);
        assert_eq!(data.streak.current_days, 1);
        assert_eq!(stats_for(&data, day(2)), DailyStats::default());
        assert!(data.daily_stats.contains_key("2026-03-01"));
    }

    #[test]
    fn history_is_capped() {
        let mut data = StorageData::default();
        for i in 0..HISTORY_LIMIT + 5 {
            record_session(&mut data, record(&format!("s{i}"), 1), day(1));
        }
        assert_eq!(data.session_history.len(), HISTORY_LIMIT);
        assert_eq!(data.session_history[0].session_id, "s5");
    }

    #[test]
    fn summary_without_id_is_skipped() {
        assert!(SessionRecord::from_summary(&SessionStatus::default(), "x", Utc::now()).is_none());
    }
}
