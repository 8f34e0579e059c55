//! Snapshot of the blocking state read on every request.
//!
//! ## Architecture
//!
//! ```text
//! session watch ──┐
//!                 ├─→ rebuild task ─→ StateCache.replace(new Arc)
//! nuclear watch ──┘
//!
//! Proxy request ─→ StateCache.snapshot() ─→ Arc<BlockingState>
//! ```
//!
//! Readers clone an `Arc` under a read lock and evaluate without holding it.
//! Writers swap the whole snapshot in one assignment, so a request never sees
//! a half-updated state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anchor_core::rule_engine::BlockingState;
use parking_lot::RwLock;

/// Shared, atomically replaced [`BlockingState`].
#[derive(Clone, Default)]
pub struct StateCache {
    current: Arc<RwLock<Arc<BlockingState>>>,
    generation: Arc<AtomicU64>,
}

impl std::fmt::Debug for StateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCache")
            .field("generation", &self.generation())
            .field("blocking", &self.snapshot().is_blocking())
            .finish()
    }
}

impl StateCache {
    pub fn new(initial: BlockingState) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(initial))),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns the current snapshot.
    ///
    /// This is the hot path for request handling.
    #[inline]
    pub fn snapshot(&self) -> Arc<BlockingState> {
        Arc::clone(&self.current.read())
    }

    /// Swaps in a new snapshot and returns its generation.
    pub fn replace(&self, state: BlockingState) -> u64 {
        let next = Arc::new(state);
        *self.current.write() = next;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::trace!(generation, "Blocking state replaced");
        generation
    }

    /// Number of replacements so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use anchor_core::lists::BlockingMode;

    use super::*;

    #[test]
    fn replace_swaps_whole_snapshot() {
        let cache = StateCache::new(BlockingState::default());
        let before = cache.snapshot();

        let generation = cache.replace(BlockingState {
            blocking_mode: BlockingMode::AlwaysOn,
            blocked_sites: vec!["youtube.com".into()],
            ..Default::default()
        });

        assert_eq!(generation, 1);
        assert_eq!(cache.generation(), 1);
        // Old readers keep their snapshot.
        assert_eq!(*before, BlockingState::default());
        assert!(cache.snapshot().is_blocking());
    }

    #[test]
    fn clones_share_state() {
        let cache = StateCache::default();
        let other = cache.clone();
        other.replace(BlockingState {
            session_active: true,
            ..Default::default()
        });
        assert!(cache.snapshot().session_active);
    }
}
