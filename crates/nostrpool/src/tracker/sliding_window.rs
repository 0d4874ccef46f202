use hashbrown::HashSet;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::EventTracker;
use crate::sync::lock;
use crate::{Filter, Note, NoteId, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindowOptions {
    /// How far back events stay tracked before the cutoff moves forward.
    pub window: Duration,
    /// Slack kept behind the cutoff when it is advanced.
    pub margin: Duration,
    pub max_tracked: usize,
    /// Below this many tracked ids nothing is evicted.
    pub min_tracked: usize,
}

impl Default for SlidingWindowOptions {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60 * 60),
            margin: Duration::from_secs(30 * 60),
            max_tracked: 2100,
            min_tracked: 21,
        }
    }
}

type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

#[derive(Default)]
struct WindowState {
    ids: HashSet<NoteId>,
    /// oldest first
    by_time: BTreeSet<(u64, NoteId)>,
    /// events created before this are treated as already seen
    cutoff: u64,
}

/// Tracks recent ids only, for long-lived live subscriptions.
///
/// Everything older than a moving cutoff is reported as seen without being
/// stored. The cutoff advances when the window elapses or when the tracked
/// set overflows `max_tracked`, evicting the oldest ids first.
pub struct SlidingWindowTracker {
    options: SlidingWindowOptions,
    clock: Clock,
    state: Mutex<WindowState>,
}

impl Default for SlidingWindowTracker {
    fn default() -> Self {
        Self::new(SlidingWindowOptions::default())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl SlidingWindowTracker {
    pub fn new(options: SlidingWindowOptions) -> Self {
        Self::with_clock(options, Arc::new(unix_now))
    }

    /// `clock` returns the current unix time in seconds.
    pub fn with_clock(options: SlidingWindowOptions, clock: Clock) -> Self {
        Self {
            options,
            clock,
            state: Mutex::new(WindowState::default()),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.state).ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cutoff(&self) -> u64 {
        lock(&self.state).cutoff
    }

    pub fn max_tracked(&self) -> usize {
        self.options.max_tracked
    }

    fn evict(&self, state: &mut WindowState) {
        if state.ids.len() <= self.options.min_tracked {
            return;
        }

        let to_remove = state.ids.len().saturating_sub(self.options.max_tracked);
        let window = self.options.window.as_secs();
        let margin = self.options.margin.as_secs();

        let now = (self.clock)();
        let cutoff_moved = now.saturating_sub(state.cutoff) > window;
        if cutoff_moved {
            state.cutoff = now.saturating_sub(window.saturating_sub(margin));
        }

        let mut removed = 0;
        while let Some(&(created_at, id)) = state.by_time.first() {
            let stale = cutoff_moved && created_at < state.cutoff;
            if !stale && removed >= to_remove {
                break;
            }
            state.by_time.pop_first();
            state.ids.remove(&id);
            removed += 1;
        }

        if to_remove > 0 {
            if let Some(&(oldest, _)) = state.by_time.first() {
                state.cutoff = state.cutoff.max(oldest);
            }
        }
    }
}

impl EventTracker for SlidingWindowTracker {
    /// The largest filter `limit` bounds the tracked set to twice that, and
    /// the earliest `since` becomes the initial cutoff.
    fn tune_for(&mut self, filters: &[Filter]) {
        if let Some(limit) = filters.iter().filter_map(Filter::get_limit).max() {
            if limit > 0 {
                self.options.max_tracked = usize::try_from(limit)
                    .unwrap_or(usize::MAX)
                    .saturating_mul(2)
                    .max(self.options.min_tracked);
            }
        }

        if let Some(since) = filters.iter().filter_map(Filter::get_since).min() {
            let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
            state.cutoff = state.cutoff.max(since);
        }
    }

    #[profiling::function]
    fn seen(&self, note: &Note) -> Result<bool> {
        let mut state = lock(&self.state);
        if note.created_at < state.cutoff || state.ids.contains(&note.id) {
            return Ok(true);
        }

        state.ids.insert(note.id);
        state.by_time.insert((note.created_at, note.id));
        self.evict(&mut state);
        Ok(false)
    }
}
