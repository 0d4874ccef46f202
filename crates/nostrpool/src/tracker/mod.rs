//! Per-subscription duplicate suppression.
//!
//! The same event usually arrives once per relay. A tracker decides whether a
//! given event was already handed to the subscription's listeners. `seen` is
//! called concurrently from every relay feeding the subscription, so each
//! implementation checks and marks an id in one critical section.

mod sliding_window;

pub use sliding_window::{SlidingWindowOptions, SlidingWindowTracker};

use hashbrown::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::sync::lock;
use crate::{Error, Filter, Note, NoteId, Result};

pub trait EventTracker: Send + Sync {
    /// Adjust to the subscription's filters before the first event arrives.
    fn tune_for(&mut self, _filters: &[Filter]) {}

    /// `Ok(true)` if `note` was already delivered. Marks it seen otherwise.
    fn seen(&self, note: &Note) -> Result<bool>;
}

pub type TrackerFactory = Arc<dyn Fn() -> Box<dyn EventTracker> + Send + Sync>;

/// Which tracker a new subscription gets.
#[derive(Clone, Default)]
pub enum TrackerKind {
    Naive,
    #[default]
    SlidingWindow,
    Passthrough,
    FailOnDouble,
    Custom(TrackerFactory),
}

impl fmt::Debug for TrackerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Naive => write!(f, "Naive"),
            Self::SlidingWindow => write!(f, "SlidingWindow"),
            Self::Passthrough => write!(f, "Passthrough"),
            Self::FailOnDouble => write!(f, "FailOnDouble"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl TrackerKind {
    pub fn build(&self) -> Box<dyn EventTracker> {
        match self {
            Self::Naive => Box::new(NaiveTracker::default()),
            Self::SlidingWindow => Box::new(SlidingWindowTracker::default()),
            Self::Passthrough => Box::new(PassthroughTracker),
            Self::FailOnDouble => Box::new(FailOnDoubleTracker::default()),
            Self::Custom(factory) => factory(),
        }
    }
}

/// Remembers every id forever. Suited to short one-shot fetches.
#[derive(Debug, Default)]
pub struct NaiveTracker {
    seen: Mutex<HashSet<NoteId>>,
}

impl NaiveTracker {
    pub fn len(&self) -> usize {
        lock(&self.seen).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventTracker for NaiveTracker {
    fn seen(&self, note: &Note) -> Result<bool> {
        Ok(!lock(&self.seen).insert(note.id))
    }
}

/// Never reports anything as seen.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughTracker;

impl EventTracker for PassthroughTracker {
    fn seen(&self, _note: &Note) -> Result<bool> {
        Ok(false)
    }
}

/// Like [`NaiveTracker`] but a repeat is an error. For tests that assert a
/// relay never delivers an event twice.
#[derive(Debug, Default)]
pub struct FailOnDoubleTracker {
    seen: Mutex<HashSet<NoteId>>,
}

impl EventTracker for FailOnDoubleTracker {
    fn seen(&self, note: &Note) -> Result<bool> {
        if lock(&self.seen).insert(note.id) {
            Ok(false)
        } else {
            Err(Error::DuplicateEvent(note.id))
        }
    }
}
