use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SubId {
    /// A subscription id description used for debugging,
    /// since generated ids carry no meaning
    description: String,
    id: String,
}

impl PartialEq for SubId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SubId {}

impl SubId {
    /// Create a subscription id that is a random uuid. A
    /// description is specified for debugging purposes
    pub fn new(description: impl Into<String>) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            description: description.into(),
            id,
        }
    }

    /// Create a subscription id with a specific string
    /// instead of a random uuid
    pub fn from_string(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl From<&str> for SubId {
    fn from(id: &str) -> Self {
        SubId::from_string(id, "")
    }
}

impl std::fmt::Display for SubId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "SubId('{}', {}...)",
            self.description,
            abbrev_str(&self.id, 12)
        )
    }
}

impl Hash for SubId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Hands out subscription ids that are unique for the lifetime of one pool:
/// a random per-generator prefix followed by a monotonic counter.
#[derive(Debug)]
pub struct SubIdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl Default for SubIdGenerator {
    fn default() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self::with_prefix(abbrev_str(&uuid, 8))
    }
}

impl SubIdGenerator {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn next(&self, description: impl Into<String>) -> SubId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        SubId::from_string(format!("{}-{n}", self.prefix), description)
    }
}

fn abbrev_str(s: &str, len: usize) -> &str {
    if s.len() <= len {
        return s;
    }
    let mut end = len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
