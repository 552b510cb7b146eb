use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering as AtomicOrdering};

/// One physical backend participating in the cluster.
///
/// Identity, ordering and hashing are by `id` only; weight and activity are
/// mutable bookkeeping that never changes where a replica sorts.
#[derive(Debug)]
pub struct Replica {
    id: String,
    weight: AtomicU32,
    local: bool,
    active: AtomicBool,
    deactivated_at: Mutex<Option<DateTime<Utc>>>,
}

impl Replica {
    pub fn new(id: impl Into<String>, weight: u32) -> Self {
        Self {
            id: id.into(),
            weight: AtomicU32::new(weight),
            local: false,
            active: AtomicBool::new(true),
            deactivated_at: Mutex::new(None),
        }
    }

    /// Mark this replica as the preferred result source for broadcasts.
    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(AtomicOrdering::SeqCst)
    }

    pub fn set_weight(&self, weight: u32) {
        self.weight.store(weight, AtomicOrdering::SeqCst);
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn is_active(&self) -> bool {
        self.active.load(AtomicOrdering::SeqCst)
    }

    /// Flip the activity flag. Returns false when the replica was already in
    /// the requested state.
    pub(crate) fn set_active(&self, active: bool) -> bool {
        let changed = self.active.swap(active, AtomicOrdering::SeqCst) != active;
        if changed {
            let mut stamp = self
                .deactivated_at
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *stamp = if active { None } else { Some(Utc::now()) };
        }
        changed
    }

    pub fn deactivated_at(&self) -> Option<DateTime<Utc>> {
        *self
            .deactivated_at
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn status(&self) -> ReplicaStatus {
        ReplicaStatus {
            id: self.id.clone(),
            weight: self.weight(),
            local: self.local,
            active: self.is_active(),
            deactivated_at: self.deactivated_at(),
        }
    }
}

impl PartialEq for Replica {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Replica {}

impl PartialOrd for Replica {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Replica {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl Hash for Replica {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Point-in-time view of a replica, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaStatus {
    pub id: String,
    pub weight: u32,
    pub local: bool,
    pub active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl fmt::Display for ReplicaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} weight={}{} {}",
            self.id,
            self.weight,
            if self.local { " local" } else { "" },
            if self.active { "ACTIVE" } else { "INACTIVE" }
        )
    }
}
