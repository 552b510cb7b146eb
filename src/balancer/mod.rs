// ============================================================================
// Read Balancing
// ============================================================================
//
// A balancer owns the active replica set. Broadcasts read the whole set via
// `all()`, reads ask `next()` for a single target. Policies differ only in
// how `next()` chooses; membership bookkeeping is shared through `Members`.
//
// ============================================================================

pub mod load;
pub mod random;
pub mod round_robin;
pub mod simple;

pub use load::LoadBalancer;
pub use random::RandomBalancer;
pub use round_robin::RoundRobinBalancer;
pub use simple::SimpleBalancer;

use crate::cluster::Replica;
use im::OrdSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Immutable snapshot of the active replicas, ordered by id.
pub type ReplicaSet = OrdSet<Arc<Replica>>;

/// Chooses replicas for read-only invocations.
///
/// Implementations must tolerate concurrent calls from many in-flight
/// invocations.
pub trait Balancer: Send + Sync + fmt::Debug {
    /// One active replica with non-zero weight, or `None` when there is none.
    fn next(&self) -> Option<Arc<Replica>>;

    /// Every active replica, including zero-weight ones.
    fn all(&self) -> ReplicaSet;

    /// Returns false if the replica was already present.
    fn add(&self, replica: Arc<Replica>) -> bool;

    /// Returns false if the replica was not present.
    fn remove(&self, replica: &Replica) -> bool;

    fn before_invocation(&self, _replica: &Replica) {}

    fn after_invocation(&self, _replica: &Replica) {}

    fn primary(&self) -> Option<Arc<Replica>> {
        primary_of(&self.all())
    }

    fn contains(&self, replica: &Replica) -> bool {
        self.all().contains(replica)
    }
}

/// The replica whose result is surfaced to the client: the local replica if
/// one is present, otherwise the lowest id.
pub fn primary_of(replicas: &ReplicaSet) -> Option<Arc<Replica>> {
    replicas
        .iter()
        .find(|replica| replica.is_local())
        .or_else(|| replicas.get_min())
        .cloned()
}

/// Available balancing policies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalancerKind {
    /// Always the highest weight replica
    Simple,
    /// Weighted random choice
    Random,
    /// Weighted rotation
    #[default]
    RoundRobin,
    /// Least in-flight work per unit of weight
    Load,
}

impl BalancerKind {
    pub fn create(&self, replicas: impl IntoIterator<Item = Arc<Replica>>) -> Arc<dyn Balancer> {
        match self {
            Self::Simple => Arc::new(SimpleBalancer::new(replicas)),
            Self::Random => Arc::new(RandomBalancer::new(replicas)),
            Self::RoundRobin => Arc::new(RoundRobinBalancer::new(replicas)),
            Self::Load => Arc::new(LoadBalancer::new(replicas)),
        }
    }
}

impl fmt::Display for BalancerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple => write!(f, "simple"),
            Self::Random => write!(f, "random"),
            Self::RoundRobin => write!(f, "round-robin"),
            Self::Load => write!(f, "load"),
        }
    }
}

/// Copy-on-write membership shared by every policy.
#[derive(Debug, Default)]
pub(crate) struct Members {
    set: RwLock<ReplicaSet>,
}

impl Members {
    pub(crate) fn new(replicas: impl IntoIterator<Item = Arc<Replica>>) -> Self {
        Self {
            set: RwLock::new(replicas.into_iter().collect()),
        }
    }

    pub(crate) fn snapshot(&self) -> ReplicaSet {
        self.set
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn add(&self, replica: Arc<Replica>) -> bool {
        let mut set = self.set.write().unwrap_or_else(PoisonError::into_inner);
        set.insert(replica).is_none()
    }

    pub(crate) fn remove(&self, replica: &Replica) -> bool {
        let mut set = self.set.write().unwrap_or_else(PoisonError::into_inner);
        set.remove(replica).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(id: &str, weight: u32) -> Arc<Replica> {
        Arc::new(Replica::new(id, weight))
    }

    #[test]
    fn test_primary_prefers_local() {
        let set: ReplicaSet = vec![
            replica("a", 1),
            Arc::new(Replica::new("b", 1).local()),
            replica("c", 1),
        ]
        .into_iter()
        .collect();
        assert_eq!(primary_of(&set).unwrap().id(), "b");
    }

    #[test]
    fn test_primary_falls_back_to_lowest_id() {
        let set: ReplicaSet = vec![replica("c", 1), replica("a", 1)].into_iter().collect();
        assert_eq!(primary_of(&set).unwrap().id(), "a");
        assert!(primary_of(&ReplicaSet::new()).is_none());
    }

    #[test]
    fn test_members_snapshot_is_isolated() {
        let members = Members::new(vec![replica("a", 1), replica("b", 1)]);
        let before = members.snapshot();
        assert!(members.remove(&Replica::new("b", 1)));
        assert!(!members.remove(&Replica::new("b", 1)));
        assert_eq!(before.len(), 2);
        assert_eq!(members.snapshot().len(), 1);
    }

    #[test]
    fn test_kind_serde_names() {
        let kind: BalancerKind = serde_json::from_str("\"round-robin\"").unwrap();
        assert_eq!(kind, BalancerKind::RoundRobin);
        assert_eq!(BalancerKind::Load.to_string(), "load");
    }
}
