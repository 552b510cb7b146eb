use super::{Balancer, Members, ReplicaSet};
use crate::cluster::Replica;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Picks the replica with the least in-flight work relative to its weight.
///
/// Load is the number of invocations between `before_invocation` and
/// `after_invocation`.
#[derive(Debug, Default)]
pub struct LoadBalancer {
    members: Members,
    loads: RwLock<HashMap<String, Arc<AtomicUsize>>>,
}

impl LoadBalancer {
    pub fn new(replicas: impl IntoIterator<Item = Arc<Replica>>) -> Self {
        let members = Members::new(replicas);
        let loads = members
            .snapshot()
            .iter()
            .map(|replica| (replica.id().to_string(), Arc::new(AtomicUsize::new(0))))
            .collect();
        Self {
            members,
            loads: RwLock::new(loads),
        }
    }

    /// Current in-flight count for a replica
    pub fn load(&self, replica: &Replica) -> usize {
        self.counter(replica)
            .map(|counter| counter.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn counter(&self, replica: &Replica) -> Option<Arc<AtomicUsize>> {
        self.loads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(replica.id())
            .cloned()
    }
}

impl Balancer for LoadBalancer {
    fn next(&self) -> Option<Arc<Replica>> {
        let mut best: Option<(Arc<Replica>, u64, u64)> = None;
        for replica in self.members.snapshot().iter() {
            let weight = u64::from(replica.weight());
            if weight == 0 {
                continue;
            }
            let load = self.load(replica) as u64 + 1;
            // load/weight < best_load/best_weight, without division
            let better = match &best {
                None => true,
                Some((_, best_load, best_weight)) => load * best_weight < best_load * weight,
            };
            if better {
                best = Some((replica.clone(), load, weight));
            }
        }
        best.map(|(replica, _, _)| replica)
    }

    fn all(&self) -> ReplicaSet {
        self.members.snapshot()
    }

    fn add(&self, replica: Arc<Replica>) -> bool {
        self.loads
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(replica.id().to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)));
        self.members.add(replica)
    }

    fn remove(&self, replica: &Replica) -> bool {
        self.members.remove(replica)
    }

    fn before_invocation(&self, replica: &Replica) {
        if let Some(counter) = self.counter(replica) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn after_invocation(&self, replica: &Replica) {
        if let Some(counter) = self.counter(replica) {
            let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |load| {
                Some(load.saturating_sub(1))
            });
        }
    }
}
