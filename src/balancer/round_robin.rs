use super::{Balancer, Members, ReplicaSet};
use crate::cluster::Replica;
use std::sync::{Arc, Mutex, PoisonError};

/// Smooth weighted rotation.
///
/// Each pick raises every replica's running score by its weight, takes the
/// highest score and lowers it by the total weight. Over `sum(weights)` picks
/// a replica of weight `w` is chosen `w` times, interleaved rather than in
/// runs. State is one counter per replica, whatever the weights. Weights are
/// read live, so a replica whose weight drops to zero is skipped.
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    members: Members,
    scores: Mutex<Vec<(Arc<Replica>, i64)>>,
}

impl RoundRobinBalancer {
    pub fn new(replicas: impl IntoIterator<Item = Arc<Replica>>) -> Self {
        let balancer = Self {
            members: Members::new(replicas),
            scores: Mutex::new(Vec::new()),
        };
        balancer.rebuild();
        balancer
    }

    fn rebuild(&self) {
        let snapshot = self.members.snapshot();
        let mut scores = self.scores.lock().unwrap_or_else(PoisonError::into_inner);
        *scores = snapshot.iter().map(|replica| (replica.clone(), 0)).collect();
    }
}

impl Balancer for RoundRobinBalancer {
    fn next(&self) -> Option<Arc<Replica>> {
        let mut scores = self.scores.lock().unwrap_or_else(PoisonError::into_inner);

        let mut total = 0i64;
        let mut best: Option<usize> = None;
        for index in 0..scores.len() {
            let weight = i64::from(scores[index].0.weight());
            if weight == 0 {
                continue;
            }
            total += weight;
            scores[index].1 += weight;
            if best.is_none_or(|current| scores[index].1 > scores[current].1) {
                best = Some(index);
            }
        }

        let chosen = best?;
        scores[chosen].1 -= total;
        Some(scores[chosen].0.clone())
    }

    fn all(&self) -> ReplicaSet {
        self.members.snapshot()
    }

    fn add(&self, replica: Arc<Replica>) -> bool {
        let added = self.members.add(replica);
        if added {
            self.rebuild();
        }
        added
    }

    fn remove(&self, replica: &Replica) -> bool {
        let removed = self.members.remove(replica);
        if removed {
            self.rebuild();
        }
        removed
    }
}
