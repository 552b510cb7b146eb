use super::{Balancer, Members, ReplicaSet};
use crate::cluster::Replica;
use rand::Rng;
use std::sync::Arc;

/// Picks a replica at random, proportionally to its weight.
#[derive(Debug, Default)]
pub struct RandomBalancer {
    members: Members,
}

impl RandomBalancer {
    pub fn new(replicas: impl IntoIterator<Item = Arc<Replica>>) -> Self {
        Self {
            members: Members::new(replicas),
        }
    }
}

impl Balancer for RandomBalancer {
    fn next(&self) -> Option<Arc<Replica>> {
        let snapshot = self.members.snapshot();
        let weighted: Vec<(Arc<Replica>, u64)> = snapshot
            .iter()
            .map(|replica| (replica.clone(), u64::from(replica.weight())))
            .filter(|(_, weight)| *weight > 0)
            .collect();
        let total: u64 = weighted.iter().map(|(_, weight)| weight).sum();
        if total == 0 {
            return None;
        }

        let mut point = rand::thread_rng().gen_range(0..total);
        for (replica, weight) in weighted {
            if point < weight {
                return Some(replica);
            }
            point -= weight;
        }
        None
    }

    fn all(&self) -> ReplicaSet {
        self.members.snapshot()
    }

    fn add(&self, replica: Arc<Replica>) -> bool {
        self.members.add(replica)
    }

    fn remove(&self, replica: &Replica) -> bool {
        self.members.remove(replica)
    }
}
