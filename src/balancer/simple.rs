use super::{Balancer, Members, ReplicaSet};
use crate::cluster::Replica;
use std::sync::Arc;

/// Sends every read to the heaviest replica.
#[derive(Debug, Default)]
pub struct SimpleBalancer {
    members: Members,
}

impl SimpleBalancer {
    pub fn new(replicas: impl IntoIterator<Item = Arc<Replica>>) -> Self {
        Self {
            members: Members::new(replicas),
        }
    }
}

impl Balancer for SimpleBalancer {
    fn next(&self) -> Option<Arc<Replica>> {
        let mut best: Option<Arc<Replica>> = None;
        for replica in self.members.snapshot().iter() {
            let weight = replica.weight();
            if weight == 0 {
                continue;
            }
            if best.as_ref().is_none_or(|current| weight > current.weight()) {
                best = Some(replica.clone());
            }
        }
        best
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
