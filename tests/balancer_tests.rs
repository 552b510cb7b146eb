use dbcluster::backend::memory::MemoryDatabase;
use dbcluster::balancer::LoadBalancer;
use dbcluster::{
    Balancer, BalancerKind, Cluster, ClusterConfig, ClusterDataSource, Replica, ReplicaConfig,
};
use std::collections::HashMap;
use std::sync::Arc;

const KINDS: [BalancerKind; 4] = [
    BalancerKind::Simple,
    BalancerKind::Random,
    BalancerKind::RoundRobin,
    BalancerKind::Load,
];

fn replicas(weights: &[(&str, u32)]) -> Vec<Arc<Replica>> {
    weights
        .iter()
        .map(|(id, weight)| Arc::new(Replica::new(*id, *weight)))
        .collect()
}

fn pick_counts(balancer: &dyn Balancer, rounds: usize) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for _ in 0..rounds {
        let replica = balancer.next().unwrap();
        *counts.entry(replica.id().to_string()).or_default() += 1;
    }
    counts
}

#[test]
fn test_zero_weight_never_chosen() {
    for kind in KINDS {
        let balancer = kind.create(replicas(&[("a", 0), ("b", 1), ("c", 0)]));
        let counts = pick_counts(balancer.as_ref(), 50);
        assert_eq!(counts.len(), 1, "{} chose a zero-weight replica", kind);
        assert_eq!(counts["b"], 50);
        assert_eq!(balancer.all().len(), 3);
    }
}

#[test]
fn test_only_zero_weight_yields_none() {
    for kind in KINDS {
        let balancer = kind.create(replicas(&[("a", 0)]));
        assert!(balancer.next().is_none(), "{}", kind);
        assert_eq!(balancer.primary().unwrap().id(), "a");
    }
}

#[test]
fn test_removed_replica_is_not_chosen() {
    for kind in KINDS {
        let members = replicas(&[("a", 1), ("b", 1)]);
        let balancer = kind.create(members.clone());
        assert!(balancer.remove(&members[0]));
        assert!(!balancer.contains(&members[0]));

        let counts = pick_counts(balancer.as_ref(), 10);
        assert_eq!(counts.get("a"), None, "{}", kind);

        assert!(balancer.add(members[0].clone()));
        assert!(!balancer.add(members[0].clone()));
        assert_eq!(balancer.all().len(), 2);
    }
}

#[test]
fn test_round_robin_follows_weights() {
    let balancer = BalancerKind::RoundRobin.create(replicas(&[("a", 2), ("b", 1)]));
    let counts = pick_counts(balancer.as_ref(), 30);
    assert_eq!(counts["a"], 20);
    assert_eq!(counts["b"], 10);
}

#[test]
fn test_random_honors_weights_roughly() {
    let balancer = BalancerKind::Random.create(replicas(&[("a", 9), ("b", 1)]));
    let counts = pick_counts(balancer.as_ref(), 2_000);
    assert!(counts["a"] > counts.get("b").copied().unwrap_or(0) * 3);
}

#[test]
fn test_load_tracks_in_flight_invocations() {
    let members = replicas(&[("a", 1), ("b", 1)]);
    let balancer = LoadBalancer::new(members.clone());

    balancer.before_invocation(&members[0]);
    balancer.before_invocation(&members[0]);
    assert_eq!(balancer.load(&members[0]), 2);
    assert_eq!(balancer.next().unwrap().id(), "b");

    balancer.after_invocation(&members[0]);
    balancer.after_invocation(&members[0]);
    balancer.after_invocation(&members[0]);
    assert_eq!(balancer.load(&members[0]), 0);
    assert_eq!(balancer.next().unwrap().id(), "a");
}

#[tokio::test]
async fn test_concurrent_next_calls() {
    for kind in KINDS {
        let balancer = kind.create(replicas(&[("a", 1), ("b", 2), ("c", 0)]));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let balancer = balancer.clone();
            handles.push(tokio::spawn(async move {
                (0..100)
                    .filter_map(|_| balancer.next())
                    .filter(|replica| replica.weight() == 0)
                    .count()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 0, "{}", kind);
        }
    }
}

#[tokio::test]
async fn test_zero_weight_replica_gets_writes_but_no_reads() {
    let db1 = MemoryDatabase::new("db1");
    let backup = MemoryDatabase::new("backup");
    let cluster = Cluster::new(
        ClusterConfig::new("archive")
            .replica(ReplicaConfig::new("db1").local())
            .replica(ReplicaConfig::new("backup").weight(0))
            .balancer(BalancerKind::Load),
    )
    .unwrap();
    let source = ClusterDataSource::new(
        cluster.clone(),
        vec![
            ("db1".to_string(), db1.data_source()),
            ("backup".to_string(), backup.data_source()),
        ],
    )
    .unwrap();

    let connection = source.connect().await.unwrap();
    let statement = connection.create_statement().await.unwrap();
    statement.execute_update("INSERT INTO t VALUES (1)").await.unwrap();
    assert_eq!(backup.committed(), db1.committed());

    // A backup failure during a read would deactivate it; it is never asked
    backup.set_down(true);
    for _ in 0..10 {
        let rows = statement.execute_query("SELECT * FROM t").await.unwrap();
        assert_eq!(rows.node().replicas().len(), 1);
        rows.close().await;
    }
    assert!(cluster.replica("backup").unwrap().is_active());
}
