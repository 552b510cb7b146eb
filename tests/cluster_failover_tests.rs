use dbcluster::backend::memory::MemoryDatabase;
use dbcluster::{
    AggregateSelection, BalancerKind, Cluster, ClusterConfig, ClusterDataSource, DbError,
    ReplicaConfig, Value,
};
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    cluster: Arc<Cluster>,
    source: ClusterDataSource,
    db1: Arc<MemoryDatabase>,
    db2: Arc<MemoryDatabase>,
}

fn fixture_with(config: ClusterConfig) -> Fixture {
    let db1 = MemoryDatabase::with_key_offset("db1", 0);
    let db2 = MemoryDatabase::with_key_offset("db2", 1000);
    let cluster = Cluster::new(config).unwrap();
    let source = ClusterDataSource::new(
        cluster.clone(),
        vec![
            ("db1".to_string(), db1.data_source()),
            ("db2".to_string(), db2.data_source()),
        ],
    )
    .unwrap();
    Fixture {
        cluster,
        source,
        db1,
        db2,
    }
}

fn two_replicas() -> ClusterConfig {
    ClusterConfig::new("orders")
        .replica(ReplicaConfig::new("db1").local())
        .replica(ReplicaConfig::new("db2"))
}

fn active_ids(cluster: &Cluster) -> Vec<String> {
    cluster
        .active_replicas()
        .iter()
        .map(|replica| replica.id().to_string())
        .collect()
}

#[tokio::test]
async fn test_write_reaches_every_replica() {
    let fixture = fixture_with(two_replicas());
    let connection = fixture.source.connect().await.unwrap();
    let statement = connection.create_statement().await.unwrap();

    let affected = statement
        .execute_update("INSERT INTO users VALUES (1, 'alice')")
        .await
        .unwrap();

    assert_eq!(affected, 1);
    assert_eq!(fixture.db1.committed(), fixture.db2.committed());
    assert_eq!(fixture.db1.committed().len(), 1);
}

#[tokio::test]
async fn test_failed_replica_is_deactivated_and_primary_result_returned() {
    let fixture = fixture_with(two_replicas());
    let connection = fixture.source.connect().await.unwrap();
    let statement = connection.create_statement().await.unwrap();

    fixture
        .db2
        .fail_next(DbError::ConnectionError("connection reset".into()));
    let affected = statement
        .execute_update("UPDATE users SET name = 'bob'")
        .await
        .unwrap();

    assert_eq!(affected, 1);
    assert_eq!(active_ids(&fixture.cluster), vec!["db1"]);
    assert!(!fixture.cluster.replica("db2").unwrap().is_active());
    for _ in 0..5 {
        assert_eq!(fixture.cluster.balancer().next().unwrap().id(), "db1");
    }

    // Later broadcasts skip the deactivated replica
    statement.execute_update("DELETE FROM users").await.unwrap();
    assert_eq!(fixture.db1.committed().len(), 2);
    assert!(fixture.db2.committed().is_empty());
}

#[tokio::test]
async fn test_primary_failure_fails_the_call() {
    let fixture = fixture_with(two_replicas());
    let connection = fixture.source.connect().await.unwrap();
    let statement = connection.create_statement().await.unwrap();

    fixture
        .db1
        .fail_next(DbError::ConstraintViolation("duplicate key".into()));
    let result = statement
        .execute_update("INSERT INTO users VALUES (1, 'alice')")
        .await;

    assert!(matches!(result, Err(DbError::ConstraintViolation(_))));
}

#[tokio::test]
async fn test_unreachable_primary_fails_call_then_cluster_moves_on() {
    let fixture = fixture_with(two_replicas());
    let connection = fixture.source.connect().await.unwrap();
    let statement = connection.create_statement().await.unwrap();

    fixture.db1.set_down(true);
    let result = statement.execute_update("INSERT INTO t VALUES (1)").await;
    assert!(matches!(result, Err(DbError::ConnectionError(_))));
    assert_eq!(active_ids(&fixture.cluster), vec!["db2"]);

    let affected = statement
        .execute_update("INSERT INTO t VALUES (2)")
        .await
        .unwrap();
    assert_eq!(affected, 1);
    assert_eq!(fixture.db2.committed().len(), 2);
}

#[tokio::test]
async fn test_reads_fail_over_to_next_replica() {
    let fixture = fixture_with(two_replicas().balancer(BalancerKind::Simple));
    let connection = fixture.source.connect().await.unwrap();
    let statement = connection.create_statement().await.unwrap();
    statement.execute_update("INSERT INTO t VALUES (1)").await.unwrap();

    fixture.db1.set_down(true);
    let rows = statement.execute_query("SELECT * FROM t").await.unwrap();
    assert!(rows.next().await.unwrap());
    assert_eq!(rows.get(0).await.unwrap(), Value::Integer(1));
    assert_eq!(active_ids(&fixture.cluster), vec!["db2"]);
}

#[tokio::test]
async fn test_read_statement_errors_do_not_deactivate() {
    let fixture = fixture_with(two_replicas().balancer(BalancerKind::Simple));
    let connection = fixture.source.connect().await.unwrap();
    let statement = connection.create_statement().await.unwrap();

    fixture
        .db1
        .fail_next(DbError::ExecutionError("no such table".into()));
    let result = statement.execute_query("SELECT * FROM missing").await;

    assert!(matches!(result, Err(DbError::ExecutionError(_))));
    assert_eq!(active_ids(&fixture.cluster), vec!["db1", "db2"]);
}

#[tokio::test]
async fn test_connect_survives_one_failed_replica() {
    let fixture = fixture_with(two_replicas());
    fixture.db2.set_down(true);

    let connection = fixture.source.connect().await.unwrap();
    assert_eq!(connection.node().replicas().len(), 1);
    assert_eq!(active_ids(&fixture.cluster), vec!["db1"]);
    assert_eq!(connection.server_version().await.unwrap(), "memory-db1");
}

#[tokio::test]
async fn test_connect_fails_when_every_replica_fails() {
    let fixture = fixture_with(two_replicas());
    fixture.db1.set_down(true);
    fixture.db2.set_down(true);

    let result = fixture.source.connect().await;
    assert!(matches!(result, Err(DbError::ConnectionError(_))));
    // Nothing to fail over to, so membership is left alone
    assert_eq!(active_ids(&fixture.cluster), vec!["db1", "db2"]);
}

#[tokio::test]
async fn test_stopped_cluster_rejects_calls() {
    let fixture = fixture_with(two_replicas());
    let connection = fixture.source.connect().await.unwrap();
    let statement = connection.create_statement().await.unwrap();

    fixture.cluster.stop();
    let result = statement.execute_update("INSERT INTO t VALUES (1)").await;
    assert!(matches!(result, Err(DbError::ClusterUnavailable(_))));
    assert!(fixture.db1.committed().is_empty());
    assert!(fixture.db2.committed().is_empty());

    fixture.cluster.start();
    assert!(statement.execute_update("INSERT INTO t VALUES (1)").await.is_ok());
}

#[tokio::test]
async fn test_slow_replica_times_out_and_is_deactivated() {
    let fixture = fixture_with(two_replicas().replica_timeout(Duration::from_millis(100)));
    let connection = fixture.source.connect().await.unwrap();
    let statement = connection.create_statement().await.unwrap();

    fixture.db2.set_delay(Some(Duration::from_secs(10)));
    let affected = statement
        .execute_update("INSERT INTO t VALUES (1)")
        .await
        .unwrap();

    assert_eq!(affected, 1);
    assert_eq!(active_ids(&fixture.cluster), vec!["db1"]);
}

#[tokio::test]
async fn test_generated_keys_follow_aggregate_selection() {
    let fixture = fixture_with(two_replicas());
    let connection = fixture.source.connect().await.unwrap();
    let statement = connection.create_statement().await.unwrap();
    assert_eq!(statement.execute_insert("INSERT INTO t").await.unwrap(), 1);

    let fixture = fixture_with(
        two_replicas().aggregate_selection(AggregateSelection::HighestId),
    );
    let connection = fixture.source.connect().await.unwrap();
    let statement = connection.create_statement().await.unwrap();
    assert_eq!(statement.execute_insert("INSERT INTO t").await.unwrap(), 1001);
}

#[tokio::test]
async fn test_deactivation_closes_pruned_objects() {
    let fixture = fixture_with(two_replicas());
    let connection = fixture.source.connect().await.unwrap();
    let statement = connection.create_statement().await.unwrap();
    assert_eq!(fixture.db2.open_connections(), 1);

    fixture
        .db2
        .fail_next(DbError::ConnectionError("broken pipe".into()));
    statement.execute_update("INSERT INTO t VALUES (1)").await.unwrap();

    assert_eq!(fixture.db2.open_connections(), 0);
    assert_eq!(statement.node().replicas().len(), 1);
    assert_eq!(connection.node().replicas().len(), 1);
}

#[tokio::test]
async fn test_recovered_replica_serves_new_connections() {
    let fixture = fixture_with(two_replicas());
    let first = fixture.source.connect().await.unwrap();
    let statement = first.create_statement().await.unwrap();

    fixture
        .db2
        .fail_next(DbError::ConnectionError("restart".into()));
    statement.execute_update("INSERT INTO t VALUES (1)").await.unwrap();
    let db2 = fixture.cluster.replica("db2").unwrap();
    assert!(fixture.cluster.activate(&db2).await.unwrap());

    let second = fixture.source.connect().await.unwrap();
    assert_eq!(second.node().replicas().len(), 2);
    // The older connection keeps only the replicas it still holds
    assert_eq!(first.node().replicas().len(), 1);
}

#[tokio::test]
async fn test_register_replica_joins_new_connections() {
    let fixture = fixture_with(two_replicas());
    let db3 = MemoryDatabase::new("db3");
    let replica = fixture
        .source
        .register_replica(ReplicaConfig::new("db3").weight(2), db3.data_source())
        .await
        .unwrap();
    assert!(replica.is_active());

    let connection = fixture.source.connect().await.unwrap();
    let statement = connection.create_statement().await.unwrap();
    statement.execute_update("INSERT INTO t VALUES (1)").await.unwrap();

    assert_eq!(db3.committed(), fixture.db1.committed());
    assert_eq!(fixture.cluster.status().len(), 3);
}

#[tokio::test]
async fn test_quorum_policy_rejects_lonely_success() {
    let fixture = fixture_with(two_replicas().min_surviving_replicas(2));
    let connection = fixture.source.connect().await.unwrap();
    let statement = connection.create_statement().await.unwrap();

    fixture
        .db2
        .fail_next(DbError::ConnectionError("gone".into()));
    let result = statement.execute_update("INSERT INTO t VALUES (1)").await;

    assert!(matches!(
        result,
        Err(DbError::QuorumNotMet {
            required: 2,
            survived: 1
        })
    ));
}

#[tokio::test]
async fn test_result_set_broadcast_cursor_and_update() {
    let fixture = fixture_with(two_replicas());
    let connection = fixture.source.connect().await.unwrap();
    let statement = connection.create_statement().await.unwrap();
    statement.execute_update("INSERT INTO t VALUES (1)").await.unwrap();

    let rows = statement
        .execute_query("SELECT * FROM t FOR UPDATE")
        .await
        .unwrap();
    assert_eq!(rows.node().replicas().len(), 2);
    assert!(rows.next().await.unwrap());
    rows.update(1, Value::Text("changed".into())).await.unwrap();
    assert!(!rows.next().await.unwrap());

    assert_eq!(fixture.db1.committed(), fixture.db2.committed());
    assert_eq!(fixture.db1.committed().len(), 2);
}

#[tokio::test]
async fn test_batches_are_broadcast() {
    let fixture = fixture_with(two_replicas());
    let connection = fixture.source.connect().await.unwrap();
    let statement = connection.create_statement().await.unwrap();

    statement.add_batch("INSERT INTO t VALUES (1)").await.unwrap();
    statement.add_batch("INSERT INTO t VALUES (2)").await.unwrap();
    let counts = statement.execute_batch().await.unwrap();

    assert_eq!(counts, vec![1, 1]);
    assert_eq!(fixture.db2.committed().len(), 2);
}

#[tokio::test]
async fn test_prepared_statement_parameters() {
    let fixture = fixture_with(two_replicas());
    let connection = fixture.source.connect().await.unwrap();
    let statement = connection
        .prepare_statement("INSERT INTO users VALUES (?, ?)")
        .await
        .unwrap();

    statement.set_parameter(1, Value::Integer(7)).await.unwrap();
    statement
        .set_parameter(2, Value::Text("carol".into()))
        .await
        .unwrap();
    statement.execute_prepared_update().await.unwrap();

    assert_eq!(
        fixture.db2.committed(),
        vec!["INSERT INTO users VALUES (?, ?) [1=7, 2='carol']"]
    );
    assert_eq!(fixture.db1.committed(), fixture.db2.committed());

    let plain = connection.create_statement().await.unwrap();
    assert!(matches!(
        plain.execute_prepared_update().await,
        Err(DbError::UnsupportedOperation(_))
    ));
}

#[tokio::test]
async fn test_closing_connection_closes_everything() {
    let fixture = fixture_with(two_replicas());
    let connection = fixture.source.connect().await.unwrap();
    let statement = connection.create_statement().await.unwrap();
    let rows = statement.execute_query("SELECT * FROM t").await.unwrap();

    connection.close().await;

    assert!(connection.is_closed());
    assert!(statement.is_closed());
    assert!(rows.is_closed());
    assert_eq!(fixture.db1.open_connections(), 0);
    assert_eq!(fixture.db2.open_connections(), 0);
    assert!(matches!(
        statement.execute_update("INSERT INTO t VALUES (1)").await,
        Err(DbError::Closed(_))
    ));
}
