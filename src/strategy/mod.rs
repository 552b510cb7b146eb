// ============================================================================
// Invocation Strategies
// ============================================================================
//
// A strategy decides how one Invoker reaches the replicas:
//
// - InvokeOnOne:  one replica chosen by the balancer (reads)
// - InvokeOnAll:  every active replica, primary's result is surfaced (writes)
// - Aggregate:    every active replica, canonical result picked by a rule
// - Bootstrap:    every replica factory, any survivor will do (connect)
// - Transactional: decorates another strategy with transaction lock hooks
//
// Failure policy for broadcasts: if the result-determining replica succeeds,
// every replica that failed is deactivated. If it fails, its error reaches
// the caller unchanged.
//
// ============================================================================

pub mod invoker;

pub use invoker::{InvocationTarget, InvokeFuture, Invoker, Reconciled};

use crate::balancer::{ReplicaSet, primary_of};
use crate::cluster::executor::Executor;
use crate::cluster::{Cluster, Replica};
use crate::core::{DbError, Result};
use crate::lock::transaction::LockSlot;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Which replica's value an aggregate invocation surfaces
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AggregateSelection {
    /// The local replica, else the lowest id
    #[default]
    Primary,
    LowestId,
    HighestId,
}

impl AggregateSelection {
    pub fn select(&self, replicas: &ReplicaSet) -> Option<Arc<Replica>> {
        match self {
            Self::Primary => primary_of(replicas),
            Self::LowestId => replicas.get_min().cloned(),
            Self::HighestId => replicas.get_max().cloned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvocationStrategy {
    InvokeOnOne,
    InvokeOnAll,
    Aggregate(AggregateSelection),
    Bootstrap,
    Transactional(TransactionBoundary),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPhase {
    /// First call of a transaction: lock is released if the call fails
    Begin,
    /// Commit/rollback: lock is released after the call
    End,
}

/// Lock hooks wrapped around another strategy.
#[derive(Debug, Clone)]
pub struct TransactionBoundary {
    inner: Box<InvocationStrategy>,
    phase: TransactionPhase,
    slot: LockSlot,
}

impl TransactionBoundary {
    pub(crate) fn new(inner: InvocationStrategy, phase: TransactionPhase, slot: LockSlot) -> Self {
        Self {
            inner: Box::new(inner),
            phase,
            slot,
        }
    }

    pub fn phase(&self) -> TransactionPhase {
        self.phase
    }

    pub fn inner(&self) -> &InvocationStrategy {
        &self.inner
    }

    fn complete(&self, succeeded: bool) {
        match self.phase {
            TransactionPhase::Begin if !succeeded => {
                self.slot.release();
            }
            TransactionPhase::Begin => {}
            TransactionPhase::End => {
                self.slot.release();
            }
        }
    }
}

impl PartialEq for TransactionBoundary {
    fn eq(&self, other: &Self) -> bool {
        self.phase == other.phase && self.inner == other.inner && self.slot.same_slot(&other.slot)
    }
}

impl InvocationStrategy {
    /// The strategy with every transaction boundary peeled off
    pub fn base(&self) -> &InvocationStrategy {
        let mut base = self;
        while let Self::Transactional(boundary) = base {
            base = boundary.inner();
        }
        base
    }

    /// True for strategies that reach every active replica
    pub fn is_broadcast(&self) -> bool {
        matches!(
            self.base(),
            Self::InvokeOnAll | Self::Aggregate(_) | Self::Bootstrap
        )
    }

    /// Run `invoker` against the target's objects and reconcile the results.
    pub async fn apply<T, R>(
        &self,
        mut target: InvocationTarget<T>,
        invoker: &Invoker<T, R>,
    ) -> Result<Reconciled<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
    {
        let boundaries = self.boundaries();
        if !boundaries.is_empty() {
            target.transactional = true;
        }

        let result = self.base().apply_base(target, invoker).await;

        for boundary in boundaries.iter().rev() {
            boundary.complete(result.is_ok());
        }
        result
    }

    /// Run the failure hooks of a call that never reached `apply`, e.g.
    /// because its proxy was already closed.
    pub(crate) fn abandon(&self) {
        for boundary in self.boundaries().iter().rev() {
            boundary.complete(false);
        }
    }

    fn boundaries(&self) -> Vec<&TransactionBoundary> {
        let mut boundaries = Vec::new();
        let mut base = self;
        while let Self::Transactional(boundary) = base {
            boundaries.push(boundary);
            base = boundary.inner();
        }
        boundaries
    }

    async fn apply_base<T, R>(
        &self,
        target: InvocationTarget<T>,
        invoker: &Invoker<T, R>,
    ) -> Result<Reconciled<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
    {
        let InvocationTarget {
            cluster,
            objects,
            transactional,
        } = target;

        if !cluster.is_active() {
            return Err(DbError::ClusterUnavailable(cluster.id().to_string()));
        }

        // One membership snapshot for the whole invocation
        let active = cluster.balancer().all();
        let candidates: BTreeMap<Arc<Replica>, T> = objects
            .into_iter()
            .filter(|(replica, _)| active.contains(replica.as_ref()))
            .collect();
        let replicas: ReplicaSet = candidates.keys().cloned().collect();

        let no_replica = || {
            DbError::NoReplicaAvailable(format!(
                "no active replica reachable in cluster '{}'",
                cluster.id()
            ))
        };
        if candidates.is_empty() {
            return Err(no_replica());
        }

        match self {
            Self::InvokeOnOne => invoke_on_one(&cluster, candidates, invoker).await,
            Self::InvokeOnAll => {
                let primary = primary_of(&replicas).ok_or_else(no_replica)?;
                let executor = cluster.executor(transactional).clone();
                let (successes, failures) =
                    dispatch_all(&cluster, &executor, candidates, invoker).await;
                reconcile(&cluster, primary, successes, failures).await
            }
            Self::Aggregate(selection) => {
                let chosen = selection.select(&replicas).ok_or_else(no_replica)?;
                let executor = cluster.executor(transactional).clone();
                let (successes, failures) =
                    dispatch_all(&cluster, &executor, candidates, invoker).await;
                reconcile(&cluster, chosen, successes, failures).await
            }
            Self::Bootstrap => {
                let primary = primary_of(&replicas).ok_or_else(no_replica)?;
                let executor = cluster.non_transactional_executor().clone();
                let (successes, failures) =
                    dispatch_all(&cluster, &executor, candidates, invoker).await;
                bootstrap(&cluster, primary, successes, failures).await
            }
            Self::Transactional(_) => Err(DbError::ExecutionError(
                "transaction boundary reached dispatch unwrapped".to_string(),
            )),
        }
    }
}

async fn within<R>(timeout: Option<Duration>, replica: String, call: InvokeFuture<R>) -> Result<R> {
    match timeout {
        None => call.await,
        Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
            DbError::Timeout(format!(
                "replica '{}' did not respond within {:?}",
                replica, limit
            ))
        })?,
    }
}

async fn invoke_on_one<T, R>(
    cluster: &Arc<Cluster>,
    mut candidates: BTreeMap<Arc<Replica>, T>,
    invoker: &Invoker<T, R>,
) -> Result<Reconciled<R>>
where
    T: Send + 'static,
    R: Send + 'static,
{
    let balancer = cluster.balancer();
    let timeout = cluster.replica_timeout();

    loop {
        let replica = match balancer.next().filter(|r| candidates.contains_key(r.as_ref())) {
            Some(replica) => replica,
            // This object was opened before the balancer's choice joined.
            // Weight 0 replicas take writes only, never reads.
            None => {
                let available: ReplicaSet = candidates
                    .keys()
                    .filter(|replica| replica.weight() > 0)
                    .cloned()
                    .collect();
                primary_of(&available).ok_or_else(|| {
                    DbError::NoReplicaAvailable(format!(
                        "no replica left to serve read in cluster '{}'",
                        cluster.id()
                    ))
                })?
            }
        };
        let Some(object) = candidates.remove(&replica) else {
            return Err(DbError::NoReplicaAvailable(replica.id().to_string()));
        };

        balancer.before_invocation(&replica);
        let result = within(
            timeout,
            replica.id().to_string(),
            invoker.invoke(replica.clone(), object),
        )
        .await;
        balancer.after_invocation(&replica);

        match result {
            Ok(value) => return Ok(Reconciled::single(replica, value)),
            Err(error)
                if error.indicates_replica_failure()
                    && candidates.keys().any(|replica| replica.weight() > 0) =>
            {
                debug!(replica = %replica, %error, "read failed, trying next replica");
                cluster.deactivate(&replica, &error).await;
            }
            Err(error) => return Err(error),
        }
    }
}

type Outcomes<R> = (BTreeMap<Arc<Replica>, R>, BTreeMap<Arc<Replica>, DbError>);

async fn dispatch_all<T, R>(
    cluster: &Arc<Cluster>,
    executor: &Executor,
    candidates: BTreeMap<Arc<Replica>, T>,
    invoker: &Invoker<T, R>,
) -> Outcomes<R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    let timeout = cluster.replica_timeout();
    debug!(
        cluster = cluster.id(),
        executor = executor.name(),
        replicas = candidates.len(),
        "broadcasting invocation"
    );

    let tasks = candidates.into_iter().map(|(replica, object)| {
        let call = invoker.invoke(replica.clone(), object);
        let handle = executor.spawn(within(timeout, replica.id().to_string(), call));
        async move { (replica, handle.await) }
    });
    let outcomes = join_all(tasks).await;

    let mut successes = BTreeMap::new();
    let mut failures = BTreeMap::new();
    for (replica, outcome) in outcomes {
        match outcome {
            Ok(Ok(value)) => {
                successes.insert(replica, value);
            }
            Ok(Err(error)) => {
                failures.insert(replica, error);
            }
            Err(join_error) => {
                let error = DbError::ExecutionError(format!(
                    "task for replica '{}' aborted: {}",
                    replica, join_error
                ));
                failures.insert(replica, error);
            }
        }
    }
    (successes, failures)
}

async fn reconcile<R>(
    cluster: &Arc<Cluster>,
    target: Arc<Replica>,
    mut successes: BTreeMap<Arc<Replica>, R>,
    mut failures: BTreeMap<Arc<Replica>, DbError>,
) -> Result<Reconciled<R>> {
    if let Some(value) = successes.remove(&target) {
        for (replica, error) in &failures {
            cluster.deactivate(replica, error).await;
        }
        check_quorum(cluster, successes.len() + 1)?;
        return Ok(Reconciled::new(target, value, successes));
    }

    let error = failures.remove(&target).unwrap_or_else(|| {
        DbError::ExecutionError(format!("no outcome recorded for replica '{}'", target))
    });
    let target_unreachable = error.indicates_replica_failure();
    let reachable = !successes.is_empty()
        || !target_unreachable
        || failures.values().any(|e| !e.indicates_replica_failure());

    // With every replica unreachable nothing is deactivated: the fault is
    // more likely between us and the cluster than in all replicas at once.
    if reachable {
        if target_unreachable {
            cluster.deactivate(&target, &error).await;
        }
        for (replica, failure) in &failures {
            if failure.indicates_replica_failure() {
                cluster.deactivate(replica, failure).await;
            }
        }
    }

    if !target_unreachable && !successes.is_empty() {
        warn!(
            cluster = cluster.id(),
            primary = %target,
            diverged = successes.len(),
            %error,
            "primary rejected a call other replicas accepted"
        );
        let cause = DbError::ExecutionError(format!(
            "diverged from replica '{}': {}",
            target, error
        ));
        for replica in successes.keys() {
            cluster.deactivate(replica, &cause).await;
        }
    }

    Err(error)
}

async fn bootstrap<R>(
    cluster: &Arc<Cluster>,
    primary: Arc<Replica>,
    mut successes: BTreeMap<Arc<Replica>, R>,
    mut failures: BTreeMap<Arc<Replica>, DbError>,
) -> Result<Reconciled<R>> {
    if successes.is_empty() {
        return Err(failures.remove(&primary).unwrap_or_else(|| {
            DbError::NoReplicaAvailable(format!("no replica of '{}' responded", cluster.id()))
        }));
    }

    // A replica without an object here would silently miss later broadcasts
    for (replica, error) in &failures {
        cluster.deactivate(replica, error).await;
    }
    check_quorum(cluster, successes.len())?;

    let survivors: ReplicaSet = successes.keys().cloned().collect();
    let chosen = if successes.contains_key(&primary) {
        primary
    } else {
        primary_of(&survivors).ok_or_else(|| {
            DbError::NoReplicaAvailable(format!("no replica of '{}' responded", cluster.id()))
        })?
    };
    let value = successes.remove(&chosen).ok_or_else(|| {
        DbError::ExecutionError(format!("no outcome recorded for replica '{}'", chosen))
    })?;
    Ok(Reconciled::new(chosen, value, successes))
}

fn check_quorum(cluster: &Cluster, survived: usize) -> Result<()> {
    let required = cluster.config().min_surviving_replicas;
    if survived < required {
        return Err(DbError::QuorumNotMet { required, survived });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterConfig, ReplicaConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cluster() -> Arc<Cluster> {
        Cluster::new(
            ClusterConfig::new("test")
                .replica(ReplicaConfig::new("db1").local())
                .replica(ReplicaConfig::new("db2")),
        )
        .unwrap()
    }

    fn target(cluster: &Arc<Cluster>) -> InvocationTarget<&'static str> {
        let objects = cluster
            .replicas()
            .into_iter()
            .map(|replica| {
                let label = if replica.id() == "db1" { "one" } else { "two" };
                (replica, label)
            })
            .collect();
        InvocationTarget {
            cluster: cluster.clone(),
            objects,
            transactional: false,
        }
    }

    #[tokio::test]
    async fn test_broadcast_returns_primary_value() {
        let cluster = cluster();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let invoker = Invoker::new(move |_, label: &'static str| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(label.to_uppercase()) }
        });

        let result = InvocationStrategy::InvokeOnAll
            .apply(target(&cluster), &invoker)
            .await
            .unwrap();
        assert_eq!(result.replica().id(), "db1");
        assert_eq!(result.value(), "ONE");
        assert_eq!(result.replica_count(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_aggregate_selection() {
        let cluster = cluster();
        let invoker = Invoker::new(|_, label: &'static str| async move { Ok(label) });

        let highest = InvocationStrategy::Aggregate(AggregateSelection::HighestId)
            .apply(target(&cluster), &invoker)
            .await
            .unwrap();
        assert_eq!(highest.into_value(), "two");

        let primary = InvocationStrategy::Aggregate(AggregateSelection::Primary)
            .apply(target(&cluster), &invoker)
            .await
            .unwrap();
        assert_eq!(primary.into_value(), "one");
    }

    #[tokio::test]
    async fn test_inactive_cluster_fails_fast() {
        let cluster = cluster();
        cluster.stop();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let invoker = Invoker::new(move |_, _: &'static str| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        });

        for strategy in [
            InvocationStrategy::InvokeOnOne,
            InvocationStrategy::InvokeOnAll,
            InvocationStrategy::Aggregate(AggregateSelection::Primary),
            InvocationStrategy::Bootstrap,
        ] {
            let result = strategy.apply(target(&cluster), &invoker).await;
            assert!(matches!(result, Err(DbError::ClusterUnavailable(_))));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_primary_failure_deactivates() {
        let cluster = cluster();
        let invoker = Invoker::new(|replica: Arc<Replica>, label: &'static str| async move {
            if replica.id() == "db2" {
                Err(DbError::ConnectionError("reset by peer".into()))
            } else {
                Ok(label)
            }
        });

        let result = InvocationStrategy::InvokeOnAll
            .apply(target(&cluster), &invoker)
            .await
            .unwrap();
        assert_eq!(result.into_value(), "one");
        let active: Vec<String> = cluster
            .balancer()
            .all()
            .iter()
            .map(|r| r.id().to_string())
            .collect();
        assert_eq!(active, vec!["db1"]);
    }

    #[tokio::test]
    async fn test_primary_failure_propagates() {
        let cluster = cluster();
        let invoker = Invoker::new(|replica: Arc<Replica>, _: &'static str| async move {
            if replica.id() == "db1" {
                Err(DbError::ConstraintViolation("duplicate key".into()))
            } else {
                Ok(())
            }
        });

        let result = InvocationStrategy::InvokeOnAll
            .apply(target(&cluster), &invoker)
            .await;
        assert!(matches!(result, Err(DbError::ConstraintViolation(_))));
        // db2 accepted what the primary rejected
        assert!(cluster.balancer().contains(&Replica::new("db1", 1)));
        assert!(!cluster.balancer().contains(&Replica::new("db2", 1)));
    }

    #[tokio::test]
    async fn test_unreachable_primary_is_deactivated_but_error_surfaces() {
        let cluster = cluster();
        let invoker = Invoker::new(|replica: Arc<Replica>, _: &'static str| async move {
            if replica.id() == "db1" {
                Err(DbError::ConnectionError("refused".into()))
            } else {
                Ok(())
            }
        });

        let result = InvocationStrategy::InvokeOnAll
            .apply(target(&cluster), &invoker)
            .await;
        assert!(matches!(result, Err(DbError::ConnectionError(_))));
        assert!(!cluster.balancer().contains(&Replica::new("db1", 1)));
        assert!(cluster.balancer().contains(&Replica::new("db2", 1)));
    }

    #[tokio::test]
    async fn test_total_failure_keeps_membership() {
        let cluster = cluster();
        let invoker = Invoker::new(|_, _: &'static str| async move {
            Err::<(), _>(DbError::ConnectionError("network down".into()))
        });

        let result = InvocationStrategy::InvokeOnAll
            .apply(target(&cluster), &invoker)
            .await;
        assert!(matches!(result, Err(DbError::ConnectionError(_))));
        assert_eq!(cluster.balancer().all().len(), 2);
    }

    #[tokio::test]
    async fn test_statement_error_everywhere_keeps_membership() {
        let cluster = cluster();
        let invoker = Invoker::new(|_, _: &'static str| async move {
            Err::<(), _>(DbError::ExecutionError("syntax error".into()))
        });

        let result = InvocationStrategy::InvokeOnAll
            .apply(target(&cluster), &invoker)
            .await;
        assert!(matches!(result, Err(DbError::ExecutionError(_))));
        assert_eq!(cluster.balancer().all().len(), 2);
    }

    #[tokio::test]
    async fn test_quorum_policy() {
        let cluster = Cluster::new(
            ClusterConfig::new("strict")
                .replica(ReplicaConfig::new("db1").local())
                .replica(ReplicaConfig::new("db2"))
                .min_surviving_replicas(2),
        )
        .unwrap();
        let invoker = Invoker::new(|replica: Arc<Replica>, _: &'static str| async move {
            if replica.id() == "db2" {
                Err(DbError::ConnectionError("gone".into()))
            } else {
                Ok(())
            }
        });

        let result = InvocationStrategy::InvokeOnAll
            .apply(target(&cluster), &invoker)
            .await;
        assert!(matches!(
            result,
            Err(DbError::QuorumNotMet {
                required: 2,
                survived: 1
            })
        ));
    }

    #[tokio::test]
    async fn test_invoke_on_one_fails_over_on_replica_failure() {
        let cluster = cluster();
        let invoker = Invoker::new(|replica: Arc<Replica>, label: &'static str| async move {
            if replica.id() == "db1" {
                Err(DbError::ConnectionError("dead".into()))
            } else {
                Ok(label)
            }
        });

        // Round robin starts with db1
        let result = InvocationStrategy::InvokeOnOne
            .apply(target(&cluster), &invoker)
            .await
            .unwrap();
        assert_eq!(result.into_value(), "two");
        assert_eq!(cluster.balancer().all().len(), 1);
    }

    #[tokio::test]
    async fn test_invoke_on_one_never_reads_from_weight_zero() {
        let cluster = Cluster::new(
            ClusterConfig::new("test")
                .replica(ReplicaConfig::new("db1").local().weight(0))
                .replica(ReplicaConfig::new("db2").weight(0)),
        )
        .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let invoker = Invoker::new(move |_, label: &'static str| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(label) }
        });

        let result = InvocationStrategy::InvokeOnOne
            .apply(target(&cluster), &invoker)
            .await;
        assert!(matches!(result, Err(DbError::NoReplicaAvailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Writes still reach them
        let written = InvocationStrategy::InvokeOnAll
            .apply(target(&cluster), &invoker)
            .await
            .unwrap();
        assert_eq!(written.replica_count(), 2);
    }

    #[tokio::test]
    async fn test_invoke_on_one_returns_statement_errors() {
        let cluster = cluster();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let invoker = Invoker::new(move |_, _: &'static str| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(DbError::ExecutionError("no such table".into())) }
        });

        let result = InvocationStrategy::InvokeOnOne
            .apply(target(&cluster), &invoker)
            .await;
        assert!(matches!(result, Err(DbError::ExecutionError(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cluster.balancer().all().len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let cluster = Cluster::new(
            ClusterConfig::new("slow")
                .replica(ReplicaConfig::new("db1").local())
                .replica(ReplicaConfig::new("db2"))
                .replica_timeout(Duration::from_millis(50)),
        )
        .unwrap();
        let invoker = Invoker::new(|replica: Arc<Replica>, _: &'static str| async move {
            if replica.id() == "db2" {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok(())
        });

        let result = InvocationStrategy::InvokeOnAll
            .apply(target(&cluster), &invoker)
            .await;
        assert!(result.is_ok());
        assert!(!cluster.replica("db2").unwrap().is_active());
    }

    #[tokio::test]
    async fn test_bootstrap_tolerates_primary_failure() {
        let cluster = cluster();
        let invoker = Invoker::new(|replica: Arc<Replica>, label: &'static str| async move {
            if replica.id() == "db1" {
                Err(DbError::ExecutionError("authentication failed".into()))
            } else {
                Ok(label)
            }
        });

        let result = InvocationStrategy::Bootstrap
            .apply(target(&cluster), &invoker)
            .await
            .unwrap();
        assert_eq!(result.replica().id(), "db2");
        assert_eq!(result.into_value(), "two");
        assert!(!cluster.replica("db1").unwrap().is_active());
    }

    #[tokio::test]
    async fn test_inactive_replicas_are_skipped() {
        let cluster = cluster();
        let db2 = cluster.replica("db2").unwrap();
        cluster
            .deactivate(&db2, &DbError::ConnectionError("test".into()))
            .await;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let invoker = Invoker::new(move |_, _: &'static str| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        });
        InvocationStrategy::InvokeOnAll
            .apply(target(&cluster), &invoker)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_base_peels_boundaries() {
        let wrapped = InvocationStrategy::Transactional(TransactionBoundary::new(
            InvocationStrategy::InvokeOnAll,
            TransactionPhase::End,
            LockSlot::default(),
        ));
        assert_eq!(wrapped.base(), &InvocationStrategy::InvokeOnAll);
        assert!(wrapped.is_broadcast());
        assert!(!InvocationStrategy::InvokeOnOne.is_broadcast());
    }
}
