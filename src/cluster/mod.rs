// ============================================================================
// Cluster
// ============================================================================
//
// Owns everything the invocation engine consults on each call:
//
//   Cluster
//     ├── replicas        every known replica, by id
//     ├── balancer        the active subset + read selection
//     ├── lock_manager    named locks, "global" guards membership
//     ├── executors       transactional / non-transactional worker pools
//     └── trees           weak refs to live proxy trees, pruned on failure
//
// Failure-driven deactivation does not take the global lock: it runs while
// the failing invocation may itself be inside a transaction holding the
// global read lock. Administrative membership changes do take it.
//
// ============================================================================

pub mod config;
pub mod executor;
pub mod replica;

pub use config::{ClusterConfig, ReplicaConfig};
pub use executor::Executor;
pub use replica::{Replica, ReplicaStatus};

use crate::balancer::{Balancer, ReplicaSet};
use crate::core::{DbError, Result};
use crate::lock::LockManager;
use crate::proxy::tree::ProxyTree;
use crate::sql::SqlClassifier;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tracing::{info, warn};

pub struct Cluster {
    config: ClusterConfig,
    replicas: RwLock<BTreeMap<String, Arc<Replica>>>,
    balancer: Arc<dyn Balancer>,
    lock_manager: Arc<LockManager>,
    transactional_executor: Executor,
    non_transactional_executor: Executor,
    sql: SqlClassifier,
    active: AtomicBool,
    trees: Mutex<Vec<Weak<ProxyTree>>>,
}

impl Cluster {
    /// Build a started cluster from validated configuration.
    pub fn new(config: ClusterConfig) -> Result<Arc<Self>> {
        config.validate().map_err(DbError::ConfigError)?;

        let mut replicas = BTreeMap::new();
        for replica_config in &config.replicas {
            let replica = Arc::new(build_replica(replica_config));
            replicas.insert(replica.id().to_string(), replica);
        }
        let balancer = config.balancer.create(
            replicas
                .values()
                .filter(|replica| replica.is_active())
                .cloned(),
        );

        info!(
            cluster = %config.id,
            replicas = replicas.len(),
            balancer = %config.balancer,
            "cluster created"
        );

        Ok(Arc::new(Self {
            transactional_executor: Executor::new("transactional", config.transactional_pool_size),
            non_transactional_executor: Executor::new(
                "non-transactional",
                config.non_transactional_pool_size,
            ),
            sql: SqlClassifier::new(config.sql_cache_size, config.detect_sequences),
            replicas: RwLock::new(replicas),
            balancer,
            lock_manager: Arc::new(LockManager::new()),
            active: AtomicBool::new(true),
            trees: Mutex::new(Vec::new()),
            config,
        }))
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn start(&self) {
        if !self.active.swap(true, Ordering::SeqCst) {
            info!(cluster = %self.config.id, "cluster started");
        }
    }

    /// Further invocations fail with `ClusterUnavailable` until `start`.
    pub fn stop(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            info!(cluster = %self.config.id, "cluster stopped");
        }
    }

    pub fn balancer(&self) -> &Arc<dyn Balancer> {
        &self.balancer
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn transactional_executor(&self) -> &Executor {
        &self.transactional_executor
    }

    pub fn non_transactional_executor(&self) -> &Executor {
        &self.non_transactional_executor
    }

    pub fn executor(&self, transactional: bool) -> &Executor {
        if transactional {
            &self.transactional_executor
        } else {
            &self.non_transactional_executor
        }
    }

    pub fn sql(&self) -> &SqlClassifier {
        &self.sql
    }

    pub fn replica_timeout(&self) -> Option<Duration> {
        self.config.replica_timeout_duration()
    }

    pub fn replica(&self, id: &str) -> Option<Arc<Replica>> {
        self.replicas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Every known replica, active or not, ordered by id
    pub fn replicas(&self) -> Vec<Arc<Replica>> {
        self.replicas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn active_replicas(&self) -> ReplicaSet {
        self.balancer.all()
    }

    pub fn primary(&self) -> Option<Arc<Replica>> {
        self.balancer.primary()
    }

    pub fn status(&self) -> Vec<ReplicaStatus> {
        self.replicas()
            .iter()
            .map(|replica| replica.status())
            .collect()
    }

    /// Drop a failed replica from the active set and from every live proxy
    /// tree. Returns false if it was not active.
    pub async fn deactivate(&self, replica: &Arc<Replica>, cause: &DbError) -> bool {
        if !self.balancer.remove(replica) {
            return false;
        }
        replica.set_active(false);
        warn!(
            cluster = %self.config.id,
            replica = %replica,
            error = %cause,
            "replica deactivated"
        );

        for tree in self.live_trees() {
            tree.prune(replica, false).await;
        }
        true
    }

    /// Return a known replica to the active set. Waits for in-flight
    /// transactions to finish.
    pub async fn activate(&self, replica: &Arc<Replica>) -> Result<bool> {
        let known = self.replica(replica.id()).ok_or_else(|| {
            DbError::ConfigError(format!("Unknown replica '{}'", replica.id()))
        })?;

        let _guard = self.lock_manager.global_write_lock().lock().await;
        if !self.balancer.add(known.clone()) {
            return Ok(false);
        }
        known.set_active(true);
        info!(cluster = %self.config.id, replica = %known, "replica activated");
        Ok(true)
    }

    /// Register a new replica. Active replicas join the balancer at once.
    pub async fn add_replica(&self, config: ReplicaConfig) -> Result<Arc<Replica>> {
        if config.id.trim().is_empty() {
            return Err(DbError::ConfigError("Replica id cannot be empty".to_string()));
        }

        let _guard = self.lock_manager.global_write_lock().lock().await;
        let replica = {
            let mut replicas = self.replicas.write().unwrap_or_else(PoisonError::into_inner);
            if replicas.contains_key(&config.id) {
                return Err(DbError::ConfigError(format!(
                    "Duplicate replica id '{}'",
                    config.id
                )));
            }
            if config.local && replicas.values().any(|replica| replica.is_local()) {
                return Err(DbError::ConfigError(
                    "At most one replica can be local".to_string(),
                ));
            }
            let replica = Arc::new(build_replica(&config));
            replicas.insert(replica.id().to_string(), replica.clone());
            replica
        };

        if replica.is_active() {
            self.balancer.add(replica.clone());
        }
        info!(
            cluster = %self.config.id,
            replica = %replica,
            active = replica.is_active(),
            "replica added"
        );
        Ok(replica)
    }

    /// Forget a replica entirely, closing its objects in every proxy tree.
    pub async fn remove_replica(&self, id: &str) -> Result<Arc<Replica>> {
        let replica = {
            let _guard = self.lock_manager.global_write_lock().lock().await;
            let replica = self
                .replicas
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(id)
                .ok_or_else(|| DbError::ConfigError(format!("Unknown replica '{}'", id)))?;
            self.balancer.remove(&replica);
            replica.set_active(false);
            replica
        };

        for tree in self.live_trees() {
            tree.prune(&replica, true).await;
        }
        info!(cluster = %self.config.id, replica = %replica, "replica removed");
        Ok(replica)
    }

    pub(crate) fn register_tree(&self, tree: &Arc<ProxyTree>) {
        let mut trees = self.trees.lock().unwrap_or_else(PoisonError::into_inner);
        trees.retain(|weak| weak.strong_count() > 0);
        trees.push(Arc::downgrade(tree));
    }

    fn live_trees(&self) -> Vec<Arc<ProxyTree>> {
        self.trees
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

fn build_replica(config: &ReplicaConfig) -> Replica {
    let mut replica = Replica::new(config.id.clone(), config.weight);
    if config.local {
        replica = replica.local();
    }
    if !config.active {
        replica.set_active(false);
    }
    replica
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("id", &self.config.id)
            .field("active", &self.is_active())
            .field("balancer", &self.balancer)
            .finish()
    }
}
