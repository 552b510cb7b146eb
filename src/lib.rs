// ============================================================================
// dbcluster Library
// ============================================================================
//
// One logical database handle over N replicas: writes are broadcast to every
// active replica, reads go to one replica chosen by a balancer, and a
// replica that fails is dropped from the cluster without failing the client.
//
// ============================================================================

pub mod backend;
pub mod balancer;
pub mod cluster;
pub mod core;
pub mod lock;
pub mod proxy;
pub mod spool;
pub mod sql;
pub mod strategy;

// Re-export main types for convenience
pub use crate::core::{DbError, Result, Value};
pub use balancer::{Balancer, BalancerKind, ReplicaSet};
pub use cluster::{Cluster, ClusterConfig, Replica, ReplicaConfig, ReplicaStatus};
pub use lock::{LockManager, TransactionContext};
pub use spool::FileSupport;
pub use strategy::{AggregateSelection, InvocationStrategy, Invoker};

// Re-export client API
pub use proxy::{
    ClusterConnection, ClusterDataSource, ClusterLargeObject, ClusterResultSet, ClusterSavepoint,
    ClusterStatement,
};
