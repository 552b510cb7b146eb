//! Client-facing proxies.
//!
//! Each type wraps one `ProxyNode` and turns its calls into an `Invoker`
//! plus a strategy: reads go to one replica, everything that changes state
//! is broadcast.

pub mod connection;
pub mod datasource;
pub mod large_object;
pub mod result_set;
pub mod savepoint;
pub mod statement;
pub mod tree;

pub use connection::ClusterConnection;
pub use datasource::ClusterDataSource;
pub use large_object::ClusterLargeObject;
pub use result_set::ClusterResultSet;
pub use savepoint::ClusterSavepoint;
pub use statement::ClusterStatement;
pub use tree::{NodeId, ObjectKind, Proxied, ProxyNode, ProxyTree, RealObject};

use crate::core::Result;
use crate::lock::TransactionContext;
use crate::strategy::InvocationStrategy;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Transaction state of one logical connection, shared with every object
/// created through it.
#[derive(Debug, Clone)]
pub(crate) struct TransactionScope {
    transaction: Arc<TransactionContext>,
    auto_commit: Arc<AtomicBool>,
}

impl TransactionScope {
    fn new(transaction: Arc<TransactionContext>) -> Self {
        Self {
            transaction,
            auto_commit: Arc::new(AtomicBool::new(true)),
        }
    }

    fn auto_commit(&self) -> bool {
        self.auto_commit.load(Ordering::SeqCst)
    }

    fn set_auto_commit(&self, auto_commit: bool) {
        self.auto_commit.store(auto_commit, Ordering::SeqCst);
    }

    /// Strategy for a call that may begin a transaction
    async fn start(&self, strategy: InvocationStrategy) -> Result<InvocationStrategy> {
        self.transaction.start(strategy, self.auto_commit()).await
    }

    /// Strategy for a call that ends one
    fn end(&self, strategy: InvocationStrategy) -> InvocationStrategy {
        self.transaction.end(strategy)
    }
}
