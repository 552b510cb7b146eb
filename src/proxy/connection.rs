use super::{
    ClusterLargeObject, ClusterSavepoint, ClusterStatement, ObjectKind, ProxyNode,
    TransactionScope,
};
use crate::backend::{BackendConnection, BackendSavepoint};
use crate::cluster::Replica;
use crate::core::{DbError, Result};
use crate::lock::TransactionContext;
use crate::lock::transaction::TransactionState;
use crate::strategy::{InvocationStrategy, Invoker};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// One logical connection, backed by a connection on each replica.
#[derive(Debug)]
pub struct ClusterConnection {
    node: ProxyNode,
    scope: TransactionScope,
}

impl ClusterConnection {
    pub(crate) fn new(node: ProxyNode) -> Result<Self> {
        let transaction = Arc::new(TransactionContext::new(
            node.cluster().lock_manager().clone(),
        ));
        node.bind_transaction(transaction.clone())?;
        Ok(Self {
            node,
            scope: TransactionScope::new(transaction),
        })
    }

    pub fn node(&self) -> &ProxyNode {
        &self.node
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.scope.transaction.state()
    }

    pub fn auto_commit(&self) -> bool {
        self.scope.auto_commit()
    }

    /// Switching autocommit back on commits the open transaction, so it is
    /// treated as a transaction boundary.
    pub async fn set_auto_commit(&self, auto_commit: bool) -> Result<()> {
        let strategy = if auto_commit {
            self.scope.end(InvocationStrategy::InvokeOnAll)
        } else {
            InvocationStrategy::InvokeOnAll
        };
        let invoker = Invoker::new(move |_, connection: Arc<dyn BackendConnection>| async move {
            connection.set_auto_commit(auto_commit).await
        });
        self.node.invoke(&strategy, &invoker).await?;
        self.scope.set_auto_commit(auto_commit);
        Ok(())
    }

    pub async fn create_statement(&self) -> Result<ClusterStatement> {
        let invoker = Invoker::new(|_, connection: Arc<dyn BackendConnection>| async move {
            connection.create_statement().await
        });
        let node = self
            .node
            .invoke_child(
                &InvocationStrategy::InvokeOnAll,
                &invoker,
                ObjectKind::Statement,
            )
            .await?;
        Ok(ClusterStatement::new(node, self.scope.clone(), None))
    }

    pub async fn prepare_statement(&self, sql: &str) -> Result<ClusterStatement> {
        let prepared = sql.to_string();
        let invoker = Invoker::new(move |_, connection: Arc<dyn BackendConnection>| {
            let sql = prepared.clone();
            async move { connection.prepare_statement(&sql).await }
        });
        let node = self
            .node
            .invoke_child(
                &InvocationStrategy::InvokeOnAll,
                &invoker,
                ObjectKind::PreparedStatement,
            )
            .await?;
        Ok(ClusterStatement::new(
            node,
            self.scope.clone(),
            Some(sql.to_string()),
        ))
    }

    pub async fn commit(&self) -> Result<()> {
        let strategy = self.scope.end(InvocationStrategy::InvokeOnAll);
        let invoker = Invoker::new(|_, connection: Arc<dyn BackendConnection>| async move {
            connection.commit().await
        });
        self.node.invoke(&strategy, &invoker).await?;
        Ok(())
    }

    pub async fn rollback(&self) -> Result<()> {
        let strategy = self.scope.end(InvocationStrategy::InvokeOnAll);
        let invoker = Invoker::new(|_, connection: Arc<dyn BackendConnection>| async move {
            connection.rollback().await
        });
        self.node.invoke(&strategy, &invoker).await?;
        Ok(())
    }

    /// Create a savepoint on every replica. Unnamed savepoints get a
    /// generated name, identical across replicas.
    pub async fn set_savepoint(&self, name: Option<&str>) -> Result<ClusterSavepoint> {
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("sp_{}", Uuid::new_v4().simple()));

        let strategy = self.scope.start(InvocationStrategy::InvokeOnAll).await?;
        let savepoint_name = name.clone();
        let invoker = Invoker::new(move |_, connection: Arc<dyn BackendConnection>| {
            let name = savepoint_name.clone();
            async move { connection.set_savepoint(&name).await }
        });
        let node = self
            .node
            .invoke_child(&strategy, &invoker, ObjectKind::Savepoint)
            .await?;
        Ok(ClusterSavepoint::new(node, name))
    }

    pub async fn rollback_to_savepoint(&self, savepoint: &ClusterSavepoint) -> Result<()> {
        let invoker = savepoint_invoker(savepoint, |connection, handle| async move {
            connection.rollback_to_savepoint(handle).await
        });
        let strategy = self.scope.start(InvocationStrategy::InvokeOnAll).await?;
        self.node.invoke(&strategy, &invoker).await?;
        Ok(())
    }

    /// Release the savepoint on every replica and close it.
    pub async fn release_savepoint(&self, savepoint: &ClusterSavepoint) -> Result<()> {
        let invoker = savepoint_invoker(savepoint, |connection, handle| async move {
            connection.release_savepoint(handle).await
        });
        let strategy = self.scope.start(InvocationStrategy::InvokeOnAll).await?;
        self.node.invoke(&strategy, &invoker).await?;
        self.node.remove_child(savepoint.node()).await;
        Ok(())
    }

    pub async fn create_large_object(&self) -> Result<ClusterLargeObject> {
        let strategy = self.scope.start(InvocationStrategy::InvokeOnAll).await?;
        let invoker = Invoker::new(|_, connection: Arc<dyn BackendConnection>| async move {
            connection.create_large_object().await
        });
        let node = self
            .node
            .invoke_child(&strategy, &invoker, ObjectKind::LargeObject)
            .await?;
        Ok(ClusterLargeObject::new(node, self.scope.clone()))
    }

    pub async fn server_version(&self) -> Result<String> {
        let invoker = Invoker::new(|_, connection: Arc<dyn BackendConnection>| async move {
            connection.server_version().await
        });
        let reconciled = self
            .node
            .invoke(&InvocationStrategy::InvokeOnOne, &invoker)
            .await?;
        Ok(reconciled.into_value())
    }

    /// Close every statement and the connection on each replica. An open
    /// transaction's lock is released; its work is discarded by the backends.
    pub async fn close(&self) {
        self.scope.transaction.close();
        self.node.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.node.is_closed()
    }
}

/// Invoker that hands each replica's connection its own savepoint handle.
fn savepoint_invoker<F, Fut>(
    savepoint: &ClusterSavepoint,
    call: F,
) -> Invoker<Arc<dyn BackendConnection>, ()>
where
    F: Fn(Arc<dyn BackendConnection>, Arc<dyn BackendSavepoint>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let handles: Arc<BTreeMap<Arc<Replica>, Arc<dyn BackendSavepoint>>> =
        Arc::new(savepoint.node().objects());
    let name = savepoint.name().to_string();
    Invoker::new(move |replica: Arc<Replica>, connection: Arc<dyn BackendConnection>| {
        let handle = handles.get(&replica).cloned().ok_or_else(|| {
            DbError::ExecutionError(format!(
                "Savepoint '{}' does not exist on replica '{}'",
                name, replica
            ))
        });
        let call = handle.map(|handle| call(connection, handle));
        async move { call?.await }
    })
}
