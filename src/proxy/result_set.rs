use super::{ProxyNode, TransactionScope};
use crate::backend::BackendResultSet;
use crate::core::{Result, Value};
use crate::strategy::{InvocationStrategy, Invoker};
use std::sync::Arc;

/// Cursor over a query's results.
///
/// A broadcast query leaves one cursor per replica; they are advanced
/// together so that updates through the cursor hit the same row everywhere.
#[derive(Debug)]
pub struct ClusterResultSet {
    node: ProxyNode,
    scope: TransactionScope,
}

impl ClusterResultSet {
    pub(crate) fn new(node: ProxyNode, scope: TransactionScope) -> Self {
        Self { node, scope }
    }

    pub fn node(&self) -> &ProxyNode {
        &self.node
    }

    pub async fn next(&self) -> Result<bool> {
        let invoker = Invoker::new(|_, rows: Arc<dyn BackendResultSet>| async move {
            rows.next().await
        });
        Ok(self
            .node
            .invoke(&InvocationStrategy::InvokeOnAll, &invoker)
            .await?
            .into_value())
    }

    pub async fn get(&self, column: usize) -> Result<Value> {
        let invoker = Invoker::new(move |_, rows: Arc<dyn BackendResultSet>| async move {
            rows.get(column).await
        });
        Ok(self
            .node
            .invoke(&InvocationStrategy::InvokeOnOne, &invoker)
            .await?
            .into_value())
    }

    /// Update a column of the current row on every replica.
    pub async fn update(&self, column: usize, value: Value) -> Result<()> {
        let strategy = self.scope.start(InvocationStrategy::InvokeOnAll).await?;
        let invoker = Invoker::new(move |_, rows: Arc<dyn BackendResultSet>| {
            let value = value.clone();
            async move { rows.update(column, value).await }
        });
        self.node.invoke(&strategy, &invoker).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.node.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.node.is_closed()
    }
}
