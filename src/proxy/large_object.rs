use super::{ProxyNode, TransactionScope};
use crate::backend::{BackendLargeObject, ByteStream};
use crate::core::Result;
use crate::strategy::{InvocationStrategy, Invoker};
use std::sync::Arc;

/// A large object created on every replica.
#[derive(Debug)]
pub struct ClusterLargeObject {
    node: ProxyNode,
    scope: TransactionScope,
}

impl ClusterLargeObject {
    pub(crate) fn new(node: ProxyNode, scope: TransactionScope) -> Self {
        Self { node, scope }
    }

    pub fn node(&self) -> &ProxyNode {
        &self.node
    }

    /// Append `data` on every replica; returns the new length.
    pub async fn write(&self, data: ByteStream) -> Result<u64> {
        let files = self.node.file_support()?;
        let file = files.create_file(data).await?;

        let strategy = self.scope.start(InvocationStrategy::InvokeOnAll).await?;
        let invoker = Invoker::new(move |_, object: Arc<dyn BackendLargeObject>| {
            let files = files.clone();
            let file = file.clone();
            async move {
                let input = files.input_stream(&file).await?;
                object.write(Box::new(input)).await
            }
        });
        Ok(self.node.invoke(&strategy, &invoker).await?.into_value())
    }

    pub async fn length(&self) -> Result<u64> {
        let invoker = Invoker::new(|_, object: Arc<dyn BackendLargeObject>| async move {
            object.length().await
        });
        Ok(self
            .node
            .invoke(&InvocationStrategy::InvokeOnOne, &invoker)
            .await?
            .into_value())
    }

    pub async fn read_all(&self) -> Result<Vec<u8>> {
        let invoker = Invoker::new(|_, object: Arc<dyn BackendLargeObject>| async move {
            object.read_all().await
        });
        Ok(self
            .node
            .invoke(&InvocationStrategy::InvokeOnOne, &invoker)
            .await?
            .into_value())
    }

    /// Free the object on every replica.
    pub async fn free(&self) {
        self.node.close().await;
    }

    pub fn is_freed(&self) -> bool {
        self.node.is_closed()
    }
}
