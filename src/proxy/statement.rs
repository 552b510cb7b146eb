use super::{ClusterLargeObject, ClusterResultSet, ObjectKind, ProxyNode, TransactionScope};
use crate::backend::{BackendLargeObject, BackendResultSet, BackendStatement, ByteStream, CharStream};
use crate::cluster::{Cluster, Replica};
use crate::core::{DbError, Result, Value};
use crate::lock::LockGuard;
use crate::sql::SqlTraits;
use crate::strategy::{InvocationStrategy, Invoker};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

/// A plain or prepared statement on every replica.
///
/// Plain reads run on one replica. Writes, `SELECT ... FOR UPDATE` and
/// anything that draws from a sequence are broadcast; sequence draws also
/// hold the sequence's cluster lock so every replica hands out the same value.
#[derive(Debug)]
pub struct ClusterStatement {
    node: ProxyNode,
    scope: TransactionScope,
    sql: Option<String>,
    batch_locks: Mutex<BTreeSet<String>>,
}

impl ClusterStatement {
    pub(crate) fn new(node: ProxyNode, scope: TransactionScope, sql: Option<String>) -> Self {
        Self {
            node,
            scope,
            sql,
            batch_locks: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn node(&self) -> &ProxyNode {
        &self.node
    }

    /// SQL this statement was prepared with, if any
    pub fn sql(&self) -> Option<&str> {
        self.sql.as_deref()
    }

    fn cluster(&self) -> &Arc<Cluster> {
        self.node.cluster()
    }

    fn prepared_sql(&self) -> Result<&str> {
        self.sql.as_deref().ok_or_else(|| {
            DbError::UnsupportedOperation("statement was not prepared".to_string())
        })
    }

    async fn lock_sequences(&self, traits: &SqlTraits) -> Vec<LockGuard> {
        if traits.sequences.is_empty() {
            return Vec::new();
        }
        self.cluster()
            .lock_manager()
            .write_lock_all(traits.lock_names())
            .await
    }

    pub async fn execute_query(&self, sql: &str) -> Result<ClusterResultSet> {
        let query = sql.to_string();
        let invoker = Invoker::new(move |_, statement: Arc<dyn BackendStatement>| {
            let sql = query.clone();
            async move { statement.execute_query(&sql).await }
        });
        self.query(sql, &invoker).await
    }

    pub async fn execute_update(&self, sql: &str) -> Result<u64> {
        let update = sql.to_string();
        let invoker = Invoker::new(move |_, statement: Arc<dyn BackendStatement>| {
            let sql = update.clone();
            async move { statement.execute_update(&sql).await }
        });
        self.update(sql, InvocationStrategy::InvokeOnAll, &invoker).await
    }

    /// Execute an insert and return its generated key. Replicas may generate
    /// different keys; the configured aggregate selection decides which one
    /// the caller sees.
    pub async fn execute_insert(&self, sql: &str) -> Result<i64> {
        let insert = sql.to_string();
        let invoker = Invoker::new(move |_, statement: Arc<dyn BackendStatement>| {
            let sql = insert.clone();
            async move { statement.execute_insert(&sql).await }
        });
        let selection = self.cluster().config().aggregate_selection;
        self.update(sql, InvocationStrategy::Aggregate(selection), &invoker)
            .await
    }

    pub async fn add_batch(&self, sql: &str) -> Result<()> {
        let traits = self.cluster().sql().classify(sql);
        let batched = sql.to_string();
        let invoker = Invoker::new(move |_, statement: Arc<dyn BackendStatement>| {
            let sql = batched.clone();
            async move { statement.add_batch(&sql).await }
        });
        self.node
            .invoke(&InvocationStrategy::InvokeOnAll, &invoker)
            .await?;
        self.batch_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(traits.lock_names());
        Ok(())
    }

    pub async fn execute_batch(&self) -> Result<Vec<u64>> {
        let names: Vec<String> = std::mem::take(
            &mut *self
                .batch_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
        .into_iter()
        .collect();

        let strategy = self.scope.start(InvocationStrategy::InvokeOnAll).await?;
        let _locks = self.cluster().lock_manager().write_lock_all(names).await;
        let invoker = Invoker::new(|_, statement: Arc<dyn BackendStatement>| async move {
            statement.execute_batch().await
        });
        Ok(self.node.invoke(&strategy, &invoker).await?.into_value())
    }

    pub async fn set_parameter(&self, index: usize, value: Value) -> Result<()> {
        let invoker = Invoker::new(move |_, statement: Arc<dyn BackendStatement>| {
            let value = value.clone();
            async move { statement.set_parameter(index, value).await }
        });
        self.node
            .invoke(&InvocationStrategy::InvokeOnAll, &invoker)
            .await?;
        Ok(())
    }

    /// Bind a binary stream. The stream is spooled once and each replica
    /// reads its own copy.
    pub async fn set_binary_stream(&self, index: usize, stream: ByteStream) -> Result<()> {
        let files = self.node.file_support()?;
        let file = files.create_file(stream).await?;

        let invoker = Invoker::new(move |_, statement: Arc<dyn BackendStatement>| {
            let files = files.clone();
            let file = file.clone();
            async move {
                let input = files.input_stream(&file).await?;
                statement.set_binary_stream(index, Box::new(input)).await
            }
        });
        self.node
            .invoke(&InvocationStrategy::InvokeOnAll, &invoker)
            .await?;
        Ok(())
    }

    pub async fn set_character_stream(&self, index: usize, reader: CharStream) -> Result<()> {
        let files = self.node.file_support()?;
        let file = files.create_file(reader).await?;

        let invoker = Invoker::new(move |_, statement: Arc<dyn BackendStatement>| {
            let files = files.clone();
            let file = file.clone();
            async move {
                let reader = files.reader(&file).await?;
                statement.set_character_stream(index, Box::new(reader)).await
            }
        });
        self.node
            .invoke(&InvocationStrategy::InvokeOnAll, &invoker)
            .await?;
        Ok(())
    }

    /// Bind a large object; each replica receives its own handle for it.
    pub async fn set_large_object(&self, index: usize, object: &ClusterLargeObject) -> Result<()> {
        let handles: Arc<BTreeMap<Arc<Replica>, Arc<dyn BackendLargeObject>>> =
            Arc::new(object.node().objects());
        let invoker = Invoker::new(move |replica: Arc<Replica>, statement: Arc<dyn BackendStatement>| {
            let handle = handles.get(&replica).cloned();
            async move {
                let handle = handle.ok_or_else(|| {
                    DbError::ExecutionError(format!(
                        "Large object does not exist on replica '{}'",
                        replica
                    ))
                })?;
                statement.set_large_object(index, handle).await
            }
        });
        self.node
            .invoke(&InvocationStrategy::InvokeOnAll, &invoker)
            .await?;
        Ok(())
    }

    pub async fn execute_prepared_update(&self) -> Result<u64> {
        let sql = self.prepared_sql()?.to_string();
        let invoker = Invoker::new(|_, statement: Arc<dyn BackendStatement>| async move {
            statement.execute_prepared_update().await
        });
        self.update(&sql, InvocationStrategy::InvokeOnAll, &invoker)
            .await
    }

    pub async fn execute_prepared_query(&self) -> Result<ClusterResultSet> {
        let sql = self.prepared_sql()?.to_string();
        let invoker = Invoker::new(|_, statement: Arc<dyn BackendStatement>| async move {
            statement.execute_prepared_query().await
        });
        self.query(&sql, &invoker).await
    }

    /// Close this statement, its result sets and any spooled arguments.
    pub async fn close(&self) {
        self.node.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.node.is_closed()
    }

    async fn query(
        &self,
        sql: &str,
        invoker: &Invoker<Arc<dyn BackendStatement>, Arc<dyn BackendResultSet>>,
    ) -> Result<ClusterResultSet> {
        let traits = self.cluster().sql().classify(sql);
        let base = if traits.is_read_only() {
            InvocationStrategy::InvokeOnOne
        } else {
            InvocationStrategy::InvokeOnAll
        };

        let strategy = self.scope.start(base).await?;
        let _locks = self.lock_sequences(&traits).await;
        let node = self
            .node
            .invoke_child(&strategy, invoker, ObjectKind::ResultSet)
            .await?;
        Ok(ClusterResultSet::new(node, self.scope.clone()))
    }

    async fn update<R: Send + 'static>(
        &self,
        sql: &str,
        base: InvocationStrategy,
        invoker: &Invoker<Arc<dyn BackendStatement>, R>,
    ) -> Result<R> {
        let traits = self.cluster().sql().classify(sql);
        let strategy = self.scope.start(base).await?;
        let _locks = self.lock_sequences(&traits).await;
        Ok(self.node.invoke(&strategy, invoker).await?.into_value())
    }
}
