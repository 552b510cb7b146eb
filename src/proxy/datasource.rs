use super::{ClusterConnection, ObjectKind, ProxyNode, ProxyTree, RealObject};
use crate::backend::BackendDataSource;
use crate::cluster::{Cluster, Replica, ReplicaConfig};
use crate::core::{DbError, Result};
use crate::strategy::{InvocationStrategy, Invoker};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Entry point: one logical database over every replica's connection factory.
#[derive(Debug)]
pub struct ClusterDataSource {
    root: ProxyNode,
}

impl ClusterDataSource {
    /// Bind one factory per replica id; every id must be known to `cluster`.
    pub fn new<I>(cluster: Arc<Cluster>, factories: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, Arc<dyn BackendDataSource>)>,
    {
        let mut objects = BTreeMap::new();
        for (id, factory) in factories {
            let replica = cluster.replica(&id).ok_or_else(|| {
                DbError::ConfigError(format!(
                    "Replica '{}' is not part of cluster '{}'",
                    id,
                    cluster.id()
                ))
            })?;
            objects.insert(replica, RealObject::DataSource(factory));
        }
        if objects.is_empty() {
            return Err(DbError::ConfigError(format!(
                "No connection factories supplied for cluster '{}'",
                cluster.id()
            )));
        }

        let tree = ProxyTree::new(cluster, ObjectKind::DataSource, objects);
        Ok(Self { root: tree.root() })
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        self.root.cluster()
    }

    pub fn node(&self) -> &ProxyNode {
        &self.root
    }

    /// Open one connection per active replica. Succeeds while at least one
    /// replica accepts.
    pub async fn connect(&self) -> Result<ClusterConnection> {
        let invoker = Invoker::new(|_, source: Arc<dyn BackendDataSource>| async move {
            source.connect().await
        });
        let node = self
            .root
            .invoke_child(&InvocationStrategy::Bootstrap, &invoker, ObjectKind::Connection)
            .await?;
        ClusterConnection::new(node)
    }

    /// Grow the cluster by one replica. Connections opened afterwards
    /// include it; existing ones keep the replicas they were opened with.
    pub async fn register_replica(
        &self,
        config: ReplicaConfig,
        factory: Arc<dyn BackendDataSource>,
    ) -> Result<Arc<Replica>> {
        let active = config.active;
        // Joins inactive so nothing targets it before its factory is bound
        let replica = self.cluster().add_replica(config.inactive()).await?;
        self.root
            .insert_object(replica.clone(), RealObject::DataSource(factory))?;
        if active {
            self.cluster().activate(&replica).await?;
        }
        Ok(replica)
    }

    /// Close every connection opened through this data source.
    pub async fn close(&self) {
        self.root.close().await;
    }
}
