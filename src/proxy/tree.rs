// ============================================================================
// Proxy Tree
// ============================================================================
//
// Every logical object handed to a client (data source, connection,
// statement, result set, ...) is a node in an arena owned by one ProxyTree:
//
//   datasource (root, one factory per replica)
//     └── connection
//           ├── statement ── result set
//           └── savepoint
//
// A node owns one real backend object per replica and is the only place
// those objects are closed. Parent links are ids, never owning references.
//
// Locking:
// - the arena mutex guards structure and object maps; it is never held
//   across an await
// - close first marks its subtree under the mutex, after which no call
//   starts on it and no child can attach to it
// - each node has a gate: invocations hold it shared, close holds it
//   exclusively, so a cascade close waits for in-flight calls instead of
//   closing objects under them
// - gates are taken in descending node id order (children are always newer
//   than their parents), which keeps concurrent overlapping closes from
//   deadlocking
// - pruning after a replica failure closes dropped objects under their
//   node's exclusive gate too, deferring to a task when a call is in flight
//
// ============================================================================

use crate::backend::{
    BackendConnection, BackendDataSource, BackendLargeObject, BackendResultSet, BackendSavepoint,
    BackendStatement,
};
use crate::balancer::ReplicaSet;
use crate::cluster::{Cluster, Replica};
use crate::core::{DbError, Result};
use crate::lock::TransactionContext;
use crate::spool::FileSupport;
use crate::strategy::{InvocationStrategy, InvocationTarget, Invoker, Reconciled};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    DataSource,
    Connection,
    Statement,
    PreparedStatement,
    ResultSet,
    Savepoint,
    LargeObject,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DataSource => "data source",
            Self::Connection => "connection",
            Self::Statement => "statement",
            Self::PreparedStatement => "prepared statement",
            Self::ResultSet => "result set",
            Self::Savepoint => "savepoint",
            Self::LargeObject => "large object",
        };
        write!(f, "{}", name)
    }
}

/// One replica's backend object, of any kind
#[derive(Clone)]
pub enum RealObject {
    DataSource(Arc<dyn BackendDataSource>),
    Connection(Arc<dyn BackendConnection>),
    Statement(Arc<dyn BackendStatement>),
    ResultSet(Arc<dyn BackendResultSet>),
    Savepoint(Arc<dyn BackendSavepoint>),
    LargeObject(Arc<dyn BackendLargeObject>),
}

impl RealObject {
    /// Release the backend resource. Factories and savepoints hold none.
    pub async fn close(&self) -> Result<()> {
        match self {
            Self::DataSource(_) | Self::Savepoint(_) => Ok(()),
            Self::Connection(connection) => connection.close().await,
            Self::Statement(statement) => statement.close().await,
            Self::ResultSet(result_set) => result_set.close().await,
            Self::LargeObject(object) => object.free().await,
        }
    }
}

impl fmt::Debug for RealObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::DataSource(_) => "DataSource",
            Self::Connection(_) => "Connection",
            Self::Statement(_) => "Statement",
            Self::ResultSet(_) => "ResultSet",
            Self::Savepoint(_) => "Savepoint",
            Self::LargeObject(_) => "LargeObject",
        };
        f.debug_tuple("RealObject").field(&kind).finish()
    }
}

/// Backend handle types a node can hold
pub trait Proxied: Clone + Send + Sync + 'static {
    fn into_real(self) -> RealObject;

    fn from_real(object: &RealObject) -> Option<Self>;
}

macro_rules! proxied {
    ($($variant:ident => $handle:ty),* $(,)?) => {
        $(
            impl Proxied for $handle {
                fn into_real(self) -> RealObject {
                    RealObject::$variant(self)
                }

                fn from_real(object: &RealObject) -> Option<Self> {
                    match object {
                        RealObject::$variant(handle) => Some(handle.clone()),
                        _ => None,
                    }
                }
            }
        )*
    };
}

proxied! {
    DataSource => Arc<dyn BackendDataSource>,
    Connection => Arc<dyn BackendConnection>,
    Statement => Arc<dyn BackendStatement>,
    ResultSet => Arc<dyn BackendResultSet>,
    Savepoint => Arc<dyn BackendSavepoint>,
    LargeObject => Arc<dyn BackendLargeObject>,
}

struct NodeEntry {
    kind: ObjectKind,
    parent: Option<NodeId>,
    children: BTreeSet<NodeId>,
    objects: BTreeMap<Arc<Replica>, RealObject>,
    gate: Arc<RwLock<()>>,
    files: Option<Arc<FileSupport>>,
    transaction: Option<Arc<TransactionContext>>,
    closing: bool,
}

impl NodeEntry {
    fn new(
        kind: ObjectKind,
        parent: Option<NodeId>,
        objects: BTreeMap<Arc<Replica>, RealObject>,
        transaction: Option<Arc<TransactionContext>>,
    ) -> Self {
        Self {
            kind,
            parent,
            children: BTreeSet::new(),
            objects,
            gate: Arc::new(RwLock::new(())),
            files: None,
            transaction,
            closing: false,
        }
    }
}

#[derive(Default)]
struct Arena {
    next_id: u64,
    nodes: HashMap<NodeId, NodeEntry>,
}

impl Arena {
    fn insert(&mut self, entry: NodeEntry) -> NodeId {
        self.next_id += 1;
        let id = NodeId(self.next_id);
        self.nodes.insert(id, entry);
        id
    }

    fn live(&self, id: NodeId) -> Option<&NodeEntry> {
        self.nodes.get(&id).filter(|entry| !entry.closing)
    }

    /// `id` and every descendant, unordered
    fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut pending = vec![id];
        let mut found = Vec::new();
        while let Some(next) = pending.pop() {
            if let Some(entry) = self.nodes.get(&next) {
                found.push(next);
                pending.extend(entry.children.iter().copied());
            }
        }
        found
    }
}

/// Arena holding one data source's proxy graph.
pub struct ProxyTree {
    cluster: Arc<Cluster>,
    arena: Mutex<Arena>,
    root: NodeId,
}

impl ProxyTree {
    /// Create a tree whose root holds `objects` and register it with the
    /// cluster, so replica failures prune it.
    pub fn new(
        cluster: Arc<Cluster>,
        kind: ObjectKind,
        objects: BTreeMap<Arc<Replica>, RealObject>,
    ) -> Arc<Self> {
        let mut arena = Arena::default();
        let root = arena.insert(NodeEntry::new(kind, None, objects, None));
        let tree = Arc::new(Self {
            cluster,
            arena: Mutex::new(arena),
            root,
        });
        tree.cluster.register_tree(&tree);
        tree
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn root(self: &Arc<Self>) -> ProxyNode {
        ProxyNode {
            tree: self.clone(),
            id: self.root,
        }
    }

    /// Live nodes, root included
    pub fn len(&self) -> usize {
        self.arena()
            .nodes
            .values()
            .filter(|entry| !entry.closing)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close `replica`'s objects in every node. The root's factories are
    /// kept unless the replica is being forgotten.
    pub(crate) async fn prune(self: &Arc<Self>, replica: &Replica, include_root: bool) {
        let keep: ReplicaSet = self
            .cluster
            .replicas()
            .into_iter()
            .filter(|known| known.id() != replica.id())
            .collect();

        if include_root {
            self.root().retain(&keep).await;
            return;
        }
        for child in self.root().children() {
            child.retain(&keep).await;
        }
    }

    fn arena(&self) -> MutexGuard<'_, Arena> {
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ProxyTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyTree")
            .field("cluster", &self.cluster.id())
            .field("root", &self.root)
            .field("nodes", &self.len())
            .finish()
    }
}

/// Handle to one node. Cheap to clone; equality is by tree and id.
#[derive(Clone)]
pub struct ProxyNode {
    tree: Arc<ProxyTree>,
    id: NodeId,
}

impl ProxyNode {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn tree(&self) -> &Arc<ProxyTree> {
        &self.tree
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.tree.cluster
    }

    pub fn kind(&self) -> Result<ObjectKind> {
        self.with_entry(|entry| entry.kind)
    }

    pub fn is_closed(&self) -> bool {
        self.tree.arena().live(self.id).is_none()
    }

    /// Run `invoker` against this node's objects as `strategy` dictates.
    pub async fn invoke<T, R>(
        &self,
        strategy: &InvocationStrategy,
        invoker: &Invoker<T, R>,
    ) -> Result<Reconciled<R>>
    where
        T: Proxied,
        R: Send + 'static,
    {
        let gate = match self.with_entry(|entry| entry.gate.clone()) {
            Ok(gate) => gate,
            Err(error) => {
                strategy.abandon();
                return Err(error);
            }
        };
        let _shared = gate.read().await;

        // Re-read under the gate: a close may have finished while we waited
        let captured = self.with_entry(|entry| {
            let objects: BTreeMap<Arc<Replica>, T> = entry
                .objects
                .iter()
                .filter_map(|(replica, object)| {
                    T::from_real(object).map(|handle| (replica.clone(), handle))
                })
                .collect();
            let transactional = entry
                .transaction
                .as_ref()
                .is_some_and(|transaction| transaction.is_locked());
            (objects, transactional)
        });
        let (objects, transactional) = match captured {
            Ok(captured) => captured,
            Err(error) => {
                strategy.abandon();
                return Err(error);
            }
        };

        let target = InvocationTarget {
            cluster: self.tree.cluster.clone(),
            objects,
            transactional,
        };
        strategy.apply(target, invoker).await
    }

    /// Invoke and wrap every replica's result in a new child node.
    pub async fn invoke_child<T, C>(
        &self,
        strategy: &InvocationStrategy,
        invoker: &Invoker<T, C>,
        kind: ObjectKind,
    ) -> Result<ProxyNode>
    where
        T: Proxied,
        C: Proxied,
    {
        let reconciled = self.invoke(strategy, invoker).await?;

        let objects = reconciled
            .into_results()
            .into_iter()
            .map(|(replica, handle)| (replica, handle.into_real()))
            .collect();

        // A close that marked this node in the meantime owns the cleanup of
        // everything attached before the mark; anything later is ours
        match self.attach(kind, objects) {
            Ok(child) => Ok(child),
            Err((error, orphans)) => {
                close_objects(kind, orphans).await;
                Err(error)
            }
        }
    }

    /// Register a child holding `objects`.
    pub fn add_child(
        &self,
        kind: ObjectKind,
        objects: BTreeMap<Arc<Replica>, RealObject>,
    ) -> Result<ProxyNode> {
        self.attach(kind, objects).map_err(|(error, _)| error)
    }

    /// Close `child` and its descendants. Returns false if it is not a live
    /// child of this node.
    pub async fn remove_child(&self, child: &ProxyNode) -> bool {
        let is_child = Arc::ptr_eq(&self.tree, &child.tree)
            && self
                .tree
                .arena()
                .live(self.id)
                .is_some_and(|entry| entry.children.contains(&child.id));
        if is_child {
            child.close().await;
        }
        is_child
    }

    /// Drop, in this node and every descendant, each object whose replica
    /// is not in `replicas`. Dropped objects are closed once no call is in
    /// flight on their node: at once if its gate is free, otherwise from a
    /// task that waits for the gate. The caller may itself be inside an
    /// invocation on one of these nodes, so this never waits for a gate.
    pub async fn retain(&self, replicas: &ReplicaSet) {
        let dropped: Vec<(Arc<RwLock<()>>, ObjectKind, BTreeMap<Arc<Replica>, RealObject>)> = {
            let mut arena = self.tree.arena();
            let ids = arena.subtree(self.id);
            let mut dropped = Vec::new();
            for id in ids {
                if let Some(entry) = arena.nodes.get_mut(&id) {
                    let mut objects = BTreeMap::new();
                    entry.objects.retain(|replica, object| {
                        let keep = replicas.contains(replica.as_ref());
                        if !keep {
                            objects.insert(replica.clone(), object.clone());
                        }
                        keep
                    });
                    if !objects.is_empty() {
                        dropped.push((entry.gate.clone(), entry.kind, objects));
                    }
                }
            }
            dropped
        };

        for (gate, kind, objects) in dropped {
            match gate.clone().try_write_owned() {
                Ok(exclusive) => {
                    close_objects(kind, objects).await;
                    drop(exclusive);
                }
                Err(_) => {
                    debug!(%kind, count = objects.len(), "deferring close of pruned objects");
                    tokio::spawn(async move {
                        let _exclusive = gate.write_owned().await;
                        close_objects(kind, objects).await;
                    });
                }
            }
        }
    }

    pub fn get_root(&self) -> ProxyNode {
        self.tree.root()
    }

    pub fn parent(&self) -> Option<ProxyNode> {
        let parent = self.tree.arena().live(self.id)?.parent?;
        Some(self.sibling(parent))
    }

    pub fn children(&self) -> Vec<ProxyNode> {
        let arena = self.tree.arena();
        let Some(entry) = arena.live(self.id) else {
            return Vec::new();
        };
        entry
            .children
            .iter()
            .filter(|child| arena.live(**child).is_some())
            .map(|child| self.sibling(*child))
            .collect()
    }

    /// This node's object for `replica`, if it holds one of type `T`
    pub fn get_object<T: Proxied>(&self, replica: &Replica) -> Option<T> {
        let arena = self.tree.arena();
        T::from_real(arena.live(self.id)?.objects.get(replica)?)
    }

    pub fn objects<T: Proxied>(&self) -> BTreeMap<Arc<Replica>, T> {
        self.with_entry(|entry| {
            entry
                .objects
                .iter()
                .filter_map(|(replica, object)| {
                    T::from_real(object).map(|handle| (replica.clone(), handle))
                })
                .collect()
        })
        .unwrap_or_default()
    }

    /// Replicas this node holds objects for
    pub fn replicas(&self) -> ReplicaSet {
        self.with_entry(|entry| entry.objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Add or replace this node's object for `replica`.
    pub fn insert_object(&self, replica: Arc<Replica>, object: RealObject) -> Result<()> {
        self.with_entry_mut(|entry| {
            entry.objects.insert(replica, object);
        })
    }

    /// Spooler for this node's stream arguments, created on first use.
    pub fn file_support(&self) -> Result<Arc<FileSupport>> {
        self.with_entry_mut(|entry| {
            entry
                .files
                .get_or_insert_with(|| Arc::new(FileSupport::new()))
                .clone()
        })
    }

    pub fn has_file_support(&self) -> bool {
        self.with_entry(|entry| entry.files.is_some())
            .unwrap_or(false)
    }

    /// Bind the transaction context consulted for executor choice. Nodes
    /// created below this one inherit it.
    pub fn bind_transaction(&self, transaction: Arc<TransactionContext>) -> Result<()> {
        self.with_entry_mut(|entry| entry.transaction = Some(transaction))
    }

    pub fn transaction(&self) -> Option<Arc<TransactionContext>> {
        self.with_entry(|entry| entry.transaction.clone())
            .ok()
            .flatten()
    }

    /// Close this node and every descendant, waiting for their in-flight
    /// invocations first. Idempotent.
    pub async fn close(&self) {
        // Mark first: from here on no invocation starts and no child is added
        let marked: Vec<(NodeId, Arc<RwLock<()>>)> = {
            let mut arena = self.tree.arena();
            if arena.live(self.id).is_none() {
                return;
            }
            let mut marked = Vec::new();
            for id in arena.subtree(self.id) {
                if let Some(entry) = arena.nodes.get_mut(&id)
                    && !entry.closing
                {
                    entry.closing = true;
                    marked.push((id, entry.gate.clone()));
                }
            }
            marked.sort_by(|a, b| b.0.cmp(&a.0));
            marked
        };

        let mut held = Vec::with_capacity(marked.len());
        for (_, gate) in &marked {
            held.push(gate.clone().write_owned().await);
        }

        let removed: Vec<(NodeId, NodeEntry)> = {
            let mut arena = self.tree.arena();
            let mut removed = Vec::with_capacity(marked.len());
            for (id, _) in &marked {
                if let Some(entry) = arena.nodes.remove(id) {
                    if let Some(parent) = entry.parent
                        && let Some(parent) = arena.nodes.get_mut(&parent)
                    {
                        parent.children.remove(id);
                    }
                    removed.push((*id, entry));
                }
            }
            removed
        };

        for (id, entry) in removed {
            close_objects(entry.kind, entry.objects).await;
            if let Some(files) = entry.files {
                files.close();
            }
            debug!(node = %id, kind = %entry.kind, "proxy closed");
        }
        drop(held);
    }

    fn attach(
        &self,
        kind: ObjectKind,
        objects: BTreeMap<Arc<Replica>, RealObject>,
    ) -> std::result::Result<ProxyNode, (DbError, BTreeMap<Arc<Replica>, RealObject>)> {
        let mut arena = self.tree.arena();
        let Some(parent) = arena.live(self.id) else {
            return Err((self.closed_error(), objects));
        };
        let transaction = parent.transaction.clone();
        let id = arena.insert(NodeEntry::new(kind, Some(self.id), objects, transaction));
        if let Some(parent) = arena.nodes.get_mut(&self.id) {
            parent.children.insert(id);
        }
        Ok(self.sibling(id))
    }

    fn sibling(&self, id: NodeId) -> ProxyNode {
        ProxyNode {
            tree: self.tree.clone(),
            id,
        }
    }

    fn closed_error(&self) -> DbError {
        DbError::Closed(format!("proxy {}", self.id))
    }

    fn with_entry<V>(&self, read: impl FnOnce(&NodeEntry) -> V) -> Result<V> {
        let arena = self.tree.arena();
        arena
            .live(self.id)
            .map(read)
            .ok_or_else(|| self.closed_error())
    }

    fn with_entry_mut<V>(&self, write: impl FnOnce(&mut NodeEntry) -> V) -> Result<V> {
        let mut arena = self.tree.arena();
        match arena.nodes.get_mut(&self.id) {
            Some(entry) if !entry.closing => Ok(write(entry)),
            _ => Err(self.closed_error()),
        }
    }
}

async fn close_objects(kind: ObjectKind, objects: BTreeMap<Arc<Replica>, RealObject>) {
    for (replica, object) in objects {
        if let Err(error) = object.close().await {
            debug!(%kind, replica = %replica, %error, "close failed");
        }
    }
}

impl PartialEq for ProxyNode {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tree, &other.tree) && self.id == other.id
    }
}

impl Eq for ProxyNode {}

impl fmt::Debug for ProxyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyNode")
            .field("id", &self.id)
            .field("kind", &self.kind().ok())
            .field("replicas", &self.replicas().len())
            .finish()
    }
}
