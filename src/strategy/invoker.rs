use crate::cluster::{Cluster, Replica};
use crate::core::Result;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

pub type InvokeFuture<R> = BoxFuture<'static, Result<R>>;

/// One call, applied identically to each replica's real object.
///
/// `T` is the per-replica object (e.g. `Arc<dyn BackendStatement>`) and `R`
/// what the call yields for that replica.
pub struct Invoker<T, R> {
    call: Arc<dyn Fn(Arc<Replica>, T) -> InvokeFuture<R> + Send + Sync>,
}

impl<T, R> Invoker<T, R> {
    pub fn new<F, Fut>(call: F) -> Self
    where
        F: Fn(Arc<Replica>, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        Self {
            call: Arc::new(move |replica, target| Box::pin(call(replica, target))),
        }
    }

    pub fn invoke(&self, replica: Arc<Replica>, target: T) -> InvokeFuture<R> {
        (self.call)(replica, target)
    }
}

impl<T, R> Clone for Invoker<T, R> {
    fn clone(&self) -> Self {
        Self {
            call: Arc::clone(&self.call),
        }
    }
}

/// Real objects a single invocation may reach, captured once per call.
pub struct InvocationTarget<T> {
    pub cluster: Arc<Cluster>,
    pub objects: BTreeMap<Arc<Replica>, T>,
    /// Route broadcasts through the transactional executor
    pub transactional: bool,
}

/// Outcome of a strategy: the client-visible value plus every other
/// replica's successful result.
#[derive(Debug)]
pub struct Reconciled<R> {
    replica: Arc<Replica>,
    value: R,
    others: BTreeMap<Arc<Replica>, R>,
}

impl<R> Reconciled<R> {
    pub fn single(replica: Arc<Replica>, value: R) -> Self {
        Self {
            replica,
            value,
            others: BTreeMap::new(),
        }
    }

    pub(crate) fn new(replica: Arc<Replica>, value: R, others: BTreeMap<Arc<Replica>, R>) -> Self {
        Self {
            replica,
            value,
            others,
        }
    }

    /// Replica whose result is surfaced
    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    pub fn value(&self) -> &R {
        &self.value
    }

    pub fn into_value(self) -> R {
        self.value
    }

    /// Number of replicas that produced a result
    pub fn replica_count(&self) -> usize {
        self.others.len() + 1
    }

    pub fn get(&self, replica: &Replica) -> Option<&R> {
        if *self.replica == *replica {
            Some(&self.value)
        } else {
            self.others.get(replica)
        }
    }

    pub fn into_results(self) -> BTreeMap<Arc<Replica>, R> {
        let mut results = self.others;
        results.insert(self.replica, self.value);
        results
    }
}
