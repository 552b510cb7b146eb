// ============================================================================
// Lock Management
// ============================================================================
//
// Named read/write locks shared by every connection of a cluster. The
// reserved `GLOBAL` name serializes structural work (membership changes)
// against in-flight transactions, which hold it in read mode.
//
// ============================================================================

pub mod transaction;

pub use transaction::TransactionContext;

use crate::core::{DbError, Result};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;

/// Reserved lock name for whole-cluster coordination
pub const GLOBAL: &str = "global";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

/// Issues named locks; the same name always maps to the same lock.
#[derive(Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_lock(&self, name: &str) -> ClusterLock {
        self.lock(name, LockMode::Read)
    }

    pub fn write_lock(&self, name: &str) -> ClusterLock {
        self.lock(name, LockMode::Write)
    }

    pub fn global_read_lock(&self) -> ClusterLock {
        self.read_lock(GLOBAL)
    }

    pub fn global_write_lock(&self) -> ClusterLock {
        self.write_lock(GLOBAL)
    }

    fn lock(&self, name: &str, mode: LockMode) -> ClusterLock {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let inner = locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone();
        ClusterLock {
            name: name.to_string(),
            mode,
            inner,
        }
    }

    /// Acquire write locks on several resources.
    ///
    /// Names are deduplicated and taken in sorted order so two callers with
    /// overlapping sets cannot deadlock each other.
    pub async fn write_lock_all<I, S>(&self, names: I) -> Vec<LockGuard>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ordered: BTreeSet<String> = names
            .into_iter()
            .map(|name| name.as_ref().to_string())
            .collect();
        let mut guards = Vec::with_capacity(ordered.len());
        for name in ordered {
            guards.push(self.write_lock(&name).lock().await);
        }
        guards
    }

    /// Number of distinct lock names issued so far
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("locks", &self.len())
            .finish()
    }
}

/// One mode of one named lock. Cheap to clone.
#[derive(Clone)]
pub struct ClusterLock {
    name: String,
    mode: LockMode,
    inner: Arc<RwLock<()>>,
}

impl ClusterLock {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Wait until the lock is granted.
    pub async fn lock(&self) -> LockGuard {
        debug!(lock = %self.name, mode = ?self.mode, "acquiring lock");
        let held = match self.mode {
            LockMode::Read => Held::Read(self.inner.clone().read_owned().await),
            LockMode::Write => Held::Write(self.inner.clone().write_owned().await),
        };
        LockGuard {
            name: self.name.clone(),
            held,
        }
    }

    /// Acquire without waiting, or `None` if the lock is contended.
    pub fn try_lock(&self) -> Option<LockGuard> {
        let held = match self.mode {
            LockMode::Read => Held::Read(self.inner.clone().try_read_owned().ok()?),
            LockMode::Write => Held::Write(self.inner.clone().try_write_owned().ok()?),
        };
        Some(LockGuard {
            name: self.name.clone(),
            held,
        })
    }

    pub async fn lock_timeout(&self, timeout: Duration) -> Result<LockGuard> {
        tokio::time::timeout(timeout, self.lock())
            .await
            .map_err(|_| {
                DbError::LockError(format!(
                    "timed out after {:?} waiting for {:?} lock '{}'",
                    timeout, self.mode, self.name
                ))
            })
    }
}

impl fmt::Debug for ClusterLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterLock")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .finish()
    }
}

enum Held {
    Read(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Write(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

/// Proof of a granted lock; released on drop.
pub struct LockGuard {
    name: String,
    held: Held,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> LockMode {
        match self.held {
            Held::Read(_) => LockMode::Read,
            Held::Write(_) => LockMode::Write,
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("mode", &self.mode())
            .finish()
    }
}
