// ============================================================================
// Transaction Context
// ============================================================================
//
// Per logical connection. Holds the global read lock for the span of a
// non-autocommit transaction so that membership changes (which take the
// global write lock) cannot interleave with it.
//
// State transitions:
//
//   NoTransaction ──start (autocommit off)──> LockHeld
//   LockHeld ──end strategy invoked / close / first call failed──> NoTransaction
//
// ============================================================================

use super::{LockGuard, LockManager};
use crate::core::{DbError, Result};
use crate::strategy::{InvocationStrategy, TransactionBoundary, TransactionPhase};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    NoTransaction,
    LockHeld,
}

/// Shared cell holding at most one lock guard.
///
/// Strategies that bracket a transaction keep a clone so they can release the
/// lock after invoking.
#[derive(Clone, Default)]
pub struct LockSlot(Arc<Mutex<Option<LockGuard>>>);

impl LockSlot {
    pub fn is_held(&self) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Store a guard unless one is already held. Returns false (and drops the
    /// new guard) in that case.
    fn hold(&self, guard: LockGuard) -> bool {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(guard);
        true
    }

    /// Drop the held guard if any. Returns whether something was released.
    pub fn release(&self) -> bool {
        let guard = self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match guard {
            Some(guard) => {
                debug!(lock = guard.name(), "releasing transaction lock");
                true
            }
            None => false,
        }
    }

    pub fn same_slot(&self, other: &LockSlot) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for LockSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LockSlot").field(&self.is_held()).finish()
    }
}

pub struct TransactionContext {
    lock_manager: Arc<LockManager>,
    slot: LockSlot,
    closed: AtomicBool,
}

impl TransactionContext {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            lock_manager,
            slot: LockSlot::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> TransactionState {
        if self.slot.is_held() {
            TransactionState::LockHeld
        } else {
            TransactionState::NoTransaction
        }
    }

    pub fn is_locked(&self) -> bool {
        self.slot.is_held()
    }

    /// Strategy to use for a call that may open a transaction.
    ///
    /// Autocommit calls and calls made while the lock is already held get the
    /// strategy back unchanged. Otherwise the global read lock is acquired now
    /// and the returned strategy releases it again if the invocation fails.
    /// A closed context never locks again.
    pub async fn start(
        &self,
        strategy: InvocationStrategy,
        auto_commit: bool,
    ) -> Result<InvocationStrategy> {
        if self.is_closed() {
            return Err(DbError::Closed("transaction context".to_string()));
        }
        if auto_commit || self.slot.is_held() {
            return Ok(strategy);
        }

        let guard = self.lock_manager.global_read_lock().lock().await;
        if !self.slot.hold(guard) {
            // Raced with another start on this context; it owns the lock.
            return Ok(strategy);
        }
        // close() sets the flag before releasing, so a close that ran while
        // we waited is always seen here
        if self.is_closed() {
            self.slot.release();
            return Err(DbError::Closed("transaction context".to_string()));
        }
        debug!("transaction lock acquired");

        Ok(InvocationStrategy::Transactional(TransactionBoundary::new(
            strategy,
            TransactionPhase::Begin,
            self.slot.clone(),
        )))
    }

    /// Strategy to use for commit/rollback.
    ///
    /// Without a held lock the strategy comes back unchanged; otherwise the
    /// returned strategy releases the lock once it has been invoked.
    pub fn end(&self, strategy: InvocationStrategy) -> InvocationStrategy {
        if !self.slot.is_held() {
            return strategy;
        }
        InvocationStrategy::Transactional(TransactionBoundary::new(
            strategy,
            TransactionPhase::End,
            self.slot.clone(),
        ))
    }

    /// Release a lock left behind by a transaction that never ended and
    /// refuse further transactions. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.slot.release();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("state", &self.state())
            .finish()
    }
}
