// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

#[cfg(feature = "verbose")]
use log::info;
use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    Mutex, RawRwLock, RwLock,
};
use std::{
    collections::VecDeque,
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
};

use crate::{
    error::TxError,
    shared_value::{downcast, CommuteFn, SharedValue},
    stm::StmCore,
    transaction::{Transaction, TxContext},
};

/// Upper bound on the number of past values a var retains for slow readers.
pub(crate) const MAX_HISTORY: usize = 10;

/// Owned guards, so ensure locks can outlive the operation that took them
/// and the commit phase can keep a stack of held write locks.
pub(crate) type ReadGuard = ArcRwLockReadGuard<RawRwLock, VarHistory>;
pub(crate) type WriteGuard = ArcRwLockWriteGuard<RawRwLock, VarHistory>;

/// One committed value and the stamp of the commit that produced it.
/// Immutable once pushed into the history.
pub(crate) struct StampedValue {
    pub(crate) value: SharedValue,
    pub(crate) stamp: u64,
}

/// The versioned state of a var, protected by the var's reader/writer lock.
/// `past` is ordered newest first; stamps strictly decrease along it.
pub(crate) struct VarHistory {
    pub(crate) current: StampedValue,
    pub(crate) past: VecDeque<StampedValue>,
}

impl VarHistory {
    /// Finds the newest value visible at `read_stamp`, or `None` if the
    /// snapshot is older than all retained history.
    fn snapshot(&self, read_stamp: u64) -> Option<SharedValue> {
        if self.current.stamp <= read_stamp {
            return Some(self.current.value.clone());
        }
        self.past
            .iter()
            .find(|sv| sv.stamp <= read_stamp)
            .map(|sv| sv.value.clone())
    }
}

/// A read guard pinned by `ensure`, released when the attempt finalizes.
pub(crate) struct HeldRead {
    pub(crate) var: Arc<TVarCore>,
    guard: ReadGuard,
}

impl HeldRead {
    pub(crate) fn release(self) {
        let HeldRead { var, guard } = self;
        var.release_read(guard);
    }
}

/// The untyped inside of a [`TVar`]. The commit phase works on cores
/// directly, so one transaction can span vars of different value types.
pub(crate) struct TVarCore {
    pub(crate) id: u64,
    lock: Arc<RwLock<VarHistory>>,
    /// Incremented whenever a reader fails to find a sufficiently old
    /// snapshot; commits retain history for the var while it is non-zero.
    pub(crate) conflicts: AtomicUsize,
    /// The transaction currently holding write-intent, if any. Kept weak:
    /// a finished attempt drops its context and the record goes dead.
    owner: Mutex<Weak<TxContext>>,
    fair: bool,
    pub(crate) ctrl: Arc<StmCore>,
}

impl TVarCore {
    pub(crate) fn read_lock(&self) -> ReadGuard {
        self.lock.read_arc()
    }

    /// Write lock with a bounded wait; timing out converts into a retry of
    /// the whole attempt instead of a deadlock.
    pub(crate) fn lock_write_bounded(&self) -> Result<WriteGuard, TxError> {
        self.lock
            .try_write_arc_for(self.ctrl.lock_wait)
            .ok_or(TxError::Retry)
    }

    pub(crate) fn release_read(&self, guard: ReadGuard) {
        if self.fair {
            ArcRwLockReadGuard::unlock_fair(guard);
        } else {
            drop(guard);
        }
    }

    pub(crate) fn release_write(&self, guard: WriteGuard) {
        if self.fair {
            ArcRwLockWriteGuard::unlock_fair(guard);
        } else {
            drop(guard);
        }
    }

    pub(crate) fn write_owner(&self) -> Option<Arc<TxContext>> {
        self.owner.lock().upgrade()
    }

    pub(crate) fn set_write_owner(&self, ctx: &Arc<TxContext>) {
        *self.owner.lock() = Arc::downgrade(ctx);
    }

    /// Publishes `value` under the write lock held by the commit phase.
    /// Contended vars (non-zero conflict count) grow their history up to
    /// [`MAX_HISTORY`] so slow readers can still be served; uncontended vars
    /// take the cheap path, rotating the newest value in and dropping the
    /// oldest, and reset the conflict count.
    pub(crate) fn install(&self, history: &mut VarHistory, value: SharedValue, stamp: u64) {
        let fresh = StampedValue { value, stamp };
        if self.conflicts.load(Ordering::SeqCst) > 0 && history.past.len() < MAX_HISTORY {
            let previous = std::mem::replace(&mut history.current, fresh);
            history.past.push_front(previous);
        } else {
            if history.past.is_empty() {
                history.current = fresh;
            } else {
                let previous = std::mem::replace(&mut history.current, fresh);
                history.past.push_front(previous);
                history.past.pop_back();
            }
            self.conflicts.store(0, Ordering::SeqCst);
        }
    }

    #[cfg(test)]
    pub(crate) fn history_depth(&self) -> usize {
        self.lock.read().past.len()
    }
}

/// A transactional variable: a mutable reference cell whose updates are
/// coordinated by an [`Stm`](crate::Stm). Cloning is shallow; clones refer
/// to the same cell.
pub struct TVar<T>
where
    T: Clone + Send + Sync + 'static,
{
    core: Arc<TVarCore>,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> TVar<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(ctrl: Arc<StmCore>, value: T, fair: bool) -> Self {
        let history = VarHistory {
            current: StampedValue {
                value: Arc::new(value),
                stamp: 0,
            },
            past: VecDeque::new(),
        };
        Self {
            core: Arc::new(TVarCore {
                id: ctrl.next_var_id(),
                lock: Arc::new(RwLock::new(history)),
                conflicts: AtomicUsize::new(0),
                owner: Mutex::new(Weak::new()),
                fair,
                ctrl,
            }),
            _marker: PhantomData,
        }
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<TVarCore> {
        &self.core
    }

    /// Reads the latest committed value outside of any transaction.
    pub fn read_atomic(&self) -> T {
        let guard = self.core.read_lock();
        let value = downcast::<T>(&guard.current.value);
        self.core.release_read(guard);
        value
    }

    /// Reads the value as of the transaction's snapshot. A value pending
    /// from an earlier `assign`/`commute` in the same transaction is
    /// returned as-is (repeatable read). If the snapshot predates all
    /// retained history the attempt fails with [`TxError::Retry`] and the
    /// var is marked contended, so future commits keep deeper history.
    pub fn read(&self, tx: &mut Transaction) -> Result<T, TxError> {
        tx.alive_ctx()?;
        if let Some(pending) = tx.pending(self.core.id) {
            return Ok(downcast::<T>(&pending));
        }
        let guard = self.core.read_lock();
        let snapshot = guard.snapshot(tx.read_stamp);
        self.core.release_read(guard);
        match snapshot {
            Some(value) => Ok(downcast::<T>(&value)),
            None => {
                self.core.conflicts.fetch_add(1, Ordering::SeqCst);
                #[cfg(feature = "verbose")]
                info!("tx({}): snapshot for var {} too old, retrying", tx.id, self.core.id);
                Err(TxError::Retry)
            }
        }
    }

    /// Stages `value` as this transaction's write to the var and claims
    /// write-intent on it. Fails with [`TxError::IllegalState`] if the var
    /// was already commuted in this transaction. A conflicting live owner is
    /// barged if this transaction is older and the grace period has elapsed;
    /// otherwise the attempt waits for the owner (bounded) and retries.
    pub fn assign(&self, tx: &mut Transaction, value: T) -> Result<T, TxError> {
        let ctx = tx.alive_ctx()?;
        if tx.has_commutes(self.core.id) {
            return Err(TxError::IllegalState(
                "assign and commute used on the same var".to_string(),
            ));
        }
        if !tx.is_assigned(self.core.id) {
            tx.mark_assigned(self.core.clone());
            // an ensure read lock on the same var would deadlock the write
            // acquisition below
            tx.release_ensure(self.core.id);

            let guard = self.core.lock_write_bounded()?;
            if tx.read_stamp < guard.current.stamp {
                // a newer commit invalidated our snapshot
                self.core.release_write(guard);
                return Err(TxError::Retry);
            }
            if let Some(owner) = self.core.write_owner() {
                if owner.is_alive() && !Arc::ptr_eq(&owner, &ctx) {
                    if !self.core.ctrl.try_terminate(&ctx, &owner) {
                        self.core.release_write(guard);
                        return Err(tx.retry_and_wait(&owner, self.core.ctrl.lock_wait));
                    }
                }
            }
            self.core.set_write_owner(&ctx);
            self.core.release_write(guard);
        }
        tx.put_value(self.core.id, Arc::new(value.clone()));
        Ok(value)
    }

    /// Reads the var and assigns the result of `f` applied to it.
    pub fn alter<F>(&self, tx: &mut Transaction, f: F) -> Result<T, TxError>
    where
        F: FnOnce(&T) -> T,
    {
        let current = self.read(tx)?;
        self.assign(tx, f(&current))
    }

    /// Records a commutative update. The function is applied immediately to
    /// the transaction-local value so the body observes the result, and
    /// replayed at commit time against the true current value of the var, so
    /// concurrent commutes do not conflict with each other.
    pub fn commute<F>(&self, tx: &mut Transaction, f: F) -> Result<T, TxError>
    where
        F: Fn(&T) -> T + 'static,
    {
        tx.alive_ctx()?;
        let base = match tx.pending(self.core.id) {
            Some(value) => value,
            None => {
                let guard = self.core.read_lock();
                let value = guard.current.value.clone();
                self.core.release_read(guard);
                tx.put_value(self.core.id, value.clone());
                value
            }
        };
        let op: CommuteFn = Box::new(move |value: &SharedValue| -> SharedValue {
            Arc::new(f(value
                .downcast_ref::<T>()
                .expect("shared value type does not match the TVar type")))
        });
        let result = op(&base);
        tx.push_commute(self.core.clone(), op);
        tx.put_value(self.core.id, result.clone());
        Ok(downcast::<T>(&result))
    }

    /// Declares a read dependency that must not change before commit,
    /// without writing: the var is read-locked and the lock is held until
    /// the attempt finalizes. Fails with [`TxError::Retry`] if the snapshot
    /// is already stale or a conflicting transaction holds write-intent.
    pub fn ensure(&self, tx: &mut Transaction) -> Result<(), TxError> {
        let ctx = tx.alive_ctx()?;
        if tx.is_ensured(self.core.id) {
            return Ok(());
        }
        let guard = self.core.read_lock();
        if tx.read_stamp < guard.current.stamp {
            self.core.release_read(guard);
            return Err(TxError::Retry);
        }
        match self.core.write_owner() {
            Some(owner) if owner.is_alive() && Arc::ptr_eq(&owner, &ctx) => {
                // we hold the write-intent ourselves, nothing to pin
                self.core.release_read(guard);
            }
            Some(owner) if owner.is_alive() => {
                if self.core.ctrl.try_terminate(&ctx, &owner) {
                    tx.record_ensure(HeldRead {
                        var: self.core.clone(),
                        guard,
                    });
                } else {
                    self.core.release_read(guard);
                    return Err(tx.retry_and_wait(&owner, self.core.ctrl.lock_wait));
                }
            }
            _ => tx.record_ensure(HeldRead {
                var: self.core.clone(),
                guard,
            }),
        }
        Ok(())
    }
}

impl<T> Clone for TVar<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for TVar<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TVar").field("id", &self.core.id).finish()
    }
}

impl<T> PartialEq for TVar<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn eq(&self, other: &Self) -> bool {
        self.core.id == other.core.id
    }
}

impl<T> Eq for TVar<T> where T: Clone + Send + Sync + 'static {}

impl<T> Hash for TVar<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.core.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Stm;
    use std::collections::hash_map::DefaultHasher;

    fn calculate_hash<V: Hash>(v: &V) -> u64 {
        let mut s = DefaultHasher::new();
        v.hash(&mut s);
        s.finish()
    }

    #[test]
    fn test_tvar_clone_equality() {
        let stm = Stm::default();
        let a = stm.create(10usize);
        let b = a.clone();

        assert_eq!(a, b);
        assert_eq!(calculate_hash(&a), calculate_hash(&b));

        let c = stm.create(10usize);
        assert_ne!(a, c);
    }

    #[test]
    fn test_history_is_bounded() {
        let stm = Stm::default();
        let var = stm.create(0usize);

        // force the var to look contended so commits retain history
        var.core().conflicts.store(1, Ordering::SeqCst);

        for i in 1..=30usize {
            stm.transactionally(|tx| var.assign(tx, i)).expect("Transaction failed");
            var.core().conflicts.store(1, Ordering::SeqCst);
            assert!(var.core().history_depth() <= MAX_HISTORY);
        }

        assert_eq!(var.core().history_depth(), MAX_HISTORY);
        assert_eq!(var.read_atomic(), 30);
    }

    #[test]
    fn test_uncontended_var_keeps_no_history() {
        let stm = Stm::default();
        let var = stm.create(0usize);

        for i in 1..=5usize {
            stm.transactionally(|tx| var.assign(tx, i)).expect("Transaction failed");
        }

        assert_eq!(var.core().history_depth(), 0);
        assert_eq!(var.read_atomic(), 5);
    }
}
