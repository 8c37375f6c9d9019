// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use log::*;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    clock::{Clock, MonotonicClock},
    error::TxError,
    transaction::{Transaction, TxContext, TxState},
    tvar::{TVar, TVarCore, WriteGuard},
};

/// Tunables of one [`Stm`] instance. The defaults mirror a moderately
/// contended in-process workload; all waits are bounded and convert into
/// retries rather than blocking indefinitely.
#[derive(Clone, Debug)]
pub struct StmConfig {
    /// Bound on waiting for a var's write lock, and on waiting for a barged
    /// owner to finalize.
    pub lock_wait: Duration,
    /// Grace period a conflicting transaction is given before an older
    /// transaction may forcibly terminate it.
    pub terminate_wait: Duration,
    /// Number of attempts before a transaction fails with
    /// [`TxError::RetryLimitReached`].
    pub max_retries: usize,
    /// Default fairness of per-var locks; fair vars release their locks with
    /// the fair-unlock protocol.
    pub fair: bool,
}

impl Default for StmConfig {
    fn default() -> Self {
        Self {
            lock_wait: Duration::from_millis(10),
            terminate_wait: Duration::from_millis(5),
            max_retries: 50_000,
            fair: false,
        }
    }
}

/// Shared internals of an [`Stm`]: the global stamp and id counters, the
/// configuration and the clock. Every [`TVar`] keeps a handle to the
/// instance that created it.
pub(crate) struct StmCore {
    next_var_id: AtomicU64,
    next_stamp: AtomicU64,
    next_tx_id: AtomicU64,
    pub(crate) lock_wait: Duration,
    terminate_wait_nanos: u64,
    max_retries: usize,
    pub(crate) fair: bool,
    clock: Arc<dyn Clock>,
}

impl StmCore {
    pub(crate) fn next_var_id(&self) -> u64 {
        self.next_var_id.fetch_add(1, Ordering::SeqCst)
    }

    fn next_stamp(&self) -> u64 {
        self.next_stamp.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn next_tx_id(&self) -> u64 {
        self.next_tx_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn nanos(&self) -> u64 {
        self.clock.nanos()
    }

    /// Barging: forcibly terminates `owner` on behalf of `ours`. Succeeds
    /// only if `ours` is the older transaction, the grace period has elapsed
    /// and `owner` is still `Running` (a committing transaction is never
    /// barged). The state is only ever downgraded via CAS, so the victim's
    /// own finalization code remains the sole releaser of its locks.
    pub(crate) fn try_terminate(&self, ours: &TxContext, owner: &TxContext) -> bool {
        if ours.start_stamp < owner.start_stamp
            && owner.start_time + self.terminate_wait_nanos < self.clock.nanos()
        {
            if owner.cas_state(TxState::Running, TxState::Terminated) {
                debug!(
                    "tx with start stamp {} barged tx with start stamp {}",
                    ours.start_stamp, owner.start_stamp
                );
                owner.count_down();
                return true;
            }
        }
        false
    }
}

/// A write lock taken during the commit phase, paired with the var it
/// belongs to. The coordinator keeps these on an explicit stack and releases
/// them in reverse acquisition order on every exit path.
struct LockedWrite {
    var: Arc<TVarCore>,
    guard: WriteGuard,
}

impl LockedWrite {
    fn release(self) {
        let LockedWrite { var, guard } = self;
        var.release_write(guard);
    }
}

/// The transaction coordinator. Allocates timestamps, owns the retry loop
/// and performs conflict resolution; see [`Self::transactionally`].
#[derive(Clone)]
pub struct Stm {
    core: Arc<StmCore>,
}

impl Default for Stm {
    fn default() -> Self {
        Self::new()
    }
}

impl Stm {
    pub fn new() -> Self {
        Self::with_config(StmConfig::default())
    }

    pub fn with_config(config: StmConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    /// Creates an [`Stm`] with an injected [`Clock`], making the barging
    /// grace period deterministic in tests.
    pub fn with_clock(config: StmConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            core: Arc::new(StmCore {
                next_var_id: AtomicU64::new(0),
                next_stamp: AtomicU64::new(0),
                next_tx_id: AtomicU64::new(0),
                lock_wait: config.lock_wait,
                terminate_wait_nanos: config.terminate_wait.as_nanos() as u64,
                max_retries: config.max_retries,
                fair: config.fair,
                clock,
            }),
        }
    }

    /// Creates a new transactional variable [`TVar`] with the instance's
    /// default lock fairness.
    pub fn create<T>(&self, value: T) -> TVar<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.create_with_fairness(value, self.core.fair)
    }

    /// Creates a new [`TVar`] with an explicit lock fairness.
    pub fn create_with_fairness<T>(&self, value: T, fair: bool) -> TVar<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        TVar::new(self.core.clone(), value, fair)
    }

    /// Runs `body` atomically. Each attempt:
    ///
    /// 1. Allocates a fresh read stamp (the start stamp and start time are
    ///    fixed on the first attempt; conflicts are decided by age).
    /// 2. Creates a fresh status cell in `Running` and executes `body`,
    ///    whose var operations stage reads and writes on the transaction.
    /// 3. Gates the commit on a CAS `Running -> Committing`; a barged
    ///    attempt fails the CAS and falls through to the retry.
    /// 4. Replays pending commutes over the true current values, locks every
    ///    assigned var in touch order, allocates the commit stamp after all
    ///    locks are held and publishes the pending values.
    /// 5. On every exit path releases the held write locks in reverse order,
    ///    releases the ensure read locks and finalizes the status cell,
    ///    unblocking any transaction waiting on this one.
    ///
    /// Conflicts surface as [`TxError::Retry`] and are consumed by the loop;
    /// any other error from `body` propagates to the caller after the
    /// attempt is finalized. Exhausting the configured attempts fails with
    /// [`TxError::RetryLimitReached`].
    pub fn transactionally<B, F>(&self, mut body: F) -> Result<B, TxError>
    where
        F: FnMut(&mut Transaction) -> Result<B, TxError>,
    {
        let mut tx = Transaction::new(self.core.next_tx_id());
        for attempt in 0..self.core.max_retries {
            let stamp = self.core.next_stamp();
            tx.read_stamp = stamp;
            if attempt == 0 {
                tx.start_stamp = stamp;
                tx.start_time = self.core.nanos();
            }
            tx.ctx = Some(Arc::new(TxContext::new(tx.start_stamp, tx.start_time)));
            #[cfg(feature = "verbose")]
            info!("TX({}): START attempt {} with read stamp {}", tx.id, attempt, stamp);

            let mut locked: Vec<LockedWrite> = Vec::new();
            let outcome = self.run_attempt(&mut tx, &mut body, &mut locked);

            while let Some(held) = locked.pop() {
                held.release();
            }
            let state = if outcome.is_ok() {
                TxState::Committed
            } else {
                TxState::Retrying
            };
            tx.terminate(state);

            match outcome {
                Ok(value) => {
                    #[cfg(feature = "verbose")]
                    info!("TX({}): COMMITTED", tx.id);
                    return Ok(value);
                }
                Err(TxError::Retry) => {
                    #[cfg(feature = "verbose")]
                    info!("TX({}): RETRYING", tx.id);
                }
                Err(error) => return Err(error),
            }
        }
        warn!("TX({}): retry limit reached", tx.id);
        Err(TxError::RetryLimitReached)
    }

    /// One attempt: body execution plus the commit protocol. Locks taken
    /// here are pushed onto `locked` immediately, so the caller can release
    /// them no matter where the attempt fails.
    fn run_attempt<B, F>(
        &self,
        tx: &mut Transaction,
        body: &mut F,
        locked: &mut Vec<LockedWrite>,
    ) -> Result<B, TxError>
    where
        F: FnMut(&mut Transaction) -> Result<B, TxError>,
    {
        let result = body(tx)?;

        let ctx = tx.ctx.clone().ok_or(TxError::Retry)?;
        if !ctx.cas_state(TxState::Running, TxState::Committing) {
            // barged while running
            return Err(TxError::Retry);
        }

        // replay commutes against the true current values
        for (var, ops) in tx.take_commutes() {
            if tx.is_assigned(var.id) {
                // the queued functions were already absorbed into the
                // pending value when they were recorded
                continue;
            }
            let ensured = tx.is_ensured(var.id);
            tx.release_ensure(var.id);

            let guard = var.lock_write_bounded()?;
            let stale = ensured && tx.read_stamp < guard.current.stamp;
            let current = guard.current.value.clone();
            locked.push(LockedWrite { var: var.clone(), guard });
            if stale {
                return Err(TxError::Retry);
            }
            if let Some(owner) = var.write_owner() {
                if owner.is_alive() && !Arc::ptr_eq(&owner, &ctx) && !self.core.try_terminate(&ctx, &owner) {
                    return Err(TxError::Retry);
                }
            }
            let replayed = ops.iter().fold(current, |value, op| op(&value));
            tx.put_value(var.id, replayed);
        }

        // lock every assigned var, in the order the body touched them
        for var in tx.assigned_vars() {
            let guard = var.lock_write_bounded()?;
            locked.push(LockedWrite { var, guard });
        }

        // with all locks held the commit point is a single global stamp
        let commit_stamp = self.core.next_stamp();
        for held in locked.iter_mut() {
            if let Some(value) = tx.pending(held.var.id) {
                held.var.install(&mut held.guard, value, commit_stamp);
            }
        }

        ctx.set_state(TxState::Committed);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_retry_limit_is_fatal() {
        let stm = Stm::with_config(StmConfig {
            max_retries: 3,
            ..StmConfig::default()
        });

        let result: Result<(), TxError> = stm.transactionally(|_| Err(TxError::Retry));
        assert_eq!(result, Err(TxError::RetryLimitReached));
    }

    #[test]
    fn test_zero_retries_never_runs() {
        let stm = Stm::with_config(StmConfig {
            max_retries: 0,
            ..StmConfig::default()
        });

        let mut ran = false;
        let result: Result<(), TxError> = stm.transactionally(|_| {
            ran = true;
            Ok(())
        });
        assert_eq!(result, Err(TxError::RetryLimitReached));
        assert!(!ran);
    }

    #[test]
    fn test_body_errors_propagate() {
        let stm = Stm::default();
        let var = stm.create(0usize);

        let result: Result<(), TxError> = stm.transactionally(|tx| {
            var.assign(tx, 1)?;
            Err(TxError::IllegalState("boom".to_string()))
        });
        assert!(matches!(result, Err(TxError::IllegalState(_))));

        // the aborted attempt left no residue
        assert_eq!(var.read_atomic(), 0);
        let value = stm.transactionally(|tx| var.read(tx)).expect("Transaction failed");
        assert_eq!(value, 0);
    }

    #[test]
    fn test_barge_requires_age_and_grace() {
        let clock = Arc::new(ManualClock::default());
        let stm = Stm::with_clock(
            StmConfig {
                terminate_wait: Duration::from_nanos(5_000),
                ..StmConfig::default()
            },
            clock.clone(),
        );

        let older = TxContext::new(1, 0);
        let younger = TxContext::new(2, 0);

        // grace period has not elapsed yet
        assert!(!stm.core.try_terminate(&older, &younger));
        assert!(younger.is_alive());

        clock.advance(6_000);

        // a younger transaction may never barge an older one
        assert!(!stm.core.try_terminate(&younger, &older));
        assert!(older.is_alive());

        // older transaction, grace elapsed: the victim is terminated
        assert!(stm.core.try_terminate(&older, &younger));
        assert_eq!(younger.state(), TxState::Terminated);

        // a dead victim cannot be terminated twice
        assert!(!stm.core.try_terminate(&older, &younger));
    }

    #[test]
    fn test_committing_owner_is_never_barged() {
        let clock = Arc::new(ManualClock::default());
        let stm = Stm::with_clock(StmConfig::default(), clock.clone());
        clock.advance(u64::MAX / 2);

        let older = TxContext::new(1, 0);
        let committing = TxContext::new(2, 0);
        assert!(committing.cas_state(TxState::Running, TxState::Committing));

        assert!(!stm.core.try_terminate(&older, &committing));
        assert_eq!(committing.state(), TxState::Committing);
    }

    #[test]
    fn test_snapshot_served_from_history() {
        let stm = Stm::default();
        let var = stm.create(0usize);

        // mark the var contended so the commit below retains history
        var.core().conflicts.store(1, std::sync::atomic::Ordering::SeqCst);

        let stm_inner = stm.clone();
        let var_inner = var.clone();
        let (first, second) = stm
            .transactionally(|tx| {
                let first = var.read(tx)?;
                // an independent transaction commits while we are running
                stm_inner.transactionally(|inner| var_inner.assign(inner, 7))?;
                let second = var.read(tx)?;
                Ok((first, second))
            })
            .expect("Transaction failed");

        // both reads observe the snapshot as of our read stamp
        assert_eq!(first, 0);
        assert_eq!(second, 0);
        assert_eq!(var.read_atomic(), 7);
    }
}
