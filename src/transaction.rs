// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use parking_lot::{Condvar, Mutex};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    error::TxError,
    shared_value::{CommuteFn, SharedValue},
    tvar::{HeldRead, TVarCore},
};

/// The lifecycle of one transaction attempt. `Running -> Committing ->
/// Committed` is the success path, `Running -> Retrying` the abort path, and
/// any live state may be forced to `Terminated` by a barging transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum TxState {
    Running = 0,
    Committing = 1,
    Committed = 2,
    Retrying = 3,
    Terminated = 4,
}

impl TxState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TxState::Running,
            1 => TxState::Committing,
            2 => TxState::Committed,
            3 => TxState::Retrying,
            4 => TxState::Terminated,
            _ => unreachable!("invalid transaction state"),
        }
    }

    pub(crate) fn is_alive(self) -> bool {
        matches!(self, TxState::Running | TxState::Committing)
    }
}

/// The shared status cell of one attempt. Other transactions reach it
/// through the write-intent record of a var (a weak reference): they may CAS
/// the state to barge the attempt, and they may block on the latch until the
/// attempt finalizes. The state word and the latch are separate primitives;
/// only the owning transaction counts the latch down, except for the barge
/// CAS which signals on the victim's behalf.
pub(crate) struct TxContext {
    pub(crate) start_stamp: u64,
    pub(crate) start_time: u64,
    state: AtomicU8,
    done: Mutex<bool>,
    signal: Condvar,
}

impl TxContext {
    pub(crate) fn new(start_stamp: u64, start_time: u64) -> Self {
        Self {
            start_stamp,
            start_time,
            state: AtomicU8::new(TxState::Running as u8),
            done: Mutex::new(false),
            signal: Condvar::new(),
        }
    }

    pub(crate) fn state(&self) -> TxState {
        TxState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.state().is_alive()
    }

    pub(crate) fn cas_state(&self, expected: TxState, updated: TxState) -> bool {
        self.state
            .compare_exchange(expected as u8, updated as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn set_state(&self, state: TxState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Opens the latch and wakes every transaction blocked in
    /// [`Self::await_done`].
    pub(crate) fn count_down(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.signal.notify_all();
    }

    /// Blocks until the attempt finalizes, bounded by `timeout`.
    pub(crate) fn await_done(&self, timeout: Duration) {
        let mut done = self.done.lock();
        if !*done {
            self.signal.wait_for(&mut done, timeout);
        }
    }
}

/// Per-attempt record of one in-flight transaction. Created by
/// [`Stm::transactionally`](crate::Stm::transactionally) and handed to the
/// user closure by mutable reference; every var operation takes it
/// explicitly, so there is no ambient thread-local state. Helper functions
/// taking `&mut Transaction` compose into the caller's snapshot without
/// starting a new attempt.
pub struct Transaction {
    pub(crate) id: u64,
    pub(crate) read_stamp: u64,
    pub(crate) start_stamp: u64,
    pub(crate) start_time: u64,
    pub(crate) ctx: Option<Arc<TxContext>>,

    /// Values this attempt would write, keyed by var id.
    values: HashMap<u64, SharedValue>,
    /// Vars explicitly assigned, in the order they were first touched. The
    /// commit phase locks them in exactly this order.
    assigned: Vec<Arc<TVarCore>>,
    assigned_ids: HashSet<u64>,
    /// Pending commute functions per var, in touch order.
    commutes: Vec<(Arc<TVarCore>, Vec<CommuteFn>)>,
    commute_ids: HashMap<u64, usize>,
    /// Read guards held for vars validated via `ensure`, kept until the
    /// attempt finalizes.
    ensures: HashMap<u64, HeldRead>,
}

impl Transaction {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            read_stamp: 0,
            start_stamp: 0,
            start_time: 0,
            ctx: None,
            values: HashMap::new(),
            assigned: Vec::new(),
            assigned_ids: HashSet::new(),
            commutes: Vec::new(),
            commute_ids: HashMap::new(),
            ensures: HashMap::new(),
        }
    }

    /// Returns the status cell if this attempt may still do work. A missing
    /// or dead context converts into [`TxError::Retry`], which sends the
    /// coordinator into the next attempt.
    pub(crate) fn alive_ctx(&self) -> Result<Arc<TxContext>, TxError> {
        match &self.ctx {
            Some(ctx) if ctx.is_alive() => Ok(ctx.clone()),
            _ => Err(TxError::Retry),
        }
    }

    pub(crate) fn pending(&self, id: u64) -> Option<SharedValue> {
        self.values.get(&id).cloned()
    }

    pub(crate) fn put_value(&mut self, id: u64, value: SharedValue) {
        self.values.insert(id, value);
    }

    pub(crate) fn is_assigned(&self, id: u64) -> bool {
        self.assigned_ids.contains(&id)
    }

    pub(crate) fn mark_assigned(&mut self, var: Arc<TVarCore>) {
        if self.assigned_ids.insert(var.id) {
            self.assigned.push(var);
        }
    }

    pub(crate) fn assigned_vars(&self) -> Vec<Arc<TVarCore>> {
        self.assigned.clone()
    }

    pub(crate) fn has_commutes(&self, id: u64) -> bool {
        self.commute_ids.contains_key(&id)
    }

    pub(crate) fn push_commute(&mut self, var: Arc<TVarCore>, op: CommuteFn) {
        match self.commute_ids.get(&var.id) {
            Some(index) => self.commutes[*index].1.push(op),
            None => {
                self.commute_ids.insert(var.id, self.commutes.len());
                self.commutes.push((var, vec![op]));
            }
        }
    }

    /// Hands the queued commutes to the commit phase. The lists are
    /// per-attempt state; terminate would discard them anyway.
    pub(crate) fn take_commutes(&mut self) -> Vec<(Arc<TVarCore>, Vec<CommuteFn>)> {
        self.commute_ids.clear();
        std::mem::take(&mut self.commutes)
    }

    pub(crate) fn is_ensured(&self, id: u64) -> bool {
        self.ensures.contains_key(&id)
    }

    pub(crate) fn record_ensure(&mut self, held: HeldRead) {
        self.ensures.insert(held.var.id, held);
    }

    pub(crate) fn release_ensure(&mut self, id: u64) {
        if let Some(held) = self.ensures.remove(&id) {
            held.release();
        }
    }

    /// Finalizes the attempt: stores the terminal state, opens the latch so
    /// that any transaction barge-waiting on this one unblocks, and discards
    /// all per-attempt state, releasing the ensure read guards. Idempotent;
    /// failed attempts leave no residue on shared state.
    pub(crate) fn terminate(&mut self, state: TxState) {
        if let Some(ctx) = self.ctx.take() {
            ctx.set_state(state);
            ctx.count_down();
        }
        self.values.clear();
        self.assigned.clear();
        self.assigned_ids.clear();
        self.commutes.clear();
        self.commute_ids.clear();
        for (_, held) in self.ensures.drain() {
            held.release();
        }
    }

    /// The losing side of a write-intent conflict: give up the current
    /// attempt, then wait (bounded) for the owner to finalize so the retry
    /// does not spin against a lock that is about to be released.
    pub(crate) fn retry_and_wait(&mut self, owner: &Arc<TxContext>, timeout: Duration) -> TxError {
        self.terminate(TxState::Retrying);
        owner.await_done(timeout);
        TxError::Retry
    }
}
