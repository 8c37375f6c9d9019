// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Multiversion Software Transactional Memory
//!
//! An in-process transactional memory over shared mutable cells. Each
//! [`TVar`] carries a bounded history of stamped values, so readers are
//! served a consistent snapshot without blocking writers; writers stage
//! their updates on a [`Transaction`] and publish them atomically under a
//! single commit stamp. Conflicts never surface to the caller: the
//! coordinator retries the transaction body until it commits or the retry
//! limit is hit.
//!
//! Inside a transaction, a var supports five operations:
//! - [`TVar::read`]: snapshot read, repeatable within the transaction,
//! - [`TVar::assign`]: stage a write and claim write-intent on the var,
//! - [`TVar::alter`]: read-modify-write in one step,
//! - [`TVar::commute`]: a commutative update replayed at commit time, so
//!   concurrent increments of a counter do not conflict with each other,
//! - [`TVar::ensure`]: pin a read-only dependency so it cannot change
//!   before the commit, closing the write-skew window.
//!
//! Write conflicts are resolved by age: the older transaction may forcibly
//! terminate a younger conflicting one after a grace period, so long
//! transactions cannot be starved by a stream of short ones.
//!
//! ```
//! use mvstm::Stm;
//!
//! let stm = Stm::default();
//! let balance = stm.create(100u64);
//!
//! stm.transactionally(|tx| {
//!     let current = balance.read(tx)?;
//!     balance.assign(tx, current + 20)
//! })
//! .expect("Transaction failed");
//!
//! assert_eq!(balance.read_atomic(), 120);
//! ```

pub mod clock;
pub mod error;
mod shared_value;
pub mod stm;
pub mod transaction;
pub mod tvar;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::TxError;
pub use stm::{Stm, StmConfig};
pub use transaction::Transaction;
pub use tvar::TVar;
