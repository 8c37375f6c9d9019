// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error as DeriveError;

#[derive(Debug, DeriveError, PartialEq, Eq)]
pub enum TxError {
    /// The current attempt hit a conflict and must be retried. This is an
    /// internal control-flow signal: it is raised by [`TVar`](crate::TVar)
    /// operations and caught only by the retry loop in
    /// [`Stm::transactionally`](crate::Stm::transactionally).
    #[error("transaction must retry")]
    Retry,

    /// The transactional api was misused, eg. `assign` and `commute` were
    /// mixed on the same var within one transaction. Not retried.
    #[error("illegal transaction state: {0}")]
    IllegalState(String),

    /// The transaction could not commit within the configured number of
    /// attempts. This signals pathological contention and is propagated to
    /// the caller as a hard failure.
    #[error("retry limit reached")]
    RetryLimitReached,
}
