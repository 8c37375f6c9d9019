// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

/// A monotonic nanosecond source. The engine consults the clock only to
/// decide whether the barging grace period has elapsed, so a manual
/// implementation makes that decision deterministic in tests.
pub trait Clock: Send + Sync {
    fn nanos(&self) -> u64;
}

/// Default [`Clock`] backed by [`Instant`]. Values are nanoseconds since the
/// clock was created; they are only ever compared against each other.
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// A hand-driven [`Clock`] for deterministic tests.
#[derive(Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn advance(&self, nanos: u64) {
        self.now.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn nanos(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
