// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{any::Any, sync::Arc};

/// A committed or pending value with its concrete type erased, so that one
/// transaction can stage writes to vars of different types. The typed
/// [`TVar<T>`](crate::TVar) surface re-types values on the way out.
pub(crate) type SharedValue = Arc<dyn Any + Send + Sync>;

/// A type-erased commute function, replayed at commit time against the true
/// current value of the var.
pub(crate) type CommuteFn = Box<dyn Fn(&SharedValue) -> SharedValue>;

/// Re-types a [`SharedValue`]. Vars are keyed by id and an id is bound to a
/// single `T` at creation, so a mismatch cannot be reached through the
/// public api.
pub(crate) fn downcast<T>(value: &SharedValue) -> T
where
    T: Clone + Send + Sync + 'static,
{
    value
        .downcast_ref::<T>()
        .expect("shared value type does not match the TVar type")
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downcast_roundtrip() {
        let value: SharedValue = Arc::new(42usize);
        assert_eq!(downcast::<usize>(&value), 42);
    }
}
