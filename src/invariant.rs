//! Invariants are conditions that must hold unless there is a bug in this crate. Raising one
//! records the violation on a process-wide counter and logs it, without crashing the process;
//! the call site is still responsible for failing the operation with a regular error.
//!
//! Invariants are not for conditions caused by external factors: a file that fails to open is
//! an IO error, not an invariant violation. A segment that our own writer produced with the
//! wrong ids is.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

type CounterKey = (&'static str, &'static str);

static COUNTERS: OnceLock<Mutex<HashMap<CounterKey, u64>>> = OnceLock::new();

fn counters() -> &'static Mutex<HashMap<CounterKey, u64>> {
    COUNTERS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Records an invariant violation for the given module and kind.
pub fn raise(module: &'static str, kind: &'static str, message: &str) {
    {
        let mut counters = counters().lock().unwrap();
        *counters.entry((module, kind)).or_insert(0) += 1;
    }
    tracing::error!(module, kind, "{message}");
}

/// Returns the number of times the given invariant has been violated.
pub fn count(module: &'static str, kind: &'static str) -> u64 {
    counters().lock().unwrap().get(&(module, kind)).copied().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_increments_counter() {
        assert_eq!(count("test", "raise_increments"), 0);
        raise("test", "raise_increments", "first violation");
        assert_eq!(count("test", "raise_increments"), 1);
        raise("test", "raise_increments", "second violation");
        assert_eq!(count("test", "raise_increments"), 2);
    }

    #[test]
    fn test_counters_are_independent() {
        raise("test", "independent_a", "violation");
        assert_eq!(count("test", "independent_a"), 1);
        assert_eq!(count("test", "independent_b"), 0);
    }
}
