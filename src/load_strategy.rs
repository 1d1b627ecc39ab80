use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{KeyStore, Operation, OperationType, Result};

/// Generator of the operation stream.
///
/// A single strategy instance is shared by all worker threads: `next` is
/// called concurrently and must hand out each unit of a bounded budget exactly
/// once (see [`OperationBudget`]).
///
/// # Shutdown
///
/// Once `runtime_shutting_down` is `true` the strategy must stop producing
/// ordinary operations. It may still return cleanup operations (closing a
/// session, releasing a lock); the worker keeps calling `next` with the flag
/// set until it returns `None`.
pub trait LoadStrategy: Send + Sync {
    /// Name the strategy is registered under.
    fn name(&self) -> &str;

    /// Produce the next operation, or `None` when this worker's stream is
    /// exhausted.
    fn next(
        &self,
        last_operation: Option<&dyn Operation>,
        last_written_key: Option<&str>,
        runtime_shutting_down: bool,
    ) -> Result<Option<Box<dyn Operation>>>;

    /// Every operation type `next` may return. The sampler keeps one counter
    /// per type and rejects anything else.
    fn operation_types(&self) -> Vec<OperationType>;

    /// Key store used to persist written keys, if the strategy is key based.
    fn key_store(&self) -> Option<Arc<dyn KeyStore>> {
        None
    }

    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn is_started(&self) -> bool;
}

/// Optional countdown of operations shared by all workers.
///
/// `None` means unlimited. Units are claimed with a compare-and-swap loop so
/// concurrent callers never overdraw the budget.
#[derive(Debug)]
pub struct OperationBudget {
    remaining: Option<AtomicU64>,
}

impl OperationBudget {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            remaining: limit.map(AtomicU64::new),
        }
    }

    pub fn unlimited() -> Self {
        Self { remaining: None }
    }

    /// Claim one operation. Returns `false` once the budget is spent.
    pub fn try_acquire(&self) -> bool {
        let Some(remaining) = &self.remaining else {
            return true;
        };
        let mut current = remaining.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match remaining.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Operations left, `None` if unlimited.
    pub fn remaining(&self) -> Option<u64> {
        self.remaining.as_ref().map(|r| r.load(Ordering::Acquire))
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == Some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn unlimited_budget_never_runs_out() {
        let budget = OperationBudget::unlimited();
        for _ in 0..1000 {
            assert!(budget.try_acquire());
        }
        assert_eq!(budget.remaining(), None);
        assert!(!budget.is_exhausted());
    }

    #[test]
    fn zero_budget_is_exhausted_immediately() {
        let budget = OperationBudget::new(Some(0));
        assert!(budget.is_exhausted());
        assert!(!budget.try_acquire());
    }

    #[test]
    fn concurrent_claims_never_overdraw() {
        let budget = Arc::new(OperationBudget::new(Some(10_000)));
        let claimed = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let budget = budget.clone();
                let claimed = claimed.clone();
                thread::spawn(move || {
                    while budget.try_acquire() {
                        claimed.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(claimed.load(Ordering::Relaxed), 10_000);
        assert!(budget.is_exhausted());
    }
}
