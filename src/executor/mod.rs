//! Executor: the worker threads that drive operations against the service.
//!
//! Two layers:
//!
//! - [`SingleThreadedRunner`]: one blocking loop on one OS thread. It pulls
//!   operations from the shared [`LoadStrategy`](crate::LoadStrategy), times
//!   them, and records the outcome with the [`Sampler`](crate::Sampler).
//! - [`MultiThreadedRunner`]: owns a pool of single-threaded runners sharing
//!   one service, one strategy, one sampler and one key store.
//!
//! # Coordination
//! Every runner of a pool shares a [`ShutdownSignal`] and a
//! [`CompletionLatch`]:
//!
//! 1. The signal is the only cancellation mechanism. It is raised when the
//!    run duration expires, when the strategy runs out of operations, or on
//!    an explicit `stop()`. Workers observe it between operations.
//! 2. After the signal is raised each worker keeps asking the strategy for
//!    cleanup operations until it returns `None`, then arrives at the latch.
//! 3. The pool owner blocks on the latch until every worker arrived.
pub mod pool;
pub mod worker;

pub use pool::MultiThreadedRunner;
pub use worker::{RunnerDependencies, SingleThreadedRunner};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct SignalState {
    triggered: AtomicBool,
    lock: Mutex<()>,
    wakeup: Condvar,
}

/// Shared, one-way shutdown flag. Clones observe the same flag.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    state: Arc<SignalState>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Returns `true` if this call raised it.
    pub fn trigger(&self) -> bool {
        let first = !self.state.triggered.swap(true, Ordering::AcqRel);
        let _guard = self.state.lock.lock();
        self.state.wakeup.notify_all();
        first
    }

    pub fn is_triggered(&self) -> bool {
        self.state.triggered.load(Ordering::Acquire)
    }

    /// Sleep for `timeout` or until the flag is raised, whichever comes
    /// first. Returns whether the flag is raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.state.lock.lock();
        while !self.is_triggered() {
            if self.state.wakeup.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        self.is_triggered()
    }
}

/// Counts down once per worker. The pool owner waits for zero.
#[derive(Clone)]
pub struct CompletionLatch {
    state: Arc<(Mutex<usize>, Condvar)>,
}

impl CompletionLatch {
    pub fn new(count: usize) -> Self {
        Self {
            state: Arc::new((Mutex::new(count), Condvar::new())),
        }
    }

    pub fn arrive(&self) {
        let (count, zero) = &*self.state;
        let mut count = count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            zero.notify_all();
        }
    }

    /// Arrive when the returned guard is dropped, including during a panic.
    pub fn arrival(&self) -> Arrival {
        Arrival(self.clone())
    }

    pub fn remaining(&self) -> usize {
        *self.state.0.lock()
    }

    pub fn wait(&self) {
        let (count, zero) = &*self.state;
        let mut count = count.lock();
        while *count > 0 {
            zero.wait(&mut count);
        }
    }

    /// Returns `false` if the count did not reach zero within `timeout`.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (count, zero) = &*self.state;
        let mut count = count.lock();
        while *count > 0 {
            if zero.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

pub struct Arrival(CompletionLatch);

impl Drop for Arrival {
    fn drop(&mut self) {
        self.0.arrive();
    }
}
