//! Per-operation-type accumulators.
//!
//! A [`Counter`] is updated by every worker thread on every completed
//! operation, so updates take no lock: they load the current accumulator
//! through an [`ArcSwap`] and bump its atomics.
//! [`Counter::snapshot_and_reset`] swaps a fresh accumulator in and waits
//! until the updates still holding the old one have let go of it. An update
//! therefore lands either in the returned snapshot or in the fresh
//! accumulator, never in both and never in neither.
//!
//! [`CounterValues`] is the immutable, mergeable snapshot handed to sampling
//! intervals. Like a karga `Aggregate`, it keeps raw sums and counts only;
//! averages and rates are left to consumers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use serde::Serialize;

use crate::{Error, FailureType, Operation, OperationType, Result};

/// Count and cumulated duration of a group of completed operations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FailureCounter {
    count: u64,
    cumulated_duration_nanos: u64,
}

impl FailureCounter {
    pub fn new(count: u64, cumulated_duration_nanos: u64) -> Self {
        Self {
            count,
            cumulated_duration_nanos,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn cumulated_duration_nanos(&self) -> u64 {
        self.cumulated_duration_nanos
    }

    pub fn merge(&mut self, other: FailureCounter) {
        self.count += other.count;
        self.cumulated_duration_nanos += other.cumulated_duration_nanos;
    }
}

/// Immutable snapshot of a [`Counter`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CounterValues {
    success_count: u64,
    success_cumulated_duration_nanos: u64,
    failures: BTreeMap<FailureType, FailureCounter>,
}

impl CounterValues {
    pub fn new(
        success_count: u64,
        success_cumulated_duration_nanos: u64,
        failures: BTreeMap<FailureType, FailureCounter>,
    ) -> Self {
        Self {
            success_count,
            success_cumulated_duration_nanos,
            failures,
        }
    }

    pub fn success_count(&self) -> u64 {
        self.success_count
    }

    pub fn success_cumulated_duration_nanos(&self) -> u64 {
        self.success_cumulated_duration_nanos
    }

    /// Failures of every type.
    pub fn failure_count(&self) -> u64 {
        self.failures.values().map(FailureCounter::count).sum()
    }

    pub fn failure_cumulated_duration_nanos(&self) -> u64 {
        self.failures
            .values()
            .map(FailureCounter::cumulated_duration_nanos)
            .sum()
    }

    /// Failures of one type, 0 if none were recorded.
    pub fn failure_count_of(&self, failure_type: &FailureType) -> u64 {
        self.failures.get(failure_type).map_or(0, FailureCounter::count)
    }

    pub fn failure_cumulated_duration_nanos_of(&self, failure_type: &FailureType) -> u64 {
        self.failures
            .get(failure_type)
            .map_or(0, FailureCounter::cumulated_duration_nanos)
    }

    pub fn failures(&self) -> &BTreeMap<FailureType, FailureCounter> {
        &self.failures
    }

    /// Successes plus failures.
    pub fn total_count(&self) -> u64 {
        self.success_count + self.failure_count()
    }

    pub fn is_empty(&self) -> bool {
        self.total_count() == 0
    }

    /// Add `other` into `self`. Failure types present in either side are
    /// kept; counts of shared types are summed.
    pub fn merge(&mut self, other: &CounterValues) {
        self.success_count += other.success_count;
        self.success_cumulated_duration_nanos += other.success_cumulated_duration_nanos;
        for (failure_type, fc) in &other.failures {
            self.failures
                .entry(failure_type.clone())
                .or_default()
                .merge(*fc);
        }
    }
}

#[derive(Debug, Default)]
struct AtomicPair {
    count: AtomicU64,
    duration: AtomicU64,
}

impl AtomicPair {
    fn add(&self, duration: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.duration.fetch_add(duration, Ordering::Relaxed);
    }

    fn into_counter(self) -> FailureCounter {
        FailureCounter::new(self.count.into_inner(), self.duration.into_inner())
    }
}

#[derive(Debug, Default)]
struct Tally {
    success: AtomicPair,
    failures: RwLock<HashMap<FailureType, AtomicPair>>,
}

impl Tally {
    fn add_failure(&self, failure_type: &FailureType, duration: u64) {
        if let Some(pair) = self.failures.read().get(failure_type) {
            pair.add(duration);
            return;
        }
        self.failures
            .write()
            .entry(failure_type.clone())
            .or_default()
            .add(duration);
    }

    fn into_values(self) -> CounterValues {
        let success = self.success.into_counter();
        let failures = self
            .failures
            .into_inner()
            .into_iter()
            .map(|(k, v)| (k, v.into_counter()))
            .collect();
        CounterValues::new(success.count(), success.cumulated_duration_nanos(), failures)
    }
}

/// Concurrency-safe accumulator for one [`OperationType`].
#[derive(Debug)]
pub struct Counter {
    operation_type: OperationType,
    tally: ArcSwap<Tally>,
}

impl Counter {
    pub fn new(operation_type: OperationType) -> Self {
        Self {
            operation_type,
            tally: ArcSwap::from_pointee(Tally::default()),
        }
    }

    pub fn operation_type(&self) -> OperationType {
        self.operation_type
    }

    /// Record a successful operation that ran from `t0_nanos` to `t1_nanos`.
    pub fn update(&self, t0_nanos: u64, t1_nanos: u64, operation: &dyn Operation) -> Result<()> {
        let duration = self.check(t0_nanos, t1_nanos, operation)?;
        self.tally.load().success.add(duration);
        Ok(())
    }

    /// Record a failed operation, keyed by `failure_type`.
    pub fn update_failure(
        &self,
        t0_nanos: u64,
        t1_nanos: u64,
        operation: &dyn Operation,
        failure_type: &FailureType,
    ) -> Result<()> {
        let duration = self.check(t0_nanos, t1_nanos, operation)?;
        self.tally.load().add_failure(failure_type, duration);
        Ok(())
    }

    /// Return everything accumulated since the previous reset and start over
    /// from zero, as one atomic step.
    pub fn snapshot_and_reset(&self) -> CounterValues {
        let mut previous = self.tally.swap(Arc::new(Tally::default()));
        // updates that loaded the old tally finish within a few atomic adds
        loop {
            match Arc::try_unwrap(previous) {
                Ok(tally) => return tally.into_values(),
                Err(shared) => {
                    previous = shared;
                    thread::yield_now();
                }
            }
        }
    }

    fn check(&self, t0_nanos: u64, t1_nanos: u64, operation: &dyn Operation) -> Result<u64> {
        if t1_nanos < t0_nanos {
            return Err(Error::invalid_argument(format!(
                "operation ended ({t1_nanos}) before it started ({t0_nanos})"
            )));
        }
        let actual = operation.operation_type();
        if actual != self.operation_type {
            return Err(Error::invalid_argument(format!(
                "counter for {} cannot record {}",
                self.operation_type, actual
            )));
        }
        Ok(t1_nanos - t0_nanos)
    }
}
