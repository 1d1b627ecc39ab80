//! Sampler: interval-based aggregation of operation statistics.
//!
//! The sampler sits between the worker threads and the sampling consumers:
//!
//! - Workers call [`Sampler::record`] on every completed operation. The call
//!   only touches the per-type [`Counter`], never the open interval, so the
//!   hot path does not contend with rotation.
//! - A rotation step ([`Sampler::run`]) periodically drains every counter
//!   into the open [`SamplingInterval`]. Once the wall clock passes the end
//!   of that interval it is closed, handed to every [`SamplingConsumer`] and
//!   replaced by its successor. If several boundaries elapsed since the last
//!   rotation, every elapsed interval is emitted, in order; the ones without
//!   activity carry zero counters.
//! - [`Sampler::stop`] performs one last rotation that closes the open
//!   interval regardless of how far it got, then stops every consumer.
//!
//! # Lifecycle
//!
//! `stopped -> started -> stopped`. Operation types and intervals are
//! configured while stopped; `start` and `stop` are idempotent.
//!
//! # Timing knobs
//! - `sampling_interval_ms`: width of every interval (default 1000ms).
//! - `sampling_task_run_interval_ms`: period of the background rotation
//!   thread (default 250ms). Must be smaller than the interval width. `0`
//!   disables the thread; rotation then only happens through explicit
//!   [`Sampler::run`] calls, which keeps tests deterministic.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};

use crate::clock;
use crate::{
    Counter, Error, Metric, MetricType, Operation, OperationError, OperationType, Result,
    SamplingConsumer, SamplingInterval,
};

pub const DEFAULT_SAMPLING_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_SAMPLING_TASK_RUN_INTERVAL_MS: u64 = 250;

// Lower bound of the wait for the rotation lock in `stop`.
const MIN_STOP_WAIT: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug)]
struct Settings {
    sampling_interval_ms: u64,
    sampling_task_run_interval_ms: u64,
}

struct RotationTimer {
    stop: Sender<()>,
    // Disconnected once the rotation thread has returned.
    done: Receiver<()>,
    handle: JoinHandle<()>,
}

struct Inner {
    settings: Mutex<Settings>,
    started: AtomicBool,
    counters: RwLock<HashMap<OperationType, Counter>>,
    consumers: RwLock<Vec<Arc<dyn SamplingConsumer>>>,
    metrics: RwLock<Vec<Box<dyn Metric>>>,
    annotations: Mutex<Vec<String>>,
    // The open interval. Holding this lock is what "rotating" means.
    current: Mutex<Option<SamplingInterval>>,
    // Serializes start/stop and owns the rotation thread.
    lifecycle: Mutex<Option<RotationTimer>>,
}

/// Thread-safe statistics aggregator. Cloning is cheap and every clone
/// refers to the same sampler.
#[derive(Clone)]
pub struct Sampler {
    inner: Arc<Inner>,
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                settings: Mutex::new(Settings {
                    sampling_interval_ms: DEFAULT_SAMPLING_INTERVAL_MS,
                    sampling_task_run_interval_ms: DEFAULT_SAMPLING_TASK_RUN_INTERVAL_MS,
                }),
                started: AtomicBool::new(false),
                counters: RwLock::new(HashMap::new()),
                consumers: RwLock::new(Vec::new()),
                metrics: RwLock::new(Vec::new()),
                annotations: Mutex::new(Vec::new()),
                current: Mutex::new(None),
                lifecycle: Mutex::new(None),
            }),
        }
    }

    pub fn sampling_interval_ms(&self) -> u64 {
        self.inner.settings.lock().sampling_interval_ms
    }

    pub fn sampling_task_run_interval_ms(&self) -> u64 {
        self.inner.settings.lock().sampling_task_run_interval_ms
    }

    /// Set the interval width. Fails once started, if `ms` is zero, or if the
    /// configured run interval would no longer be smaller.
    pub fn set_sampling_interval_ms(&self, ms: u64) -> Result<()> {
        let run = self.sampling_task_run_interval_ms();
        self.set_intervals(ms, run)
    }

    /// Set the rotation period. `0` disables the background rotation thread.
    pub fn set_sampling_task_run_interval_ms(&self, ms: u64) -> Result<()> {
        let sampling = self.sampling_interval_ms();
        self.set_intervals(sampling, ms)
    }

    /// Set both intervals in one step.
    pub fn set_intervals(&self, sampling_interval_ms: u64, run_interval_ms: u64) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock();
        self.ensure_stopped("intervals")?;
        if sampling_interval_ms == 0 {
            return Err(Error::invalid_argument("sampling interval must be positive"));
        }
        if run_interval_ms >= sampling_interval_ms {
            return Err(Error::invalid_argument(format!(
                "sampling task run interval ({run_interval_ms}ms) must be smaller than the sampling interval ({sampling_interval_ms}ms)"
            )));
        }
        *self.inner.settings.lock() = Settings {
            sampling_interval_ms,
            sampling_task_run_interval_ms: run_interval_ms,
        };
        Ok(())
    }

    /// Create a counter for `operation_type`. Returns `false` if it was
    /// already registered. Fails once started.
    pub fn register_operation(&self, operation_type: OperationType) -> Result<bool> {
        let _lifecycle = self.inner.lifecycle.lock();
        self.ensure_stopped("operations")?;
        let mut counters = self.inner.counters.write();
        if counters.contains_key(&operation_type) {
            return Ok(false);
        }
        counters.insert(operation_type, Counter::new(operation_type));
        Ok(true)
    }

    pub fn operation_types(&self) -> Vec<OperationType> {
        let mut types: Vec<_> = self.inner.counters.read().keys().copied().collect();
        types.sort();
        types
    }

    /// Register a system metric read at every rotation. Returns `false` if a
    /// metric of the same type is already registered.
    pub fn register_metric(&self, metric: Box<dyn Metric>) -> bool {
        let mut metrics = self.inner.metrics.write();
        let metric_type = metric.metric_type();
        if metrics.iter().any(|m| m.metric_type() == metric_type) {
            return false;
        }
        metrics.push(metric);
        true
    }

    pub fn metric_types(&self) -> Vec<MetricType> {
        self.inner
            .metrics
            .read()
            .iter()
            .map(|m| m.metric_type())
            .collect()
    }

    /// Returns `false` if this very consumer is already registered.
    pub fn register_consumer(&self, consumer: Arc<dyn SamplingConsumer>) -> bool {
        let mut consumers = self.inner.consumers.write();
        let ptr = Arc::as_ptr(&consumer) as *const ();
        if consumers.iter().any(|c| Arc::as_ptr(c) as *const () == ptr) {
            return false;
        }
        consumers.push(consumer);
        true
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.consumers.read().len()
    }

    /// Queue an annotation for the interval open at the next rotation.
    pub fn annotate(&self, annotation: impl Into<String>) {
        self.inner.annotations.lock().push(annotation.into());
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// A copy of the open interval, `None` while stopped.
    pub fn current_interval(&self) -> Option<SamplingInterval> {
        self.inner.current.lock().clone()
    }

    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock();
        if self.is_started() {
            return Ok(());
        }
        let types = self.operation_types();
        if types.is_empty() {
            return Err(Error::illegal_state(
                "no operation types registered with the sampler",
            ));
        }
        let settings = *self.inner.settings.lock();

        // Anything recorded before a previous stop has already been emitted.
        for counter in self.inner.counters.read().values() {
            counter.snapshot_and_reset();
        }
        let now = clock::wall_clock_ms();
        let start = clock::align_down(now, settings.sampling_interval_ms);
        *self.inner.current.lock() = Some(SamplingInterval::new(
            start,
            settings.sampling_interval_ms,
            &types,
        )?);
        self.inner.started.store(true, Ordering::Release);

        if settings.sampling_task_run_interval_ms > 0 {
            let period = Duration::from_millis(settings.sampling_task_run_interval_ms);
            match self.spawn_rotation_timer(period) {
                Ok(timer) => *lifecycle = Some(timer),
                Err(e) => {
                    self.inner.started.store(false, Ordering::Release);
                    *self.inner.current.lock() = None;
                    return Err(e);
                }
            }
        }
        tracing::info!(
            "Sampler started: interval={}ms, run interval={}ms, {} operation type(s), first interval at {start}",
            settings.sampling_interval_ms,
            settings.sampling_task_run_interval_ms,
            types.len()
        );
        Ok(())
    }

    /// Record one completed operation. `t0_nanos`/`t1_nanos` come from
    /// [`clock::monotonic_nanos`]; `ts_ms` is the wall-clock start time.
    ///
    /// Fails if the sampler is not started or the operation type was never
    /// registered.
    pub fn record(
        &self,
        ts_ms: u64,
        t0_nanos: u64,
        t1_nanos: u64,
        operation: &dyn Operation,
        failure: Option<&OperationError>,
    ) -> Result<()> {
        if !self.is_started() {
            return Err(Error::illegal_state("sampler not started"));
        }
        let operation_type = operation.operation_type();
        let counters = self.inner.counters.read();
        let counter = counters.get(&operation_type).ok_or_else(|| {
            Error::invalid_argument(format!("operation type {operation_type} not registered"))
        })?;
        tracing::trace!(ts_ms, operation = %operation_type, failed = failure.is_some(), "record");
        match failure {
            None => counter.update(t0_nanos, t1_nanos, operation),
            Some(e) => counter.update_failure(t0_nanos, t1_nanos, operation, e.failure_type()),
        }
    }

    /// One rotation step against the current wall-clock time.
    pub fn run(&self) -> Result<()> {
        self.run_at(clock::wall_clock_ms())
    }

    /// One rotation step as if the wall clock read `now_ms`.
    pub fn run_at(&self, now_ms: u64) -> Result<()> {
        let mut current = self.inner.current.lock();
        self.inner.rotate(&mut current, now_ms, false)
    }

    /// Flush and emit the open interval, stop every consumer, then stop.
    ///
    /// Waits at most one sampling interval for an in-flight rotation. Every
    /// consumer is stopped even if flushing or other consumers fail; all
    /// failures are returned together.
    pub fn stop(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock();
        if !self.is_started() {
            return Ok(());
        }
        let mut failures = Vec::new();
        let wait = Duration::from_millis(self.sampling_interval_ms()).max(MIN_STOP_WAIT);
        let deadline = Instant::now() + wait;
        if let Some(timer) = lifecycle.take() {
            drop(timer.stop);
            match timer.done.recv_deadline(deadline) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if timer.handle.join().is_err() {
                        tracing::warn!("Sampler rotation thread panicked");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    tracing::error!("Sampler rotation thread still busy after {wait:?}, detaching it");
                    failures.push(Error::Timeout(format!(
                        "sampler rotation thread did not finish within {wait:?}"
                    )));
                }
            }
        }

        match self.inner.current.try_lock_until(deadline) {
            Some(mut current) => {
                if let Err(e) = self.inner.rotate(&mut current, clock::wall_clock_ms(), true) {
                    tracing::error!("Final sampler flush failed: {e}");
                    failures.push(e);
                }
                *current = None;
            }
            None => {
                tracing::error!("Sampler lock not released within {wait:?}, final interval lost");
                failures.push(Error::Timeout(format!(
                    "sampler lock not acquired within {wait:?}"
                )));
            }
        }
        self.inner.started.store(false, Ordering::Release);

        for consumer in self.inner.consumers.read().iter() {
            let res = catch_unwind(AssertUnwindSafe(|| consumer.stop()))
                .unwrap_or_else(|p| Err(Error::Consumer(panic_message(p))));
            if let Err(e) = res {
                tracing::error!("Sampling consumer failed to stop: {e}");
                failures.push(e);
            }
        }
        tracing::info!("Sampler stopped");
        Error::from_stop_failures(failures)
    }

    fn ensure_stopped(&self, what: &str) -> Result<()> {
        if self.is_started() {
            return Err(Error::illegal_state(format!(
                "cannot configure {what} on a started sampler"
            )));
        }
        Ok(())
    }

    fn spawn_rotation_timer(&self, period: Duration) -> Result<RotationTimer> {
        let (stop, stopped) = channel::bounded::<()>(0);
        let (done_tx, done) = channel::bounded::<()>(1);
        let ticker = channel::tick(period);
        let sampler = self.clone();
        let handle = thread::Builder::new()
            .name("sampler-rotation".into())
            .spawn(move || {
                let _done = done_tx;
                tracing::debug!("Sampler rotation thread started.");
                loop {
                    crossbeam::select! {
                        recv(ticker) -> _ => {
                            // a pending stop wins over a ready tick
                            if !matches!(stopped.try_recv(), Err(TryRecvError::Empty)) {
                                break;
                            }
                            let res = catch_unwind(AssertUnwindSafe(|| sampler.run()));
                            match res {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => tracing::warn!("Sampler rotation failed: {e}"),
                                Err(p) => tracing::error!("Sampler rotation panicked: {}", panic_message(p)),
                            }
                        }
                        recv(stopped) -> _ => break,
                    }
                }
                tracing::debug!("Sampler rotation thread shutting down.");
            })?;
        Ok(RotationTimer { stop, done, handle })
    }
}

impl Inner {
    /// Drain counters into the open interval and emit every interval that
    /// ended at or before `now_ms`. With `closing`, the open interval is
    /// emitted as well.
    fn rotate(
        &self,
        current: &mut Option<SamplingInterval>,
        now_ms: u64,
        closing: bool,
    ) -> Result<()> {
        let Some(open) = current.as_mut() else {
            return Err(Error::illegal_state("sampler not started"));
        };

        for (operation_type, counter) in self.counters.read().iter() {
            let values = counter.snapshot_and_reset();
            if !values.is_empty() {
                open.increment_counter_values(*operation_type, &values)?;
            }
        }
        for annotation in self.annotations.lock().drain(..) {
            open.add_annotation(annotation);
        }

        let mut closed = Vec::new();
        while open.end_ms() <= now_ms {
            let next = open.successor();
            closed.push(std::mem::replace(open, next));
        }
        if closing {
            let next = open.successor();
            closed.push(std::mem::replace(open, next));
        }
        if closed.is_empty() {
            return Ok(());
        }

        for (metric_type, value) in self.read_metrics() {
            for interval in &mut closed {
                interval.set_metric(metric_type.clone(), value);
            }
        }
        tracing::debug!(
            "Emitting {} sampling interval(s) starting at {}",
            closed.len(),
            closed[0].start_ms()
        );
        self.deliver(&closed)
    }

    // A panicking metric is logged and skipped like a failing one.
    fn read_metrics(&self) -> Vec<(MetricType, f64)> {
        self.metrics
            .read()
            .iter()
            .filter_map(|m| {
                let metric_type = m.metric_type();
                match catch_unwind(AssertUnwindSafe(|| m.value())) {
                    Ok(Ok(v)) => Some((metric_type, v)),
                    Ok(Err(e)) => {
                        tracing::warn!("Metric {metric_type} could not be read: {e}");
                        None
                    }
                    Err(p) => {
                        tracing::warn!("Metric {metric_type} panicked: {}", panic_message(p));
                        None
                    }
                }
            })
            .collect()
    }

    // Every consumer sees the intervals even if an earlier one fails; the
    // first failure is returned.
    fn deliver(&self, intervals: &[SamplingInterval]) -> Result<()> {
        let mut first_failure = None;
        for consumer in self.consumers.read().iter() {
            let res = catch_unwind(AssertUnwindSafe(|| consumer.consume(intervals)))
                .unwrap_or_else(|p| Err(Error::Consumer(panic_message(p))));
            if let Err(e) = res {
                tracing::warn!("Sampling consumer failed: {e}");
                first_failure.get_or_insert(e);
            }
        }
        first_failure.map_or(Ok(()), Err)
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_owned()
    }
}
