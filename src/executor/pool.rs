use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use typed_builder::TypedBuilder;

use super::worker::{RunnerDependencies, SingleThreadedRunner};
use super::{CompletionLatch, ShutdownSignal};
use crate::sampler::panic_message;
use crate::{Error, KeyStore, LoadStrategy, Result, Sampler, Service};

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// A fixed pool of OS worker threads sharing one service, one load strategy,
/// one sampler and one key store.
///
/// A run ends when the optional `duration` expires, when the strategy runs
/// out of operations, or on [`stop`](Self::stop). All three raise the same
/// [`ShutdownSignal`], after which every worker drains its cleanup
/// operations before exiting.
///
/// # Tuning knobs
/// - `thread_count`: number of workers. Default is `num_cpus::get()`.
/// - `duration`: wall-clock limit of a run. No limit by default.
/// - `sleep_between_operations`: pause of each worker between operations.
/// - `background`: when set, [`run`](Self::run) returns as soon as the
///   workers are launched; poll [`is_running`](Self::is_running) and call
///   [`stop`](Self::stop) to collect the outcome.
/// - `stop_timeout`: how long `stop` waits for the workers to drain.
#[derive(TypedBuilder)]
pub struct MultiThreadedRunner {
    service: Arc<dyn Service>,
    load_strategy: Arc<dyn LoadStrategy>,
    sampler: Sampler,
    #[builder(default)]
    key_store: Option<Arc<dyn KeyStore>>,
    #[builder(default = num_cpus::get())]
    thread_count: usize,
    #[builder(default)]
    duration: Option<Duration>,
    #[builder(default)]
    sleep_between_operations: Option<Duration>,
    #[builder(default)]
    background: bool,
    #[builder(default = DEFAULT_STOP_TIMEOUT)]
    stop_timeout: Duration,
    #[builder(default, setter(skip))]
    active: Mutex<Option<ActiveRun>>,
    #[builder(default, setter(skip))]
    invocations: Mutex<BTreeMap<String, Arc<AtomicU64>>>,
    #[builder(default, setter(skip))]
    elapsed: Mutex<Option<Duration>>,
}

struct ActiveRun {
    latch: CompletionLatch,
    shutdown: ShutdownSignal,
    workers: Vec<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    failures: Arc<Mutex<Vec<Error>>>,
    started_at: Instant,
}

impl MultiThreadedRunner {
    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Launch the workers. In the foreground this blocks until every worker
    /// finished and returns the first worker failure, if any.
    pub fn run(&self) -> Result<()> {
        let latch = {
            let mut active = self.active.lock();
            if active.is_some() {
                return Err(Error::illegal_state("runner is already running"));
            }
            let run = self.launch()?;
            let latch = run.latch.clone();
            *active = Some(run);
            latch
        };
        if self.background {
            return Ok(());
        }
        latch.wait();
        // A concurrent stop() may already have collected the run.
        match self.active.lock().take() {
            Some(run) => self.finish(run),
            None => Ok(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|run| run.latch.remaining() > 0)
    }

    /// Raise the shutdown signal and wait, at most `stop_timeout`, for every
    /// worker to finish its cleanup pass. A no-op when nothing runs.
    pub fn stop(&self) -> Result<()> {
        let (latch, shutdown) = match &*self.active.lock() {
            Some(run) => (run.latch.clone(), run.shutdown.clone()),
            None => return Ok(()),
        };
        if shutdown.trigger() {
            tracing::info!("Stop requested, signaling shutdown...");
        }
        if !latch.wait_for(self.stop_timeout) {
            return Err(Error::Timeout(format!(
                "{} worker(s) still running after {:?}",
                latch.remaining(),
                self.stop_timeout
            )));
        }
        match self.active.lock().take() {
            Some(run) => self.finish(run),
            None => Ok(()),
        }
    }

    /// Operations performed per worker thread, keyed by thread name.
    pub fn per_thread_invocation_counts(&self) -> BTreeMap<String, u64> {
        self.invocations
            .lock()
            .iter()
            .map(|(name, count)| (name.clone(), count.load(Ordering::Relaxed)))
            .collect()
    }

    /// Wall time of the current run, or of the last completed one.
    pub fn elapsed(&self) -> Option<Duration> {
        if let Some(run) = &*self.active.lock() {
            return Some(run.started_at.elapsed());
        }
        *self.elapsed.lock()
    }

    fn launch(&self) -> Result<ActiveRun> {
        if self.thread_count == 0 {
            return Err(Error::invalid_argument("thread count must be positive"));
        }
        let latch = CompletionLatch::new(self.thread_count);
        let shutdown = ShutdownSignal::new();
        let failures = Arc::new(Mutex::new(Vec::new()));
        let mut invocations = self.invocations.lock();
        invocations.clear();

        let runners = (0..self.thread_count)
            .map(|_| SingleThreadedRunner::new(self.dependencies(&latch, &shutdown)))
            .collect::<Result<Vec<_>>>()?;

        tracing::info!("Spawning {} workers...", self.thread_count);
        let started_at = Instant::now();
        let mut workers = Vec::with_capacity(self.thread_count);
        for (i, mut runner) in runners.into_iter().enumerate() {
            let name = format!("worker-{i}");
            invocations.insert(name.clone(), runner.invocation_counter());

            let signal = shutdown.clone();
            let failed = failures.clone();
            let spawned = thread::Builder::new().name(name).spawn(move || {
                if let Err(e) = runner.run() {
                    tracing::error!("Worker failed: {e}");
                    signal.trigger();
                    failed.lock().push(e);
                }
            });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    tracing::error!("Failed to spawn worker {i}: {e}");
                    shutdown.trigger();
                    // this worker and the remaining ones never ran
                    for _ in i..self.thread_count {
                        latch.arrive();
                    }
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(e.into());
                }
            }
        }

        let timer = match self.duration.map(|d| spawn_duration_timer(shutdown.clone(), d)) {
            Some(Ok(handle)) => Some(handle),
            Some(Err(e)) => {
                shutdown.trigger();
                for handle in workers {
                    let _ = handle.join();
                }
                return Err(e);
            }
            None => None,
        };
        Ok(ActiveRun {
            latch,
            shutdown,
            workers,
            timer,
            failures,
            started_at,
        })
    }

    fn dependencies(&self, latch: &CompletionLatch, shutdown: &ShutdownSignal) -> RunnerDependencies {
        RunnerDependencies {
            service: Some(self.service.clone()),
            load_strategy: Some(self.load_strategy.clone()),
            sampler: Some(self.sampler.clone()),
            key_store: self.key_store.clone(),
            completion: Some(latch.clone()),
            shutdown: Some(shutdown.clone()),
            sleep_between_operations: self.sleep_between_operations,
        }
    }

    fn finish(&self, run: ActiveRun) -> Result<()> {
        // releases the duration timer
        run.shutdown.trigger();
        let mut panics = Vec::new();
        for handle in run.workers {
            if let Err(payload) = handle.join() {
                panics.push(Error::Worker(format!(
                    "worker panicked: {}",
                    panic_message(payload)
                )));
            }
        }
        if let Some(timer) = run.timer
            && timer.join().is_err()
        {
            tracing::warn!("Duration timer panicked");
        }
        let mut failures = std::mem::take(&mut *run.failures.lock());
        failures.append(&mut panics);

        let elapsed = run.started_at.elapsed();
        *self.elapsed.lock() = Some(elapsed);
        let total: u64 = self.per_thread_invocation_counts().values().sum();
        tracing::info!("Workers done: {total} operation(s) in {elapsed:?}");

        let mut failures = failures.into_iter();
        match failures.next() {
            None => Ok(()),
            Some(first) => {
                for other in failures {
                    tracing::error!("Additional worker failure: {other}");
                }
                Err(first)
            }
        }
    }
}

fn spawn_duration_timer(shutdown: ShutdownSignal, duration: Duration) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("run-duration".into())
        .spawn(move || {
            if !shutdown.wait_timeout(duration) {
                tracing::info!("Run duration of {duration:?} elapsed, signaling shutdown...");
                shutdown.trigger();
            }
        })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    use crate::{Operation, OperationBudget, OperationError, OperationType};

    #[derive(Default)]
    struct Nothing(AtomicBool);

    impl Service for Nothing {
        fn start(&self) -> Result<()> {
            self.0.store(true, Ordering::Release);
            Ok(())
        }
        fn stop(&self) -> Result<()> {
            self.0.store(false, Ordering::Release);
            Ok(())
        }
        fn is_started(&self) -> bool {
            self.0.load(Ordering::Acquire)
        }
    }

    #[derive(Debug)]
    struct Tick;

    impl Operation for Tick {
        fn perform(&mut self, _: &dyn Service) -> std::result::Result<(), OperationError> {
            thread::sleep(Duration::from_millis(1));
            Ok(())
        }
    }

    #[derive(Debug)]
    struct Release;

    impl Operation for Release {
        fn perform(&mut self, _: &dyn Service) -> std::result::Result<(), OperationError> {
            Ok(())
        }
    }

    /// Ticks until the budget is spent, then one release per worker.
    struct Ticking {
        budget: OperationBudget,
        releases: AtomicU64,
        ticks_after_release: AtomicU64,
    }

    impl Ticking {
        fn new(limit: Option<u64>) -> Self {
            Self {
                budget: OperationBudget::new(limit),
                releases: AtomicU64::new(0),
                ticks_after_release: AtomicU64::new(0),
            }
        }
    }

    impl LoadStrategy for Ticking {
        fn name(&self) -> &str {
            "ticking"
        }

        fn next(
            &self,
            last_operation: Option<&dyn Operation>,
            _: Option<&str>,
            runtime_shutting_down: bool,
        ) -> Result<Option<Box<dyn Operation>>> {
            let released = last_operation.is_some_and(|op| op.is::<Release>());
            if runtime_shutting_down {
                if released {
                    return Ok(None);
                }
                self.releases.fetch_add(1, Ordering::AcqRel);
                return Ok(Some(Box::new(Release)));
            }
            if released {
                self.ticks_after_release.fetch_add(1, Ordering::AcqRel);
            }
            if self.budget.try_acquire() {
                Ok(Some(Box::new(Tick)))
            } else {
                Ok(None)
            }
        }

        fn operation_types(&self) -> Vec<OperationType> {
            vec![OperationType::of::<Tick>(), OperationType::of::<Release>()]
        }

        fn start(&self) -> Result<()> {
            Ok(())
        }
        fn stop(&self) -> Result<()> {
            Ok(())
        }
        fn is_started(&self) -> bool {
            true
        }
    }

    fn started_sampler(strategy: &dyn LoadStrategy) -> Sampler {
        let sampler = Sampler::new();
        sampler.set_intervals(100, 0).unwrap();
        for t in strategy.operation_types() {
            sampler.register_operation(t).unwrap();
        }
        sampler.start().unwrap();
        sampler
    }

    #[test]
    #[ntest::timeout(10000)]
    fn duration_limit_stops_every_worker() {
        let strategy = Arc::new(Ticking::new(None));
        let sampler = started_sampler(strategy.as_ref());
        let runner = MultiThreadedRunner::builder()
            .service(Arc::new(Nothing::default()) as Arc<dyn Service>)
            .load_strategy(strategy.clone() as Arc<dyn LoadStrategy>)
            .sampler(sampler.clone())
            .thread_count(10)
            .duration(Some(Duration::from_millis(500)))
            .build();

        runner.run().unwrap();

        let counts = runner.per_thread_invocation_counts();
        assert_eq!(counts.len(), 10);
        assert!(counts.values().all(|&n| n > 0), "{counts:?}");
        assert!(runner.elapsed().unwrap() >= Duration::from_millis(500));
        assert_eq!(strategy.releases.load(Ordering::Acquire), 10);
        assert_eq!(strategy.ticks_after_release.load(Ordering::Acquire), 0);
        assert!(!runner.is_running());
        sampler.stop().unwrap();
    }

    #[test]
    #[ntest::timeout(10000)]
    fn operation_count_is_shared_by_all_workers() {
        let strategy = Arc::new(Ticking::new(Some(200)));
        let sampler = started_sampler(strategy.as_ref());
        let runner = MultiThreadedRunner::builder()
            .service(Arc::new(Nothing::default()) as Arc<dyn Service>)
            .load_strategy(strategy.clone() as Arc<dyn LoadStrategy>)
            .sampler(sampler.clone())
            .thread_count(4)
            .build();

        runner.run().unwrap();

        let total: u64 = runner.per_thread_invocation_counts().values().sum();
        // 200 ticks plus one release per worker
        assert_eq!(total, 204);
        assert!(strategy.budget.is_exhausted());
        sampler.stop().unwrap();
    }

    #[test]
    #[ntest::timeout(10000)]
    fn background_run_is_stopped_explicitly() {
        let strategy = Arc::new(Ticking::new(None));
        let sampler = started_sampler(strategy.as_ref());
        let runner = MultiThreadedRunner::builder()
            .service(Arc::new(Nothing::default()) as Arc<dyn Service>)
            .load_strategy(strategy.clone() as Arc<dyn LoadStrategy>)
            .sampler(sampler.clone())
            .thread_count(3)
            .sleep_between_operations(Some(Duration::from_millis(5)))
            .background(true)
            .build();

        runner.run().unwrap();
        assert!(runner.is_running());
        assert!(matches!(runner.run(), Err(Error::IllegalState(_))));
        thread::sleep(Duration::from_millis(50));

        runner.stop().unwrap();
        assert!(!runner.is_running());
        assert_eq!(strategy.releases.load(Ordering::Acquire), 3);
        runner.stop().unwrap();
        assert_eq!(strategy.releases.load(Ordering::Acquire), 3);
        sampler.stop().unwrap();
    }

    #[test]
    fn stop_before_run_is_a_noop() {
        let strategy = Arc::new(Ticking::new(Some(0)));
        let runner = MultiThreadedRunner::builder()
            .service(Arc::new(Nothing::default()) as Arc<dyn Service>)
            .sampler(started_sampler(strategy.as_ref()))
            .load_strategy(strategy as Arc<dyn LoadStrategy>)
            .build();
        runner.stop().unwrap();
        assert!(!runner.is_running());
        assert_eq!(runner.elapsed(), None);
    }

    #[test]
    fn zero_threads_is_rejected() {
        let strategy = Arc::new(Ticking::new(Some(1)));
        let runner = MultiThreadedRunner::builder()
            .service(Arc::new(Nothing::default()) as Arc<dyn Service>)
            .sampler(started_sampler(strategy.as_ref()))
            .load_strategy(strategy as Arc<dyn LoadStrategy>)
            .thread_count(0)
            .build();
        assert!(matches!(runner.run(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    #[ntest::timeout(10000)]
    fn worker_failure_is_reported_and_stops_the_pool() {
        let strategy = Arc::new(Ticking::new(None));
        let sampler = Sampler::new();
        sampler.set_intervals(100, 0).unwrap();
        // Release is not registered: the cleanup pass fails to record
        sampler
            .register_operation(OperationType::of::<Tick>())
            .unwrap();
        sampler.start().unwrap();
        let runner = MultiThreadedRunner::builder()
            .service(Arc::new(Nothing::default()) as Arc<dyn Service>)
            .load_strategy(strategy as Arc<dyn LoadStrategy>)
            .sampler(sampler.clone())
            .thread_count(2)
            .duration(Some(Duration::from_millis(50)))
            .build();

        assert!(matches!(runner.run(), Err(Error::InvalidArgument(_))));
        assert!(!runner.is_running());
        sampler.stop().unwrap();
    }
}
