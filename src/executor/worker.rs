use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use typed_builder::TypedBuilder;

use super::{CompletionLatch, ShutdownSignal};
use crate::clock;
use crate::{Error, KeyStore, LoadStrategy, Operation, Result, Sampler, Service};

/// Collaborators of a [`SingleThreadedRunner`].
///
/// Every field is optional so that a missing collaborator is reported by
/// [`SingleThreadedRunner::new`] instead of at compile time; `service`,
/// `load_strategy`, `sampler`, `completion` and `shutdown` are required.
#[derive(TypedBuilder, Default)]
#[builder(field_defaults(default, setter(strip_option)))]
pub struct RunnerDependencies {
    pub service: Option<Arc<dyn Service>>,
    pub load_strategy: Option<Arc<dyn LoadStrategy>>,
    pub sampler: Option<Sampler>,
    /// Receives the keys written by successful operations.
    pub key_store: Option<Arc<dyn KeyStore>>,
    pub completion: Option<CompletionLatch>,
    pub shutdown: Option<ShutdownSignal>,
    pub sleep_between_operations: Option<Duration>,
}

/// One worker: a blocking loop that pulls operations from the strategy and
/// performs them until the stream ends.
///
/// The loop reads the shared [`ShutdownSignal`] before every call to
/// [`LoadStrategy::next`]. When the strategy returns `None`:
/// - with the signal raised, the worker is done;
/// - otherwise the operation budget is spent: the worker raises the signal
///   itself and continues with the cleanup pass like every other worker.
///
/// Operation failures are recorded and never stop the loop. Errors of the
/// driver itself (`next`, `record`, the key store) end the loop and are
/// returned from [`run`](Self::run).
pub struct SingleThreadedRunner {
    service: Arc<dyn Service>,
    load_strategy: Arc<dyn LoadStrategy>,
    sampler: Sampler,
    key_store: Option<Arc<dyn KeyStore>>,
    completion: CompletionLatch,
    shutdown: ShutdownSignal,
    sleep_between_operations: Option<Duration>,
    invocations: Arc<AtomicU64>,
}

impl SingleThreadedRunner {
    pub fn new(dependencies: RunnerDependencies) -> Result<Self> {
        let RunnerDependencies {
            service,
            load_strategy,
            sampler,
            key_store,
            completion,
            shutdown,
            sleep_between_operations,
        } = dependencies;
        Ok(Self {
            service: service.ok_or_else(|| missing("service"))?,
            load_strategy: load_strategy.ok_or_else(|| missing("load strategy"))?,
            sampler: sampler.ok_or_else(|| missing("sampler"))?,
            key_store,
            completion: completion.ok_or_else(|| missing("completion latch"))?,
            shutdown: shutdown.ok_or_else(|| missing("shutdown signal"))?,
            sleep_between_operations,
            invocations: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Operations performed so far, cleanup operations included.
    pub fn invocation_count(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Live view of the invocation count, readable from other threads.
    pub fn invocation_counter(&self) -> Arc<AtomicU64> {
        self.invocations.clone()
    }

    /// Run the loop to completion on the calling thread. Arrives at the
    /// completion latch on every exit path.
    ///
    /// When the loop ends on a driver error, the worker still asks the
    /// strategy for its cleanup operations before returning that error.
    pub fn run(&mut self) -> Result<()> {
        let _arrival = self.completion.arrival();
        let mut last_operation: Option<Box<dyn Operation>> = None;
        let mut last_written_key: Option<String> = None;

        if let Err(e) = self.drive(&mut last_operation, &mut last_written_key) {
            tracing::error!("Worker aborted: {e}, running cleanup operations...");
            self.clean_up_after_failure(last_operation, last_written_key);
            return Err(e);
        }
        tracing::debug!("Worker finished after {} operation(s).", self.invocation_count());
        Ok(())
    }

    fn drive(
        &self,
        last_operation: &mut Option<Box<dyn Operation>>,
        last_written_key: &mut Option<String>,
    ) -> Result<()> {
        loop {
            let shutting_down = self.shutdown.is_triggered();
            let next = self.load_strategy.next(
                last_operation.as_deref(),
                last_written_key.as_deref(),
                shutting_down,
            )?;
            let Some(mut operation) = next else {
                if shutting_down {
                    return Ok(());
                }
                tracing::debug!("Operation stream exhausted, signaling shutdown...");
                self.shutdown.trigger();
                continue;
            };

            if let Some(key) = self.execute(operation.as_mut())? {
                *last_written_key = Some(key);
            }
            *last_operation = Some(operation);

            if let Some(pause) = self.sleep_between_operations
                && !self.shutdown.is_triggered()
            {
                self.shutdown.wait_timeout(pause);
            }
        }
    }

    // Best effort: stops at the end of the cleanup stream or at the next error.
    fn clean_up_after_failure(
        &self,
        mut last_operation: Option<Box<dyn Operation>>,
        mut last_written_key: Option<String>,
    ) {
        loop {
            let next = self.load_strategy.next(
                last_operation.as_deref(),
                last_written_key.as_deref(),
                true,
            );
            let mut operation = match next {
                Ok(Some(operation)) => operation,
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!("Cleanup after worker failure stopped: {e}");
                    return;
                }
            };
            match self.execute(operation.as_mut()) {
                Ok(Some(key)) => last_written_key = Some(key),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Cleanup after worker failure stopped: {e}");
                    return;
                }
            }
            last_operation = Some(operation);
        }
    }

    // Performs, times and records one operation. Returns the key it wrote.
    fn execute(&self, operation: &mut dyn Operation) -> Result<Option<String>> {
        let ts_ms = clock::wall_clock_ms();
        let t0 = clock::monotonic_nanos();
        let outcome = self.service.perform(operation);
        let t1 = clock::monotonic_nanos();
        self.invocations.fetch_add(1, Ordering::Relaxed);

        self.sampler
            .record(ts_ms, t0, t1, operation, outcome.as_ref().err())?;

        match outcome {
            Ok(()) => {
                let Some(key) = operation.written_key() else {
                    return Ok(None);
                };
                if let Some(store) = &self.key_store {
                    store.store(key)?;
                }
                Ok(Some(key.to_owned()))
            }
            Err(e) => {
                tracing::trace!("{} failed: {e}", operation.operation_type());
                Ok(None)
            }
        }
    }
}

fn missing(what: &str) -> Error {
    Error::invalid_argument(format!("a single threaded runner needs a {what}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicBool;

    use crate::{OperationError, OperationType};

    struct Reachable(AtomicBool);

    impl Service for Reachable {
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
    struct Write {
        key: String,
        fail: bool,
    }

    impl Operation for Write {
        fn perform(&mut self, _: &dyn Service) -> std::result::Result<(), OperationError> {
            if self.fail {
                return Err(OperationError::new("Rejected", "write rejected"));
            }
            Ok(())
        }

        fn written_key(&self) -> Option<&str> {
            (!self.fail).then_some(self.key.as_str())
        }
    }

    #[derive(Debug)]
    struct Close;

    impl Operation for Close {
        fn perform(&mut self, _: &dyn Service) -> std::result::Result<(), OperationError> {
            Ok(())
        }
    }

    /// Hands out `budget` writes, every third one failing, then one `Close`
    /// per shutdown pass. Remembers what `next` was told.
    struct Scripted {
        budget: Mutex<u64>,
        cleanups: Mutex<u64>,
        seen_keys: Mutex<Vec<Option<String>>>,
        shutdown_seen: AtomicBool,
        ordinary_after_shutdown: AtomicBool,
    }

    impl Scripted {
        fn new(budget: u64) -> Self {
            Self {
                budget: Mutex::new(budget),
                cleanups: Mutex::new(0),
                seen_keys: Mutex::new(Vec::new()),
                shutdown_seen: AtomicBool::new(false),
                ordinary_after_shutdown: AtomicBool::new(false),
            }
        }
    }

    impl LoadStrategy for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn next(
            &self,
            last_operation: Option<&dyn Operation>,
            last_written_key: Option<&str>,
            runtime_shutting_down: bool,
        ) -> Result<Option<Box<dyn Operation>>> {
            self.seen_keys
                .lock()
                .push(last_written_key.map(str::to_owned));
            if runtime_shutting_down {
                self.shutdown_seen.store(true, Ordering::Release);
                if last_operation.is_some_and(|op| op.is::<Close>()) {
                    return Ok(None);
                }
                *self.cleanups.lock() += 1;
                return Ok(Some(Box::new(Close)));
            }
            if self.shutdown_seen.load(Ordering::Acquire) {
                self.ordinary_after_shutdown.store(true, Ordering::Release);
            }
            let mut budget = self.budget.lock();
            if *budget == 0 {
                return Ok(None);
            }
            *budget -= 1;
            let n = *budget;
            Ok(Some(Box::new(Write {
                key: format!("key-{n}"),
                fail: n % 3 == 0,
            })))
        }

        fn operation_types(&self) -> Vec<OperationType> {
            vec![OperationType::of::<Write>(), OperationType::of::<Close>()]
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

    fn sampler_for(strategy: &dyn LoadStrategy) -> Sampler {
        let sampler = Sampler::new();
        sampler.set_intervals(60_000, 0).unwrap();
        for t in strategy.operation_types() {
            sampler.register_operation(t).unwrap();
        }
        sampler.start().unwrap();
        sampler
    }

    fn complete() -> RunnerDependencies {
        let strategy = Arc::new(Scripted::new(1));
        RunnerDependencies::builder()
            .service(Arc::new(Reachable(AtomicBool::new(true))) as Arc<dyn Service>)
            .sampler(sampler_for(strategy.as_ref()))
            .load_strategy(strategy as Arc<dyn LoadStrategy>)
            .completion(CompletionLatch::new(1))
            .shutdown(ShutdownSignal::new())
            .build()
    }

    #[test]
    fn every_required_collaborator_is_checked() {
        assert!(SingleThreadedRunner::new(complete()).is_ok());

        let cases: [(&str, fn(&mut RunnerDependencies)); 5] = [
            ("service", |d| d.service = None),
            ("load strategy", |d| d.load_strategy = None),
            ("sampler", |d| d.sampler = None),
            ("completion latch", |d| d.completion = None),
            ("shutdown signal", |d| d.shutdown = None),
        ];
        for (what, remove) in cases {
            let mut deps = complete();
            remove(&mut deps);
            match SingleThreadedRunner::new(deps) {
                Err(Error::InvalidArgument(msg)) => assert!(msg.contains(what), "{msg}"),
                Err(e) => panic!("unexpected error for missing {what}: {e}"),
                Ok(_) => panic!("missing {what} was accepted"),
            }
        }
    }

    #[cfg(feature = "builtins")]
    #[test]
    #[ntest::timeout(5000)]
    fn exhausted_stream_triggers_shutdown_and_cleanup() {
        let strategy = Arc::new(Scripted::new(6));
        let sampler = sampler_for(strategy.as_ref());
        let key_store = Arc::new(crate::InMemoryKeyStore::new());
        key_store.start().unwrap();
        let latch = CompletionLatch::new(1);
        let shutdown = ShutdownSignal::new();

        let mut runner = SingleThreadedRunner::new(
            RunnerDependencies::builder()
                .service(Arc::new(Reachable(AtomicBool::new(true))) as Arc<dyn Service>)
                .load_strategy(strategy.clone() as Arc<dyn LoadStrategy>)
                .sampler(sampler.clone())
                .key_store(key_store.clone() as Arc<dyn KeyStore>)
                .completion(latch.clone())
                .shutdown(shutdown.clone())
                .build(),
        )
        .unwrap();
        runner.run().unwrap();

        assert!(shutdown.is_triggered());
        assert_eq!(latch.remaining(), 0);
        assert_eq!(runner.invocation_count(), 7);
        assert_eq!(*strategy.cleanups.lock(), 1);
        assert!(!strategy.ordinary_after_shutdown.load(Ordering::Acquire));

        // keys 5,4,2,1 succeed; 3 and 0 fail
        assert_eq!(key_store.keys(), ["key-5", "key-4", "key-2", "key-1"]);
        let seen = strategy.seen_keys.lock();
        assert_eq!(seen[0], None);
        assert_eq!(seen[3].as_deref(), Some("key-4"));

        sampler.stop().unwrap();
    }

    #[test]
    #[ntest::timeout(5000)]
    fn raised_signal_only_yields_cleanup() {
        let strategy = Arc::new(Scripted::new(1_000));
        let sampler = sampler_for(strategy.as_ref());
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();

        let mut runner = SingleThreadedRunner::new(
            RunnerDependencies::builder()
                .service(Arc::new(Reachable(AtomicBool::new(true))) as Arc<dyn Service>)
                .load_strategy(strategy.clone() as Arc<dyn LoadStrategy>)
                .sampler(sampler.clone())
                .completion(CompletionLatch::new(1))
                .shutdown(shutdown)
                .build(),
        )
        .unwrap();
        runner.run().unwrap();

        assert_eq!(runner.invocation_count(), 1);
        assert_eq!(*strategy.budget.lock(), 1_000);
        let open = sampler.current_interval().unwrap();
        sampler.stop().unwrap();
        assert_eq!(open.total_count(), 0);
    }

    #[test]
    fn unregistered_operation_aborts_the_worker() {
        let strategy = Arc::new(Scripted::new(3));
        let sampler = Sampler::new();
        sampler.set_intervals(60_000, 0).unwrap();
        sampler
            .register_operation(OperationType::of::<Close>())
            .unwrap();
        sampler.start().unwrap();
        let latch = CompletionLatch::new(1);

        let mut runner = SingleThreadedRunner::new(
            RunnerDependencies::builder()
                .service(Arc::new(Reachable(AtomicBool::new(true))) as Arc<dyn Service>)
                .load_strategy(strategy.clone() as Arc<dyn LoadStrategy>)
                .sampler(sampler.clone())
                .completion(latch.clone())
                .shutdown(ShutdownSignal::new())
                .build(),
        )
        .unwrap();

        assert!(matches!(runner.run(), Err(Error::InvalidArgument(_))));
        assert_eq!(latch.remaining(), 0);
        // the failed write, then the cleanup pass
        assert_eq!(runner.invocation_count(), 2);
        assert_eq!(*strategy.cleanups.lock(), 1);
        sampler.stop().unwrap();
    }
}
