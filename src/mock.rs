//! In-process service and load strategy, for dry runs and tests.
//!
//! [`MockService`] counts what is performed against it; [`MockLoadStrategy`]
//! produces [`MockOperation`]s from a shared budget and, on shutdown, one
//! [`MockCleanupOperation`] per worker.
//!
//! Service properties:
//! - `fail_stop` (bool): `stop` reports an error after stopping.
//!
//! Load strategy properties:
//! - `failure_every` (n): every n-th operation fails with `MockFailure`.
//! - `latency_ms` (ms): time each operation spends in `perform`.
//! - `cleanup` (bool, default true): issue cleanup operations on shutdown.
//! - `fail_stop` (bool): `stop` reports an error after stopping.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crate::config::{LoadConfiguration, ServiceConfiguration};
use crate::{
    Error, InMemoryKeyStore, KeyStore, LoadStrategy, Operation, OperationBudget, OperationError,
    OperationType, Result, Service,
};

/// Failure type of injected operation failures.
pub const MOCK_FAILURE: &str = "MockFailure";

#[derive(Debug, Default)]
struct Lifecycle {
    started: AtomicBool,
    starts: AtomicU64,
    stops: AtomicU64,
}

impl Lifecycle {
    fn start(&self) -> bool {
        let first = !self.started.swap(true, Ordering::AcqRel);
        if first {
            self.starts.fetch_add(1, Ordering::AcqRel);
        }
        first
    }

    fn stop(&self) -> bool {
        let was_started = self.started.swap(false, Ordering::AcqRel);
        if was_started {
            self.stops.fetch_add(1, Ordering::AcqRel);
        }
        was_started
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
pub struct MockService {
    lifecycle: Lifecycle,
    fail_stop: bool,
    performed: AtomicU64,
    cleanups: AtomicU64,
}

impl MockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// A service whose `stop` fails after stopping.
    pub fn failing_stop() -> Self {
        Self {
            fail_stop: true,
            ..Self::default()
        }
    }

    pub fn from_configuration(configuration: &ServiceConfiguration) -> Result<Self> {
        Ok(Self {
            fail_stop: configuration
                .properties
                .get_bool("fail_stop")?
                .unwrap_or(false),
            ..Self::default()
        })
    }

    /// Times `start` actually started the service.
    pub fn start_count(&self) -> u64 {
        self.lifecycle.starts.load(Ordering::Acquire)
    }

    pub fn stop_count(&self) -> u64 {
        self.lifecycle.stops.load(Ordering::Acquire)
    }

    /// Mock operations performed against this service, failed ones included.
    pub fn performed(&self) -> u64 {
        self.performed.load(Ordering::Acquire)
    }

    pub fn cleanups(&self) -> u64 {
        self.cleanups.load(Ordering::Acquire)
    }
}

impl Service for MockService {
    fn start(&self) -> Result<()> {
        if self.lifecycle.start() {
            tracing::debug!("Mock service started.");
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if self.lifecycle.stop() {
            tracing::debug!("Mock service stopped.");
        }
        if self.fail_stop {
            return Err(Error::Service("mock service configured to fail on stop".into()));
        }
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.lifecycle.is_started()
    }
}

fn mock_service(service: &dyn Service) -> std::result::Result<&MockService, OperationError> {
    let mock = service
        .downcast_ref::<MockService>()
        .ok_or_else(|| OperationError::new("WrongService", "not a mock service"))?;
    if !mock.is_started() {
        return Err(OperationError::new("ServiceNotStarted", "mock service is not started"));
    }
    Ok(mock)
}

#[derive(Debug)]
pub struct MockOperation {
    id: u64,
    key: String,
    latency: Option<Duration>,
    fail: bool,
}

impl MockOperation {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            key: format!("mock-{id}"),
            latency: None,
            fail: false,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Operation for MockOperation {
    fn perform(&mut self, service: &dyn Service) -> std::result::Result<(), OperationError> {
        let mock = mock_service(service)?;
        if let Some(latency) = self.latency {
            thread::sleep(latency);
        }
        mock.performed.fetch_add(1, Ordering::AcqRel);
        if self.fail {
            return Err(OperationError::new(
                MOCK_FAILURE,
                format!("operation {} failed on purpose", self.id),
            ));
        }
        Ok(())
    }

    fn key(&self) -> Option<&str> {
        Some(&self.key)
    }

    fn written_key(&self) -> Option<&str> {
        Some(&self.key)
    }
}

/// Releases whatever a worker held; issued once per worker on shutdown.
#[derive(Debug, Default)]
pub struct MockCleanupOperation;

impl Operation for MockCleanupOperation {
    fn perform(&mut self, service: &dyn Service) -> std::result::Result<(), OperationError> {
        mock_service(service)?.cleanups.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

pub struct MockLoadStrategy {
    lifecycle: Lifecycle,
    budget: OperationBudget,
    next_id: AtomicU64,
    failure_every: Option<u64>,
    latency: Option<Duration>,
    cleanup: bool,
    fail_stop: bool,
    key_store: Option<Arc<dyn KeyStore>>,
}

impl MockLoadStrategy {
    pub const NAME: &'static str = "mock";

    /// A strategy producing at most `operation_count` operations.
    pub fn new(operation_count: Option<u64>) -> Self {
        Self {
            lifecycle: Lifecycle::default(),
            budget: OperationBudget::new(operation_count),
            next_id: AtomicU64::new(0),
            failure_every: None,
            latency: None,
            cleanup: true,
            fail_stop: false,
            key_store: None,
        }
    }

    pub fn from_configuration(configuration: &LoadConfiguration) -> Result<Self> {
        let properties = &configuration.properties;
        let failure_every = properties.get_u64("failure_every")?;
        if failure_every == Some(0) {
            return Err(Error::config("failure_every must be positive"));
        }
        let mut strategy = Self::new(configuration.operation_count);
        strategy.failure_every = failure_every;
        strategy.latency = properties.get_u64("latency_ms")?.map(Duration::from_millis);
        strategy.cleanup = properties.get_bool("cleanup")?.unwrap_or(true);
        strategy.fail_stop = properties.get_bool("fail_stop")?.unwrap_or(false);
        if let Some(keys) = configuration.key_count.filter(|k| *k > 0) {
            let capacity = usize::try_from(keys)
                .map_err(|_| Error::config(format!("key_count {keys} is too large")))?;
            strategy.key_store = Some(Arc::new(InMemoryKeyStore::with_capacity(capacity)));
        }
        Ok(strategy)
    }

    pub fn with_failure_every(mut self, n: u64) -> Self {
        self.failure_every = Some(n.max(1));
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_key_store(mut self, key_store: Arc<dyn KeyStore>) -> Self {
        self.key_store = Some(key_store);
        self
    }

    pub fn without_cleanup(mut self) -> Self {
        self.cleanup = false;
        self
    }

    pub fn failing_stop(mut self) -> Self {
        self.fail_stop = true;
        self
    }

    /// Operations handed out so far, cleanup operations excluded.
    pub fn issued(&self) -> u64 {
        self.next_id.load(Ordering::Acquire)
    }

    pub fn start_count(&self) -> u64 {
        self.lifecycle.starts.load(Ordering::Acquire)
    }

    pub fn stop_count(&self) -> u64 {
        self.lifecycle.stops.load(Ordering::Acquire)
    }
}

impl LoadStrategy for MockLoadStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn next(
        &self,
        last_operation: Option<&dyn Operation>,
        _last_written_key: Option<&str>,
        runtime_shutting_down: bool,
    ) -> Result<Option<Box<dyn Operation>>> {
        if runtime_shutting_down {
            let cleaned_up = last_operation.is_some_and(|op| op.is::<MockCleanupOperation>());
            if self.cleanup && !cleaned_up {
                return Ok(Some(Box::new(MockCleanupOperation)));
            }
            return Ok(None);
        }
        if !self.budget.try_acquire() {
            return Ok(None);
        }
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let mut operation = MockOperation::new(id);
        if let Some(latency) = self.latency {
            operation = operation.with_latency(latency);
        }
        if self.failure_every.is_some_and(|n| (id + 1) % n == 0) {
            operation = operation.failing();
        }
        Ok(Some(Box::new(operation)))
    }

    fn operation_types(&self) -> Vec<OperationType> {
        vec![
            OperationType::of::<MockOperation>(),
            OperationType::of::<MockCleanupOperation>(),
        ]
    }

    fn key_store(&self) -> Option<Arc<dyn KeyStore>> {
        self.key_store.clone()
    }

    fn start(&self) -> Result<()> {
        self.lifecycle.start();
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.lifecycle.stop();
        if self.fail_stop {
            return Err(Error::illegal_state(
                "mock load strategy configured to fail on stop",
            ));
        }
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.lifecycle.is_started()
    }
}
