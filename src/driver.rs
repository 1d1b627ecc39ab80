use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::config::DriverConfiguration;
use crate::registry::PluginRegistry;
use crate::{Error, KeyStore, LoadStrategy, MultiThreadedRunner, Result, Sampler, Service};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Component {
    Service,
    LoadStrategy,
    Sampler,
    KeyStore,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::Service => "service",
            Component::LoadStrategy => "load strategy",
            Component::Sampler => "sampler",
            Component::KeyStore => "key store",
        };
        f.write_str(name)
    }
}

// Dependency order; stopping goes the other way.
const START_ORDER: [Component; 4] = [
    Component::Service,
    Component::LoadStrategy,
    Component::Sampler,
    Component::KeyStore,
];

/// Glues everything together: builds the components of a run from a
/// [`DriverConfiguration`], starts them, runs the worker pool and stops them.
///
/// ```rust
/// use stampede::config::DriverConfiguration;
/// use stampede::registry::PluginRegistry;
/// use stampede::{LoadDriver, Service};
///
/// # #[cfg(feature = "builtins")] {
/// let mut configuration = DriverConfiguration::default();
/// configuration.load.thread_count = 2;
/// configuration.load.operation_count = Some(100);
/// configuration.sampler.consumers.clear();
///
/// let driver = LoadDriver::init(configuration, &PluginRegistry::with_builtins())?;
/// driver.run()?;
/// assert!(!driver.service().is_started());
/// # }
/// # Ok::<(), stampede::Error>(())
/// ```
pub struct LoadDriver {
    configuration: DriverConfiguration,
    service: Arc<dyn Service>,
    load_strategy: Arc<dyn LoadStrategy>,
    key_store: Option<Arc<dyn KeyStore>>,
    sampler: Sampler,
    runner: MultiThreadedRunner,
    running: Mutex<()>,
    turned_off: AtomicBool,
}

impl LoadDriver {
    /// Validate `configuration` and build every component. Nothing is
    /// started.
    pub fn init(configuration: DriverConfiguration, registry: &PluginRegistry) -> Result<Self> {
        configuration.validate()?;

        let service = registry.service(&configuration.service)?;
        let load_strategy = registry.load_strategy(&configuration.load)?;
        let key_store = load_strategy.key_store();

        let sampler = Sampler::new();
        sampler
            .set_intervals(
                configuration.sampler.sampling_interval_ms,
                configuration.sampler.sampling_task_run_interval_ms,
            )
            .map_err(as_configuration)?;
        let operation_types = load_strategy.operation_types();
        if operation_types.is_empty() {
            return Err(Error::config(format!(
                "load strategy '{}' declares no operation types",
                load_strategy.name()
            )));
        }
        for operation_type in operation_types {
            sampler.register_operation(operation_type)?;
        }
        for name in &configuration.sampler.metrics {
            sampler.register_metric(registry.metric(name)?);
        }
        for name in &configuration.sampler.consumers {
            sampler.register_consumer(registry.consumer(name, &configuration.sampler)?);
        }

        let load = &configuration.load;
        let runner = MultiThreadedRunner::builder()
            .service(service.clone())
            .load_strategy(load_strategy.clone())
            .sampler(sampler.clone())
            .key_store(key_store.clone())
            .thread_count(load.thread_count)
            .duration(load.duration())
            .sleep_between_operations(load.sleep_between_operations())
            .stop_timeout(load.stop_timeout())
            .build();

        tracing::info!(
            "Load driver initialized: strategy={}, service={}, {} thread(s)",
            load.load_strategy,
            configuration.service.service_type,
            load.thread_count
        );
        Ok(Self {
            configuration,
            service,
            load_strategy,
            key_store,
            sampler,
            runner,
            running: Mutex::new(()),
            turned_off: AtomicBool::new(false),
        })
    }

    pub fn configuration(&self) -> &DriverConfiguration {
        &self.configuration
    }

    pub fn service(&self) -> &Arc<dyn Service> {
        &self.service
    }

    pub fn load_strategy(&self) -> &Arc<dyn LoadStrategy> {
        &self.load_strategy
    }

    pub fn key_store(&self) -> Option<&Arc<dyn KeyStore>> {
        self.key_store.as_ref()
    }

    /// Consumers and annotations may be added here before [`run`](Self::run).
    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    pub fn runner(&self) -> &MultiThreadedRunner {
        &self.runner
    }

    /// Start every component, run the workers to completion, stop every
    /// started component in reverse order.
    ///
    /// A failure while starting or running still stops whatever was started;
    /// that failure is returned and stop failures are logged. Otherwise stop
    /// failures are returned together.
    pub fn run(&self) -> Result<()> {
        let Some(_running) = self.running.try_lock() else {
            return Err(Error::illegal_state("load driver is already running"));
        };
        if self.turned_off.load(Ordering::Acquire) {
            return Err(Error::illegal_state("load driver was turned off"));
        }

        let mut started = Vec::with_capacity(START_ORDER.len());
        let outcome = self.start_and_run(&mut started);
        let stopped = self.stop_components(started.iter().rev().copied());

        match outcome {
            Ok(()) => {
                tracing::info!("Load driver run complete.");
                stopped
            }
            Err(e) => {
                if let Err(stop_error) = stopped {
                    tracing::error!("Stopping after a failed run also failed: {stop_error}");
                }
                Err(e)
            }
        }
    }

    /// Stop everything now: the workers, then every component, whatever
    /// state it is in. Safe to call from another thread while
    /// [`run`](Self::run) blocks, and more than once.
    pub fn turn_off(&self) -> Result<()> {
        if !self.turned_off.swap(true, Ordering::AcqRel) {
            tracing::info!("Turning off load driver...");
        }
        let mut failures = Vec::new();
        if let Err(e) = self.runner.stop() {
            tracing::error!("Failed to stop the runner: {e}");
            failures.push(e);
        }
        if let Err(e) = self.stop_components(START_ORDER.iter().rev().copied()) {
            failures.push(e);
        }
        Error::from_stop_failures(failures)
    }

    fn start_and_run(&self, started: &mut Vec<Component>) -> Result<()> {
        for component in START_ORDER {
            if component == Component::KeyStore && self.key_store.is_none() {
                continue;
            }
            self.start_component(component)?;
            started.push(component);
            tracing::debug!("Started {component}.");
        }
        if self.turned_off.load(Ordering::Acquire) {
            return Err(Error::illegal_state("load driver was turned off"));
        }
        self.sampler.annotate("load started");
        self.runner.run()?;
        // after turn_off the sampler is already stopped
        if !self.turned_off.load(Ordering::Acquire) {
            self.sampler.annotate("load finished");
        }

        let counts = self.runner.per_thread_invocation_counts();
        tracing::info!(
            "{} operation(s) on {} thread(s) in {:?}",
            counts.values().sum::<u64>(),
            counts.len(),
            self.runner.elapsed().unwrap_or_default()
        );
        Ok(())
    }

    fn start_component(&self, component: Component) -> Result<()> {
        match component {
            Component::Service => self.service.start(),
            Component::LoadStrategy => self.load_strategy.start(),
            Component::Sampler => self.sampler.start(),
            Component::KeyStore => self.key_store.as_ref().map_or(Ok(()), |k| k.start()),
        }
    }

    fn stop_component(&self, component: Component) -> Result<()> {
        match component {
            Component::Service => self.service.stop(),
            Component::LoadStrategy => self.load_strategy.stop(),
            Component::Sampler => self.sampler.stop(),
            Component::KeyStore => self.key_store.as_ref().map_or(Ok(()), |k| k.stop()),
        }
    }

    // Every component gets its stop call, whatever the others do.
    fn stop_components(&self, components: impl Iterator<Item = Component>) -> Result<()> {
        let mut failures = Vec::new();
        for component in components {
            match self.stop_component(component) {
                Ok(()) => tracing::debug!("Stopped {component}."),
                Err(e) => {
                    tracing::error!("Failed to stop {component}: {e}");
                    failures.push(e);
                }
            }
        }
        Error::from_stop_failures(failures)
    }
}

fn as_configuration(error: Error) -> Error {
    match error {
        Error::InvalidArgument(msg) => Error::Config(msg),
        other => other,
    }
}
