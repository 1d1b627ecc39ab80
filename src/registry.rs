//! Plugin registry: names in the configuration resolved to constructors.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{LoadConfiguration, SamplerConfiguration, ServiceConfiguration};
use crate::{Error, LoadStrategy, Metric, Result, SamplingConsumer, Service};

pub type ServiceConstructor =
    Box<dyn Fn(&ServiceConfiguration) -> Result<Arc<dyn Service>> + Send + Sync>;
pub type LoadStrategyConstructor =
    Box<dyn Fn(&LoadConfiguration) -> Result<Arc<dyn LoadStrategy>> + Send + Sync>;
pub type ConsumerConstructor =
    Box<dyn Fn(&SamplerConfiguration) -> Result<Arc<dyn SamplingConsumer>> + Send + Sync>;
pub type MetricConstructor = Box<dyn Fn() -> Result<Box<dyn Metric>> + Send + Sync>;

/// Maps `service_type`, `load_strategy`, consumer and metric names to the
/// functions building them. Registering a name twice replaces the previous
/// constructor.
///
/// # Example
/// ```rust
/// use std::sync::Arc;
/// use stampede::registry::PluginRegistry;
/// use stampede::{Result, Service};
///
/// struct InProcess;
///
/// impl Service for InProcess {
///     fn start(&self) -> Result<()> {
///         Ok(())
///     }
///     fn stop(&self) -> Result<()> {
///         Ok(())
///     }
///     fn is_started(&self) -> bool {
///         true
///     }
/// }
///
/// let mut registry = PluginRegistry::new();
/// registry.register_service("in-process", |_| Ok(Arc::new(InProcess) as Arc<dyn Service>));
/// assert!(registry.has_service("in-process"));
/// ```
#[derive(Default)]
pub struct PluginRegistry {
    services: BTreeMap<String, ServiceConstructor>,
    load_strategies: BTreeMap<String, LoadStrategyConstructor>,
    consumers: BTreeMap<String, ConsumerConstructor>,
    metrics: BTreeMap<String, MetricConstructor>,
}

impl PluginRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_service<F>(&mut self, name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&ServiceConfiguration) -> Result<Arc<dyn Service>> + Send + Sync + 'static,
    {
        self.services.insert(name.into(), Box::new(constructor));
        self
    }

    pub fn register_load_strategy<F>(&mut self, name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&LoadConfiguration) -> Result<Arc<dyn LoadStrategy>> + Send + Sync + 'static,
    {
        self.load_strategies.insert(name.into(), Box::new(constructor));
        self
    }

    pub fn register_consumer<F>(&mut self, name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&SamplerConfiguration) -> Result<Arc<dyn SamplingConsumer>> + Send + Sync + 'static,
    {
        self.consumers.insert(name.into(), Box::new(constructor));
        self
    }

    pub fn register_metric<F>(&mut self, name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn() -> Result<Box<dyn Metric>> + Send + Sync + 'static,
    {
        self.metrics.insert(name.into(), Box::new(constructor));
        self
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn has_load_strategy(&self, name: &str) -> bool {
        self.load_strategies.contains_key(name)
    }

    pub fn service(&self, configuration: &ServiceConfiguration) -> Result<Arc<dyn Service>> {
        let name = &configuration.service_type;
        let constructor = lookup(&self.services, "service type", name)?;
        constructor(configuration)
    }

    pub fn load_strategy(&self, configuration: &LoadConfiguration) -> Result<Arc<dyn LoadStrategy>> {
        let name = &configuration.load_strategy;
        let constructor = lookup(&self.load_strategies, "load strategy", name)?;
        constructor(configuration)
    }

    pub fn consumer(
        &self,
        name: &str,
        configuration: &SamplerConfiguration,
    ) -> Result<Arc<dyn SamplingConsumer>> {
        lookup(&self.consumers, "sampling consumer", name)?(configuration)
    }

    pub fn metric(&self, name: &str) -> Result<Box<dyn Metric>> {
        lookup(&self.metrics, "metric", name)?()
    }
}

fn lookup<'a, T>(map: &'a BTreeMap<String, T>, kind: &str, name: &str) -> Result<&'a T> {
    map.get(name).ok_or_else(|| {
        let known = map.keys().cloned().collect::<Vec<_>>().join(", ");
        Error::config(format!("unknown {kind} '{name}' (known: {known})"))
    })
}

#[cfg(feature = "builtins")]
mod builtins {
    use super::*;
    use crate::{
        CollectingConsumer, LoadAverage, LogConsumer, MemoryUsage, MockLoadStrategy, MockService,
    };

    impl PluginRegistry {
        /// A registry knowing the built-in plugins:
        /// - services: `mock`
        /// - load strategies: `mock`
        /// - consumers: `log`, `collect`
        /// - metrics: `load_average`, `memory`
        pub fn with_builtins() -> Self {
            let mut registry = Self::new();
            registry
                .register_service("mock", |c| {
                    Ok(Arc::new(MockService::from_configuration(c)?) as Arc<dyn Service>)
                })
                .register_load_strategy(MockLoadStrategy::NAME, |c| {
                    Ok(Arc::new(MockLoadStrategy::from_configuration(c)?) as Arc<dyn LoadStrategy>)
                })
                .register_consumer("log", |_| Ok(Arc::new(LogConsumer) as Arc<dyn SamplingConsumer>))
                .register_consumer("collect", |_| {
                    Ok(Arc::new(CollectingConsumer::new()) as Arc<dyn SamplingConsumer>)
                })
                .register_metric("load_average", || Ok(Box::new(LoadAverage) as Box<dyn Metric>))
                .register_metric("memory", || Ok(Box::new(MemoryUsage::new()) as Box<dyn Metric>));
            registry
        }
    }
}
