//! Configuration of a driver run, loadable from YAML.
//!
//! ```yaml
//! load:
//!   load_strategy: mock
//!   thread_count: 4
//!   duration_ms: 10000
//!   properties:
//!     failure_every: 10
//! service:
//!   service_type: mock
//! sampler:
//!   sampling_interval_ms: 1000
//!   consumers: [log]
//!   metrics: [load_average]
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sampler::{DEFAULT_SAMPLING_INTERVAL_MS, DEFAULT_SAMPLING_TASK_RUN_INTERVAL_MS};
use crate::{Error, Result};

/// Free-form plugin parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(BTreeMap<String, serde_yaml::Value>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<serde_yaml::Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn get_u64(&self, name: &str) -> Result<Option<u64>> {
        self.typed(name, "an unsigned integer", serde_yaml::Value::as_u64)
    }

    pub fn get_f64(&self, name: &str) -> Result<Option<f64>> {
        self.typed(name, "a number", serde_yaml::Value::as_f64)
    }

    pub fn get_bool(&self, name: &str) -> Result<Option<bool>> {
        self.typed(name, "a boolean", serde_yaml::Value::as_bool)
    }

    pub fn get_str(&self, name: &str) -> Result<Option<&str>> {
        self.typed(name, "a string", serde_yaml::Value::as_str)
    }

    fn typed<'a, T>(
        &'a self,
        name: &str,
        expected: &str,
        convert: impl FnOnce(&'a serde_yaml::Value) -> Option<T>,
    ) -> Result<Option<T>> {
        match self.0.get(name) {
            None => Ok(None),
            Some(value) => convert(value)
                .map(Some)
                .ok_or_else(|| Error::config(format!("property '{name}' must be {expected}"))),
        }
    }
}

/// How much load to generate and with how many threads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfiguration {
    /// Name of the load strategy in the plugin registry.
    pub load_strategy: String,
    pub thread_count: usize,
    /// Total operations across all threads. Unlimited when absent.
    pub operation_count: Option<u64>,
    /// Wall-clock limit of the run.
    pub duration_ms: Option<u64>,
    pub sleep_between_operations_ms: Option<u64>,
    /// Size of the key store of key based strategies.
    pub key_count: Option<u64>,
    /// Bounded wait for workers to drain on stop.
    pub stop_timeout_ms: u64,
    /// Accept a run with neither duration nor operation count; it then only
    /// ends through `LoadDriver::turn_off`.
    pub allow_unbounded: bool,
    pub properties: Properties,
}

impl Default for LoadConfiguration {
    fn default() -> Self {
        Self {
            load_strategy: "mock".to_string(),
            thread_count: num_cpus::get(),
            operation_count: None,
            duration_ms: None,
            sleep_between_operations_ms: None,
            key_count: None,
            stop_timeout_ms: 30_000,
            allow_unbounded: false,
            properties: Properties::default(),
        }
    }
}

impl LoadConfiguration {
    pub fn duration(&self) -> Option<Duration> {
        self.duration_ms.map(Duration::from_millis)
    }

    pub fn sleep_between_operations(&self) -> Option<Duration> {
        self.sleep_between_operations_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// The target service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfiguration {
    /// Name of the service in the plugin registry.
    pub service_type: String,
    pub properties: Properties,
}

impl Default for ServiceConfiguration {
    fn default() -> Self {
        Self {
            service_type: "mock".to_string(),
            properties: Properties::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfiguration {
    pub sampling_interval_ms: u64,
    /// `0` disables the background rotation thread.
    pub sampling_task_run_interval_ms: u64,
    /// Metric names in the plugin registry.
    pub metrics: Vec<String>,
    /// Consumer names in the plugin registry.
    pub consumers: Vec<String>,
}

impl Default for SamplerConfiguration {
    fn default() -> Self {
        Self {
            sampling_interval_ms: DEFAULT_SAMPLING_INTERVAL_MS,
            sampling_task_run_interval_ms: DEFAULT_SAMPLING_TASK_RUN_INTERVAL_MS,
            metrics: Vec::new(),
            consumers: vec!["log".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfiguration {
    pub load: LoadConfiguration,
    pub service: ServiceConfiguration,
    pub sampler: SamplerConfiguration,
}

impl DriverConfiguration {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read configuration file {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Reject configurations that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<()> {
        let load = &self.load;
        if load.thread_count == 0 {
            return Err(Error::config("thread_count must be positive"));
        }
        if load.load_strategy.trim().is_empty() {
            return Err(Error::config("load_strategy must be named"));
        }
        if self.service.service_type.trim().is_empty() {
            return Err(Error::config("service_type must be named"));
        }
        if load.duration_ms == Some(0) {
            return Err(Error::config("duration_ms must be positive when set"));
        }
        if load.duration_ms.is_none() && load.operation_count.is_none() && !load.allow_unbounded {
            return Err(Error::config(
                "neither duration_ms nor operation_count is set; set allow_unbounded to run until turned off",
            ));
        }
        let sampler = &self.sampler;
        if sampler.sampling_interval_ms == 0 {
            return Err(Error::config("sampling_interval_ms must be positive"));
        }
        if sampler.sampling_task_run_interval_ms >= sampler.sampling_interval_ms {
            return Err(Error::config(format!(
                "sampling_task_run_interval_ms ({}) must be smaller than sampling_interval_ms ({})",
                sampler.sampling_task_run_interval_ms, sampler.sampling_interval_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn bounded() -> DriverConfiguration {
        let mut config = DriverConfiguration::default();
        config.load.operation_count = Some(10);
        config
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let config = DriverConfiguration::from_yaml_str("load:\n  operation_count: 5\n").unwrap();
        assert_eq!(config.load.operation_count, Some(5));
        assert_eq!(config.load.load_strategy, "mock");
        assert_eq!(config.load.thread_count, num_cpus::get());
        assert_eq!(config.service.service_type, "mock");
        assert_eq!(config.sampler.sampling_interval_ms, 1000);
        assert_eq!(config.sampler.sampling_task_run_interval_ms, 250);
        config.validate().unwrap();
    }

    #[test]
    fn full_document() {
        let yaml = r#"
load:
  load_strategy: mock
  thread_count: 3
  duration_ms: 2000
  sleep_between_operations_ms: 5
  key_count: 100
  properties:
    failure_every: 4
    latency_ms: 2
service:
  service_type: mock
  properties:
    fail_stop: true
sampler:
  sampling_interval_ms: 500
  sampling_task_run_interval_ms: 100
  metrics: [load_average, memory]
  consumers: [log, collect]
"#;
        let config = DriverConfiguration::from_yaml_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.load.duration(), Some(Duration::from_secs(2)));
        assert_eq!(config.load.sleep_between_operations(), Some(Duration::from_millis(5)));
        assert_eq!(config.load.properties.get_u64("failure_every").unwrap(), Some(4));
        assert_eq!(config.service.properties.get_bool("fail_stop").unwrap(), Some(true));
        assert_eq!(config.sampler.metrics, ["load_average", "memory"]);
    }

    #[test]
    fn wrongly_typed_property_is_a_configuration_error() {
        let props = Properties::new().with("latency_ms", "slow");
        let err = props.get_u64("latency_ms").unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(props.get_str("latency_ms").unwrap(), Some("slow"));
        assert_eq!(props.get_u64("missing").unwrap(), None);
    }

    #[test]
    fn invalid_documents_are_rejected() {
        let err = DriverConfiguration::from_yaml_str("load: [1, 2]").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn validation_rules() {
        let mut c = bounded();
        c.load.thread_count = 0;
        assert!(c.validate().unwrap_err().is_configuration());

        let mut c = bounded();
        c.sampler.sampling_interval_ms = 0;
        assert!(c.validate().is_err());

        let mut c = bounded();
        c.sampler.sampling_interval_ms = 2000;
        c.sampler.sampling_task_run_interval_ms = 3000;
        assert!(matches!(c.validate(), Err(Error::Config(_))));

        let mut c = bounded();
        c.load.operation_count = None;
        assert!(c.validate().is_err());
        c.load.allow_unbounded = true;
        c.validate().unwrap();

        let mut c = bounded();
        c.load.duration_ms = Some(0);
        assert!(c.validate().is_err());

        // a zero operation count is a valid, empty run
        let mut c = bounded();
        c.load.operation_count = Some(0);
        c.validate().unwrap();
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "load:\n  duration_ms: 100\n  thread_count: 2").unwrap();
        let config = DriverConfiguration::from_path(file.path()).unwrap();
        assert_eq!(config.load.thread_count, 2);

        let missing = DriverConfiguration::from_path("/definitely/not/here.yaml").unwrap_err();
        assert!(missing.is_configuration());
    }
}
