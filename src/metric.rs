use std::borrow::Cow;
use std::fmt::{self, Display};

use serde::Serialize;

use crate::Result;

/// Identifies a system-wide metric within a sampling interval.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MetricType(Cow<'static, str>);

impl MetricType {
    /// One-minute system load average.
    pub const LOAD_AVERAGE: MetricType = MetricType(Cow::Borrowed("load_average"));
    /// Used physical memory, in bytes.
    pub const USED_MEMORY: MetricType = MetricType(Cow::Borrowed("used_memory_bytes"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A system-wide reading taken once per sampling interval rotation, as
/// opposed to the per-operation counters.
pub trait Metric: Send + Sync {
    fn metric_type(&self) -> MetricType;

    /// Read the current value. A failed read is logged and the metric is
    /// left out of that interval.
    fn value(&self) -> Result<f64>;
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use parking_lot::Mutex;
    use sysinfo::System;

    use super::*;

    /// One-minute load average, as reported by the operating system.
    #[derive(Debug, Default)]
    pub struct LoadAverage;

    impl Metric for LoadAverage {
        fn metric_type(&self) -> MetricType {
            MetricType::LOAD_AVERAGE
        }

        fn value(&self) -> Result<f64> {
            Ok(System::load_average().one)
        }
    }

    /// Used physical memory in bytes.
    pub struct MemoryUsage {
        system: Mutex<System>,
    }

    impl MemoryUsage {
        pub fn new() -> Self {
            Self {
                system: Mutex::new(System::new()),
            }
        }
    }

    impl Default for MemoryUsage {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metric for MemoryUsage {
        fn metric_type(&self) -> MetricType {
            MetricType::USED_MEMORY
        }

        fn value(&self) -> Result<f64> {
            let mut system = self.system.lock();
            system.refresh_memory();
            Ok(system.used_memory() as f64)
        }
    }

}
