use std::time::Duration;

use serde::Serialize;

use crate::{CounterValues, Result, SamplingInterval};

/// A [`SamplingConsumer`] receives closed [`SamplingInterval`]s and performs
/// side effects with them: printing, writing a file, pushing to a database.
///
/// Consumers are the I/O boundary of the sampler. Intervals arrive in strict
/// chronological order, each slice sorted by start time, and are never
/// modified afterwards.
///
/// `stop` is called exactly once when the sampler stops, after the final
/// interval was delivered. A consumer that fails to stop never prevents the
/// other consumers from being stopped.
///
/// # Example
/// ```rust
/// use stampede::{Result, SamplingConsumer, SamplingInterval};
///
/// struct Printer;
///
/// impl SamplingConsumer for Printer {
///     fn consume(&self, intervals: &[SamplingInterval]) -> Result<()> {
///         for i in intervals {
///             println!("{} -> {} operations", i.start_ms(), i.total_count());
///         }
///         Ok(())
///     }
///
///     fn stop(&self) -> Result<()> {
///         Ok(())
///     }
/// }
/// ```
pub trait SamplingConsumer: Send + Sync {
    fn consume(&self, intervals: &[SamplingInterval]) -> Result<()>;
    fn stop(&self) -> Result<()>;
}

/// Derived statistics for one operation type in one interval.
///
/// Pure data: computed from [`CounterValues`], no I/O.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationSummary {
    pub success_count: u64,
    pub failure_count: u64,
    pub average_success_latency: Duration,
    pub average_failure_latency: Duration,
    /// Percentage of successful operations, 0 when nothing ran.
    pub success_ratio: f64,
}

impl From<&CounterValues> for OperationSummary {
    fn from(value: &CounterValues) -> Self {
        let average = |total: u64, count: u64| {
            total
                .checked_div(count)
                .map_or(Duration::ZERO, Duration::from_nanos)
        };
        let total = value.total_count();
        Self {
            success_count: value.success_count(),
            failure_count: value.failure_count(),
            average_success_latency: average(
                value.success_cumulated_duration_nanos(),
                value.success_count(),
            ),
            average_failure_latency: average(
                value.failure_cumulated_duration_nanos(),
                value.failure_count(),
            ),
            success_ratio: if total == 0 {
                0.0
            } else {
                (value.success_count() as f64 / total as f64) * 100.0
            },
        }
    }
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    /// Logs one line per operation type and interval through `tracing`.
    #[derive(Debug, Default)]
    pub struct LogConsumer;

    impl SamplingConsumer for LogConsumer {
        fn consume(&self, intervals: &[SamplingInterval]) -> Result<()> {
            for interval in intervals {
                for operation_type in interval.operation_types() {
                    let Some(values) = interval.counter_values(operation_type) else {
                        continue;
                    };
                    let summary = OperationSummary::from(values);
                    tracing::info!(
                        start_ms = interval.start_ms(),
                        operation = %operation_type,
                        successes = summary.success_count,
                        failures = summary.failure_count,
                        avg_latency = ?summary.average_success_latency,
                        success_ratio = summary.success_ratio,
                        "sampling interval"
                    );
                }
                for annotation in interval.annotations() {
                    tracing::info!(start_ms = interval.start_ms(), "annotation: {annotation}");
                }
            }
            Ok(())
        }

        fn stop(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Writes each interval as one JSON document per line.
    pub struct JsonLinesConsumer<W: Write + Send> {
        writer: Mutex<W>,
    }

    impl<W: Write + Send> JsonLinesConsumer<W> {
        pub fn new(writer: W) -> Self {
            Self {
                writer: Mutex::new(writer),
            }
        }

        pub fn into_inner(self) -> W {
            self.writer.into_inner()
        }
    }

    impl<W: Write + Send> SamplingConsumer for JsonLinesConsumer<W> {
        fn consume(&self, intervals: &[SamplingInterval]) -> Result<()> {
            let mut writer = self.writer.lock();
            for interval in intervals {
                serde_json::to_writer(&mut *writer, interval)?;
                writer.write_all(b"\n")?;
            }
            Ok(())
        }

        fn stop(&self) -> Result<()> {
            self.writer.lock().flush()?;
            Ok(())
        }
    }

    /// Keeps every interval in memory. Useful for programmatic runs and tests.
    #[derive(Debug, Default)]
    pub struct CollectingConsumer {
        intervals: Mutex<Vec<SamplingInterval>>,
        stops: AtomicUsize,
    }

    impl CollectingConsumer {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn intervals(&self) -> Vec<SamplingInterval> {
            self.intervals.lock().clone()
        }

        /// How many times `stop` was called.
        pub fn stop_count(&self) -> usize {
            self.stops.load(Ordering::Acquire)
        }

        pub fn is_stopped(&self) -> bool {
            self.stop_count() > 0
        }
    }

    impl SamplingConsumer for CollectingConsumer {
        fn consume(&self, intervals: &[SamplingInterval]) -> Result<()> {
            self.intervals.lock().extend_from_slice(intervals);
            Ok(())
        }

        fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }
    }
}
