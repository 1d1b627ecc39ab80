//! Stampede: a pluggable, multi-threaded load-generation driver.
//!
//! Stampede drives a fixed pool of OS worker threads against a target
//! service and aggregates what happened into contiguous, fixed-width
//! sampling intervals. The core knows nothing about the protocol under
//! test: services, load strategies, sampling consumers and metrics are
//! plugged in through small traits and resolved by name at startup.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`Service`]: the system under load (a cache, a broker, an endpoint).
//!   One instance is shared by every worker thread.
//! - [`Operation`]: a single unit of load, executed once against the service.
//!   Operations are counted per concrete type ([`OperationType`]).
//! - [`LoadStrategy`]: generates the operation stream, shared by all workers.
//!   It may hand out cleanup operations once the run is shutting down.
//! - [`Sampler`]: owns one [`Counter`] per operation type and rotates them
//!   into [`SamplingInterval`]s, which it hands to every
//!   [`SamplingConsumer`]. System-wide [`Metric`]s are read at each rotation.
//! - [`MultiThreadedRunner`]: the worker pool. Each worker is a
//!   [`SingleThreadedRunner`] looping over `next`, `perform`, `record`.
//! - [`LoadDriver`]: builds all of the above from a
//!   [`DriverConfiguration`](config::DriverConfiguration) and a
//!   [`PluginRegistry`](registry::PluginRegistry), runs them and stops them
//!   in reverse dependency order.
//!
//! # Design goals
//!
//! - Blocking workers on plain OS threads. The only cancellation signal is a
//!   shared flag observed between operations.
//! - A recording hot path that never waits for interval rotation.
//! - No operation lost or counted twice across intervals.
//! - A failing consumer, metric or component stop never prevents the others
//!   from running or stopping.
//!
//! # Feature flags
//! - `builtins` (default): the in-memory key store, the log, JSON lines and
//!   collecting consumers, the load average and memory metrics (through
//!   `sysinfo`), and the mock service and load strategy.
//!
//! # Where to start
//!
//! Read the docs for [`Operation`], [`LoadStrategy`] and [`LoadDriver`], then
//! run the `mock_load` demo.

pub mod clock;
pub mod config;
/// Sampling consumers
pub mod consumer;
/// Per-operation-type counters
pub mod counter;
/// Top-level orchestration
pub mod driver;
pub mod error;
/// Worker threads and the pool that owns them
pub mod executor;
pub mod interval;
pub mod key_store;
pub mod load_strategy;
pub mod logging;
/// System-wide metrics
pub mod metric;
#[cfg(feature = "builtins")]
pub mod mock;
pub mod operation;
pub mod registry;
pub mod sampler;
pub mod service;

pub use consumer::{OperationSummary, SamplingConsumer};
pub use counter::{Counter, CounterValues, FailureCounter};
pub use driver::LoadDriver;
pub use error::{Error, Result};
pub use executor::{
    CompletionLatch, MultiThreadedRunner, RunnerDependencies, ShutdownSignal, SingleThreadedRunner,
};
pub use interval::SamplingInterval;
pub use key_store::KeyStore;
pub use load_strategy::{LoadStrategy, OperationBudget};
pub use metric::{Metric, MetricType};
pub use operation::{FailureType, Operation, OperationError, OperationIdentity, OperationType};
pub use sampler::Sampler;
pub use service::{Service, ServiceIdentity};

#[cfg(feature = "builtins")]
pub use consumer::{CollectingConsumer, JsonLinesConsumer, LogConsumer};
#[cfg(feature = "builtins")]
pub use key_store::InMemoryKeyStore;
#[cfg(feature = "builtins")]
pub use metric::{LoadAverage, MemoryUsage};
#[cfg(feature = "builtins")]
pub use mock::{MockCleanupOperation, MockLoadStrategy, MockOperation, MockService};
