use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::{CounterValues, Error, MetricType, OperationType, Result};

/// One fixed-width time bucket: `[start_ms, start_ms + duration_ms)`.
///
/// The sampler is the only writer while the interval is open; once handed to
/// a [`SamplingConsumer`](crate::SamplingConsumer) it is read-only.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SamplingInterval {
    start_ms: u64,
    duration_ms: u64,
    operation_types: Vec<OperationType>,
    counter_values: HashMap<OperationType, CounterValues>,
    annotations: Vec<String>,
    metrics: BTreeMap<MetricType, f64>,
}

impl SamplingInterval {
    /// An empty interval able to hold counters for `operation_types`.
    ///
    /// Fails if `operation_types` is empty or `duration_ms` is zero.
    pub fn new(start_ms: u64, duration_ms: u64, operation_types: &[OperationType]) -> Result<Self> {
        if operation_types.is_empty() {
            return Err(Error::invalid_argument(
                "a sampling interval needs at least one operation type",
            ));
        }
        if duration_ms == 0 {
            return Err(Error::invalid_argument("sampling interval duration must be positive"));
        }
        let mut types = operation_types.to_vec();
        types.sort();
        types.dedup();
        let counter_values = types
            .iter()
            .map(|t| (*t, CounterValues::default()))
            .collect();
        Ok(Self {
            start_ms,
            duration_ms,
            operation_types: types,
            counter_values,
            annotations: Vec::new(),
            metrics: BTreeMap::new(),
        })
    }

    /// The interval that directly follows this one, with the same operation
    /// types and nothing recorded.
    pub fn successor(&self) -> Self {
        Self {
            start_ms: self.end_ms(),
            duration_ms: self.duration_ms,
            operation_types: self.operation_types.clone(),
            counter_values: self
                .operation_types
                .iter()
                .map(|t| (*t, CounterValues::default()))
                .collect(),
            annotations: Vec::new(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn start_ms(&self) -> u64 {
        self.start_ms
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    /// Exclusive end of the interval.
    pub fn end_ms(&self) -> u64 {
        self.start_ms + self.duration_ms
    }

    pub fn contains(&self, ts_ms: u64) -> bool {
        ts_ms >= self.start_ms && ts_ms < self.end_ms()
    }

    pub fn operation_types(&self) -> &[OperationType] {
        &self.operation_types
    }

    /// Values for `operation_type`: zero if nothing was recorded, `None` if the
    /// type was never registered with this interval.
    pub fn counter_values(&self, operation_type: &OperationType) -> Option<&CounterValues> {
        self.counter_values.get(operation_type)
    }

    pub fn set_counter_values(
        &mut self,
        operation_type: OperationType,
        values: CounterValues,
    ) -> Result<()> {
        *self.slot(&operation_type)? = values;
        Ok(())
    }

    /// Add `values` to what is already held for `operation_type`.
    pub fn increment_counter_values(
        &mut self,
        operation_type: OperationType,
        values: &CounterValues,
    ) -> Result<()> {
        self.slot(&operation_type)?.merge(values);
        Ok(())
    }

    pub fn add_annotation(&mut self, annotation: impl Into<String>) {
        self.annotations.push(annotation.into());
    }

    pub fn annotations(&self) -> &[String] {
        &self.annotations
    }

    pub fn set_metric(&mut self, metric_type: MetricType, value: f64) {
        self.metrics.insert(metric_type, value);
    }

    pub fn metric(&self, metric_type: &MetricType) -> Option<f64> {
        self.metrics.get(metric_type).copied()
    }

    pub fn metrics(&self) -> &BTreeMap<MetricType, f64> {
        &self.metrics
    }

    /// Successes and failures across every operation type.
    pub fn total_count(&self) -> u64 {
        self.counter_values.values().map(CounterValues::total_count).sum()
    }

    fn slot(&mut self, operation_type: &OperationType) -> Result<&mut CounterValues> {
        self.counter_values.get_mut(operation_type).ok_or_else(|| {
            Error::invalid_argument(format!(
                "{operation_type} is not registered with this sampling interval"
            ))
        })
    }
}
