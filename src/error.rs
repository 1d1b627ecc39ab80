//! Error types for the load driver.

use thiserror::Error;

/// Errors raised by the driver core.
///
/// Per-operation failures reported by a [`Service`](crate::Service) are not
/// represented here; they travel as [`OperationError`](crate::OperationError)
/// and end up in the sampler's failure counters.
#[derive(Error, Debug)]
pub enum Error {
    /// A component was used in a state that does not allow the call
    /// (recording before start, registering after start, ...).
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// A required argument was missing or had an invalid value.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error, reported before any component starts.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The target service failed to start or stop.
    #[error("Service error: {0}")]
    Service(String),

    /// Key store failure.
    #[error("Key store error: {0}")]
    KeyStore(String),

    /// A sampling consumer failed while consuming or stopping.
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// A metric could not be read.
    #[error("Metric error: {0}")]
    Metric(String),

    /// A worker thread failed in a way that aborts the run.
    #[error("Worker error: {0}")]
    Worker(String),

    /// A bounded wait expired.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// One or more components failed to stop. Every component was still
    /// given the chance to stop.
    #[error("{} component(s) failed to stop: {}", .0.len(), join(.0))]
    Shutdown(Vec<Error>),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML configuration error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn illegal_state(msg: impl Into<String>) -> Self {
        Error::IllegalState(msg.into())
    }

    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Whether this error belongs to the user-facing configuration category.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Yaml(_))
    }

    /// Collapse a list of stop failures into a single result.
    pub(crate) fn from_stop_failures(mut failures: Vec<Error>) -> Result<()> {
        match failures.len() {
            0 => Ok(()),
            1 => Err(failures.remove(0)),
            _ => Err(Error::Shutdown(failures)),
        }
    }
}

fn join(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_failures_collapse() {
        assert!(Error::from_stop_failures(vec![]).is_ok());

        let single = Error::from_stop_failures(vec![Error::KeyStore("boom".into())]);
        assert!(matches!(single, Err(Error::KeyStore(_))));

        let many = Error::from_stop_failures(vec![
            Error::KeyStore("a".into()),
            Error::Service("b".into()),
        ])
        .unwrap_err();
        assert_eq!(
            many.to_string(),
            "2 component(s) failed to stop: Key store error: a; Service error: b"
        );
    }

    #[test]
    fn configuration_category() {
        assert!(Error::config("bad").is_configuration());
        assert!(!Error::illegal_state("bad").is_configuration());
    }
}
