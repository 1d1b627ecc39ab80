use std::any::{Any, TypeId};
use std::borrow::Cow;
use std::fmt::{self, Debug, Display};

use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::Service;

/// A single unit of load produced by a [`LoadStrategy`](crate::LoadStrategy)
/// and executed exactly once against a [`Service`].
///
/// Operations are keyed in the sampler by their concrete Rust type (see
/// [`OperationType`]), so each kind of work should be its own type.
///
/// # Example
/// ```rust
/// use stampede::{Operation, OperationError, Service};
///
/// #[derive(Debug)]
/// struct Ping;
///
/// impl Operation for Ping {
///     fn perform(&mut self, _service: &dyn Service) -> Result<(), OperationError> {
///         Ok(())
///     }
/// }
/// ```
pub trait Operation: OperationIdentity + Debug + Send + 'static {
    /// Execute the operation against `service`.
    ///
    /// An `Err` is a per-operation failure: it is timed and recorded like a
    /// success, keyed by its [`FailureType`], and never aborts the run.
    fn perform(&mut self, service: &dyn Service) -> Result<(), OperationError>;

    /// The key targeted by this operation, if any.
    fn key(&self) -> Option<&str> {
        None
    }

    /// The key this operation wrote once it completed successfully. Written
    /// keys are persisted in the key store and fed back to the load strategy.
    fn written_key(&self) -> Option<&str> {
        None
    }
}

/// Runtime identity of an operation. Implemented for every [`Operation`].
pub trait OperationIdentity {
    fn operation_type(&self) -> OperationType;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Operation> OperationIdentity for T {
    fn operation_type(&self) -> OperationType {
        OperationType::of::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl dyn Operation {
    pub fn is<T: Operation>(&self) -> bool {
        self.as_any().is::<T>()
    }

    pub fn downcast_ref<T: Operation>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Operation>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }
}

/// The concrete type of an [`Operation`], used as the key of its counter.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationType {
    name: &'static str,
    id: TypeId,
}

impl OperationType {
    pub fn of<T: Operation>() -> Self {
        Self {
            name: std::any::type_name::<T>(),
            id: TypeId::of::<T>(),
        }
    }

    /// Fully qualified type name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Type name without its module path.
    pub fn short_name(&self) -> &'static str {
        short(self.name)
    }
}

impl Debug for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OperationType({})", self.name)
    }
}

impl Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

impl Serialize for OperationType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.short_name())
    }
}

/// Classification of a failed operation, the analogue of an exception class.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct FailureType(Cow<'static, str>);

impl FailureType {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    /// Failure type named after the Rust type `E`, without its module path.
    pub fn of<E: ?Sized>() -> Self {
        Self(Cow::Borrowed(short(std::any::type_name::<E>())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for FailureType {
    fn from(value: &'static str) -> Self {
        Self::new(value)
    }
}

impl From<String> for FailureType {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// A per-operation failure reported by [`Operation::perform`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{failure_type}: {message}")]
pub struct OperationError {
    failure_type: FailureType,
    message: String,
}

impl OperationError {
    pub fn new(failure_type: impl Into<FailureType>, message: impl Into<String>) -> Self {
        Self {
            failure_type: failure_type.into(),
            message: message.into(),
        }
    }

    /// Wrap an arbitrary error, keyed by its Rust type.
    pub fn from_error<E: std::error::Error + 'static>(error: &E) -> Self {
        Self {
            failure_type: FailureType::of::<E>(),
            message: error.to_string(),
        }
    }

    pub fn failure_type(&self) -> &FailureType {
        &self.failure_type
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<std::io::Error> for OperationError {
    fn from(error: std::io::Error) -> Self {
        // io errors are keyed by kind, "ConnectionRefused", "TimedOut", ...
        Self::new(format!("{:?}", error.kind()), error.to_string())
    }
}

// Strips the module path. Generic type names are kept whole.
fn short(name: &'static str) -> &'static str {
    match name.find('<') {
        Some(_) => name,
        None => name.rsplit("::").next().unwrap_or(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Read;

    impl Operation for Read {
        fn perform(&mut self, _: &dyn Service) -> Result<(), OperationError> {
            Ok(())
        }
    }

    #[derive(Debug)]
    struct Write(String);

    impl Operation for Write {
        fn perform(&mut self, _: &dyn Service) -> Result<(), OperationError> {
            Ok(())
        }

        fn written_key(&self) -> Option<&str> {
            Some(&self.0)
        }
    }

    #[test]
    fn operation_type_follows_runtime_type() {
        let ops: Vec<Box<dyn Operation>> = vec![Box::new(Read), Box::new(Write("k".into()))];

        assert_eq!(ops[0].as_ref().operation_type(), OperationType::of::<Read>());
        assert_eq!(ops[1].as_ref().operation_type(), OperationType::of::<Write>());
        assert_ne!(OperationType::of::<Read>(), OperationType::of::<Write>());
        assert_eq!(OperationType::of::<Read>().short_name(), "Read");
    }

    #[test]
    fn downcast_to_concrete_operation() {
        let op: Box<dyn Operation> = Box::new(Write("k1".into()));
        assert!(op.is::<Write>());
        assert!(op.downcast_ref::<Read>().is_none());
        assert_eq!(op.downcast_ref::<Write>().map(|w| w.0.as_str()), Some("k1"));
        assert_eq!(op.written_key(), Some("k1"));
    }

    #[test]
    fn failure_type_from_error_type() {
        let err = std::fmt::Error;
        let failure = OperationError::from_error(&err);
        assert_eq!(failure.failure_type(), &FailureType::new("Error"));

        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        let failure = OperationError::from(io);
        assert_eq!(failure.failure_type().as_str(), "TimedOut");
        assert_eq!(failure.to_string(), "TimedOut: slow");
    }
}
