use std::any::Any;

use crate::{Operation, OperationError, Result};

/// The system under load: a cache, a message broker, an HTTP endpoint.
///
/// One instance is shared by every worker thread, so operations may be
/// performed against it concurrently. `start` and `stop` must be idempotent.
///
/// Operations reach the concrete service through [`downcast_ref`]:
///
/// ```rust, ignore
/// fn perform(&mut self, service: &dyn Service) -> Result<(), OperationError> {
///     let cache = service
///         .downcast_ref::<CacheService>()
///         .ok_or_else(|| OperationError::new("WrongService", "not a cache"))?;
///     cache.put(&self.key, &self.value)
/// }
/// ```
///
/// [`downcast_ref`]: dyn Service::downcast_ref
pub trait Service: ServiceIdentity + Send + Sync + 'static {
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn is_started(&self) -> bool;
}

/// Runtime identity of a service. Implemented for every [`Service`].
pub trait ServiceIdentity {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Service> ServiceIdentity for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn Service {
    pub fn downcast_ref<T: Service>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Execute `operation` against this service.
    pub fn perform(&self, operation: &mut dyn Operation) -> std::result::Result<(), OperationError> {
        operation.perform(self)
    }
}
