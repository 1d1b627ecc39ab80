use crate::Result;

/// Persists keys written during a run and hands them back to key-based load
/// strategies (a read strategy cycling over what a write strategy produced).
///
/// Implementations are shared between worker threads.
pub trait KeyStore: Send + Sync {
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn is_started(&self) -> bool;

    /// Remember `key`.
    fn store(&self, key: &str) -> Result<()>;

    /// The next key to use, or `None` when the store holds no keys.
    ///
    /// Fails with [`Error::IllegalState`](crate::Error::IllegalState) if the
    /// store is not started.
    fn next(&self) -> Result<Option<String>>;
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use parking_lot::RwLock;

    use super::*;
    use crate::Error;

    /// Keys kept in memory for the duration of the process; [`next`] cycles
    /// over them in insertion order.
    ///
    /// [`next`]: KeyStore::next
    #[derive(Debug, Default)]
    pub struct InMemoryKeyStore {
        keys: RwLock<Vec<String>>,
        cursor: AtomicUsize,
        started: AtomicBool,
        capacity: Option<usize>,
    }

    impl InMemoryKeyStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Stop remembering keys once `capacity` keys are stored.
        pub fn with_capacity(capacity: usize) -> Self {
            Self {
                capacity: Some(capacity),
                ..Self::default()
            }
        }

        pub fn len(&self) -> usize {
            self.keys.read().len()
        }

        pub fn is_empty(&self) -> bool {
            self.keys.read().is_empty()
        }

        pub fn keys(&self) -> Vec<String> {
            self.keys.read().clone()
        }
    }

    impl KeyStore for InMemoryKeyStore {
        fn start(&self) -> Result<()> {
            if !self.started.swap(true, Ordering::AcqRel) {
                tracing::debug!("In-memory key store started");
            }
            Ok(())
        }

        fn stop(&self) -> Result<()> {
            if self.started.swap(false, Ordering::AcqRel) {
                tracing::debug!("In-memory key store stopped with {} keys", self.len());
            }
            Ok(())
        }

        fn is_started(&self) -> bool {
            self.started.load(Ordering::Acquire)
        }

        fn store(&self, key: &str) -> Result<()> {
            if !self.is_started() {
                return Err(Error::illegal_state("key store not started"));
            }
            let mut keys = self.keys.write();
            if self.capacity.is_none_or(|c| keys.len() < c) {
                keys.push(key.to_owned());
            }
            Ok(())
        }

        fn next(&self) -> Result<Option<String>> {
            if !self.is_started() {
                return Err(Error::illegal_state("key store not started"));
            }
            let keys = self.keys.read();
            if keys.is_empty() {
                return Ok(None);
            }
            let i = self.cursor.fetch_add(1, Ordering::Relaxed) % keys.len();
            Ok(Some(keys[i].clone()))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn next_requires_start() {
            let store = InMemoryKeyStore::new();
            assert!(matches!(store.next(), Err(Error::IllegalState(_))));
            assert!(matches!(store.store("a"), Err(Error::IllegalState(_))));
        }

        #[test]
        fn cycles_over_stored_keys() {
            let store = InMemoryKeyStore::new();
            store.start().unwrap();
            assert_eq!(store.next().unwrap(), None);

            store.store("a").unwrap();
            store.store("b").unwrap();
            let seen: Vec<_> = (0..4).map(|_| store.next().unwrap().unwrap()).collect();
            assert_eq!(seen, ["a", "b", "a", "b"]);
        }

        #[test]
        fn capacity_bounds_stored_keys() {
            let store = InMemoryKeyStore::with_capacity(2);
            store.start().unwrap();
            for k in ["a", "b", "c"] {
                store.store(k).unwrap();
            }
            assert_eq!(store.keys(), ["a", "b"]);
        }

        #[test]
        fn start_and_stop_are_idempotent() {
            let store = InMemoryKeyStore::new();
            store.start().unwrap();
            store.start().unwrap();
            assert!(store.is_started());
            store.stop().unwrap();
            store.stop().unwrap();
            assert!(!store.is_started());
        }
    }
}
