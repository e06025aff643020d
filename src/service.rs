//! The typed service registry backing the execution context.
//!
//! Services are stored and retrieved by type with first-creation
//! semantics: the first request constructs the service (with the registry
//! unlocked, so a constructor may look up other services), and every later
//! request returns the same instance. A service may declare a secondary
//! lookup key so a specialized implementation can be found through a
//! generic name. Shutdown runs in reverse creation order.

use crate::context::ExecutionContext;

use std::any::{Any, TypeId};
use std::sync::{Arc, Mutex};

/// A per-context service.
///
/// `shutdown` is the moment to cancel outstanding operations and release
/// OS handles: once the scheduler is gone, pending completions cannot be
/// delivered.
pub trait Service: Send + Sync + 'static {
    fn shutdown(&self) {}

    /// An additional type id this service can be looked up under.
    fn secondary_key() -> Option<TypeId>
    where
        Self: Sized,
    {
        None
    }
}

/// Constructs a service on first request.
pub trait FromContext: Sized {
    fn from_context(ctx: &ExecutionContext) -> Self;
}

struct Entry {
    primary: TypeId,
    secondary: Option<TypeId>,
    any: Arc<dyn Any + Send + Sync>,
    service: Arc<dyn Service>,
}

impl Entry {
    fn matches(&self, id: TypeId) -> bool {
        self.primary == id || self.secondary == Some(id)
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    entries: Mutex<Vec<Entry>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn find<T: Service>(&self) -> Option<Arc<T>> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .find(|e| e.primary == TypeId::of::<T>())
            .map(|e| e.any.clone().downcast::<T>().expect("registry type mismatch"))
    }

    pub(crate) fn has(&self, id: TypeId) -> bool {
        let entries = self.entries.lock().unwrap();
        entries.iter().any(|e| e.matches(id))
    }

    /// Inserts `service` unless a matching entry appeared meanwhile, in
    /// which case the existing instance wins (double-checked insert).
    pub(crate) fn insert_or_existing<T: Service>(&self, service: Arc<T>) -> Arc<T> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.iter().find(|e| e.primary == TypeId::of::<T>()) {
            return existing
                .any
                .clone()
                .downcast::<T>()
                .expect("registry type mismatch");
        }

        entries.push(Entry {
            primary: TypeId::of::<T>(),
            secondary: T::secondary_key(),
            any: service.clone(),
            service: service.clone(),
        });
        service
    }

    /// Inserts `service`, panicking if its type or secondary key is
    /// already present. Duplicate registration is a usage error.
    pub(crate) fn insert_new<T: Service>(&self, service: Arc<T>) -> Arc<T> {
        let mut entries = self.entries.lock().unwrap();
        if entries.iter().any(|e| e.matches(TypeId::of::<T>())) {
            panic!("service already exists in this execution context");
        }
        if let Some(key) = T::secondary_key() {
            if entries.iter().any(|e| e.matches(key)) {
                panic!("a service with the same secondary key already exists");
            }
        }

        entries.push(Entry {
            primary: TypeId::of::<T>(),
            secondary: T::secondary_key(),
            any: service.clone(),
            service: service.clone(),
        });
        service
    }

    /// Shuts every service down in reverse creation order, then drops the
    /// references.
    pub(crate) fn shutdown_all(&self) {
        let drained: Vec<Entry> = {
            let mut entries = self.entries.lock().unwrap();
            entries.drain(..).collect()
        };
        for entry in drained.iter().rev() {
            entry.service.shutdown();
        }
        log::debug!("service registry shut down ({} services)", drained.len());
    }
}
