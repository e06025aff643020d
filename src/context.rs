//! The execution context: service registry plus the scheduler that drives
//! everything created from it.

use crate::builder::ContextBuilder;
use crate::error::Error;
use crate::executor::Executor;
use crate::scheduler::core::Scheduler;
use crate::service::{FromContext, Registry, Service};

use std::any::TypeId;
use std::sync::Arc;
use std::time::Duration;

/// Owner of the scheduler and every per-context I/O service.
///
/// Threads drive the context by calling [`run`](Self::run) (or one of the
/// bounded variants); any number of threads may drive the same context.
/// The loop returns once the outstanding-work counter reaches zero or
/// [`stop`](Self::stop) is called; call [`restart`](Self::restart) before
/// driving it again.
///
/// # Example
/// ```ignore
/// let ctx = ExecutionContext::new();
/// let ex = ctx.executor();
/// run_async(&ex, async move {
///     // ... await I/O ...
/// });
/// ctx.run().unwrap();
/// ```
pub struct ExecutionContext {
    registry: Registry,
    sched: Arc<Scheduler>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    /// Builds a context with the platform default backend.
    ///
    /// # Panics
    /// Panics if the backend cannot be constructed; use
    /// [`ContextBuilder::build`] to handle that failure.
    pub fn new() -> Self {
        ContextBuilder::new()
            .build()
            .expect("failed to construct execution context")
    }

    pub(crate) fn from_scheduler(sched: Arc<Scheduler>) -> Self {
        let registry = Registry::new();
        registry.insert_new(sched.clone());
        Self { registry, sched }
    }

    pub(crate) fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    /// Returns an executor bound to this context's scheduler.
    pub fn executor(&self) -> Executor {
        Executor::new(self.sched.clone())
    }

    /// The concurrency hint the context was built with. Informational.
    pub fn concurrency_hint(&self) -> usize {
        self.sched.concurrency_hint()
    }

    //--------------------------------------------------------------
    // Loop entry points
    //--------------------------------------------------------------

    /// Runs handlers until the context runs out of work or is stopped.
    /// Returns the number of handlers executed.
    pub fn run(&self) -> Result<usize, Error> {
        self.sched.run()
    }

    /// Runs at most one handler, blocking until one is ready.
    pub fn run_one(&self) -> Result<usize, Error> {
        self.sched.run_one()
    }

    /// Runs every handler that is ready without blocking.
    pub fn poll(&self) -> Result<usize, Error> {
        self.sched.poll()
    }

    /// Runs at most one ready handler without blocking.
    pub fn poll_one(&self) -> Result<usize, Error> {
        self.sched.poll_one()
    }

    /// Runs at most one handler, waiting up to `timeout` for one to become
    /// ready. A zero timeout is equivalent to [`poll_one`](Self::poll_one).
    pub fn wait_one(&self, timeout: Duration) -> Result<usize, Error> {
        self.sched.wait_one(timeout)
    }

    /// Stops the context; concurrent and subsequent loop calls return.
    pub fn stop(&self) {
        self.sched.stop();
    }

    pub fn stopped(&self) -> bool {
        self.sched.stopped()
    }

    /// Clears the stopped state so the context can be driven again.
    pub fn restart(&self) {
        self.sched.restart();
    }

    /// Returns `true` while the calling thread is inside one of this
    /// context's loop entry points.
    pub fn running_in_this_thread(&self) -> bool {
        self.sched.running_in_this_thread()
    }

    //--------------------------------------------------------------
    // Service registry
    //--------------------------------------------------------------

    /// Returns the service of type `T`, constructing it on first request.
    ///
    /// Construction happens with the registry unlocked so a constructor
    /// may itself request other services; a racing construction of the
    /// same type resolves to a single surviving instance.
    pub fn use_service<T: Service + FromContext>(&self) -> Arc<T> {
        if let Some(existing) = self.registry.find::<T>() {
            return existing;
        }
        let service = Arc::new(T::from_context(self));
        self.registry.insert_or_existing(service)
    }

    /// Adds a caller-constructed service.
    ///
    /// # Panics
    /// Panics if a service of the same type or secondary key exists.
    pub fn make_service<T: Service>(&self, service: T) -> Arc<T> {
        self.registry.insert_new(Arc::new(service))
    }

    /// Returns the service of type `T` if it has been created.
    pub fn find_service<T: Service>(&self) -> Option<Arc<T>> {
        self.registry.find::<T>()
    }

    /// Returns `true` if a service of type `T` (or one declaring `T` as
    /// its secondary key) exists.
    pub fn has_service<T: Service>(&self) -> bool {
        self.registry.has(TypeId::of::<T>())
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        // Reverse creation order: I/O services cancel and release their
        // descriptors first, the scheduler drains its queue last.
        self.registry.shutdown_all();
    }
}
