//! Fluent builder for execution context construction.

use crate::context::ExecutionContext;
use crate::error::Error;
use crate::reactor::Reactor;
use crate::scheduler::core::Scheduler;

use std::sync::Arc;

/// The event demultiplexer driving a context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    /// Edge-triggered readiness (`epoll`). The default on Linux.
    #[cfg(target_os = "linux")]
    Epoll,
    /// Completion-queue submissions (`io_uring`).
    #[cfg(target_os = "linux")]
    IoUring,
    /// Portable level-triggered readiness (`select`), bounded by
    /// `FD_SETSIZE`.
    Select,
}

impl Backend {
    fn default_for_platform() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                Backend::Epoll
            } else {
                Backend::Select
            }
        }
    }
}

/// Builder for [`ExecutionContext`] instances.
///
/// # Example
/// ```ignore
/// let ctx = ContextBuilder::new()
///     .backend(Backend::Select)
///     .build()
///     .unwrap();
/// ```
pub struct ContextBuilder {
    concurrency_hint: Option<usize>,
    backend: Option<Backend>,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self {
            concurrency_hint: None,
            backend: None,
        }
    }

    /// Hints how many threads will drive the context. Informational: it
    /// never changes semantics.
    pub fn concurrency_hint(mut self, hint: usize) -> Self {
        self.concurrency_hint = Some(hint);
        self
    }

    /// Selects the reactor backend explicitly.
    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Builds the context, constructing the selected backend.
    pub fn build(self) -> Result<ExecutionContext, Error> {
        let hint = self.concurrency_hint.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        let backend = self.backend.unwrap_or_else(Backend::default_for_platform);

        let reactor: Box<dyn Reactor> = match backend {
            #[cfg(target_os = "linux")]
            Backend::Epoll => Box::new(crate::reactor::epoll::EpollReactor::new()?),
            #[cfg(target_os = "linux")]
            Backend::IoUring => Box::new(crate::reactor::uring::UringReactor::new()?),
            Backend::Select => Box::new(crate::reactor::select::SelectReactor::new()?),
        };

        log::debug!("execution context created: {backend:?} backend, concurrency hint {hint}");
        let sched = Arc::new(Scheduler::new(reactor, hint));
        Ok(ExecutionContext::from_scheduler(sched))
    }
}
