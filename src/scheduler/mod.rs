//! Scheduler subsystem: work items, the completion queue, the timer queue,
//! and the run loop.

pub(crate) mod core;
pub(crate) mod timers;
pub(crate) mod work;
