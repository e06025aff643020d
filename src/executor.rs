//! Executors: where a continuation runs.
//!
//! An executor is a lightweight value wrapping its scheduler; copying one
//! never touches scheduler state. It offers the two operations of the work
//! model: *dispatch* (run now if the calling thread is already driving the
//! scheduler, otherwise post) and *post* (count and enqueue for a future
//! loop pass, waking the reactor). Task wakers resume their task through
//! the task's bound executor, which is what guarantees a task never runs
//! on a thread that is not driving its scheduler.

use crate::scheduler::core::Scheduler;
use crate::scheduler::work::Work;
use crate::task::TaskCore;

use std::sync::Arc;

/// A handle identifying where continuations resume.
#[derive(Clone)]
pub struct Executor {
    pub(crate) sched: Arc<Scheduler>,
}

impl Executor {
    pub(crate) fn new(sched: Arc<Scheduler>) -> Self {
        Self { sched }
    }

    /// Enqueues `f` to run on a scheduler thread during a later loop pass.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.sched.post(Work::Closure(Box::new(f)));
    }

    /// Runs `f` immediately when the calling thread is driving this
    /// executor's scheduler; otherwise posts it.
    pub fn dispatch<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.sched.running_in_this_thread() {
            f();
        } else {
            self.post(f);
        }
    }

    /// Returns `true` while the calling thread is inside one of this
    /// executor's loop entry points.
    pub fn running_in_this_thread(&self) -> bool {
        self.sched.running_in_this_thread()
    }

    /// Counts a unit of outstanding work, keeping the run loop alive while
    /// a long-lived collaborator has completions to deliver.
    pub fn on_work_started(&self) {
        self.sched.on_work_started();
    }

    /// Releases a unit of outstanding work; the last unit stops the loop.
    pub fn on_work_finished(&self) {
        self.sched.on_work_finished();
    }

    /// Schedules a task poll, using the dispatch fast path when already on
    /// a scheduler thread.
    pub(crate) fn schedule_task(&self, task: Arc<TaskCore>) {
        self.sched.dispatch(Work::Task(task));
    }

    /// Queues a task poll from outside the loop.
    pub(crate) fn post_task(&self, task: Arc<TaskCore>) {
        self.sched.post(Work::Task(task));
    }
}
