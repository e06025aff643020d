//! The scheduler: the run loop at the heart of the execution context.
//!
//! One scheduler multiplexes three input streams — posted work items,
//! reactor readiness events, and timer expirations — into an ordered
//! dispatch of ready work. It owns the outstanding-work counter whose zero
//! crossing terminates the loop: the counter equals the number of queued,
//! not-yet-executed work items plus live, not-yet-completed operations.
//!
//! The completion queue is the only mutex-protected state on the hot path.
//! Any thread may drive the loop; a thread-local chain of scheduler frames
//! records which schedulers the current thread is driving so that
//! `running_in_this_thread` and the dispatch fast path work under nested
//! `run` calls.

use crate::error::Error;
use crate::reactor::{ClaimedOps, Reactor};
use crate::scheduler::timers::TimerQueue;
use crate::scheduler::work::{Work, WorkQueue};
use crate::service::Service;

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct SchedulerFrame {
    key: *const Scheduler,
    next: *const SchedulerFrame,
}

thread_local! {
    static CONTEXT_STACK: Cell<*const SchedulerFrame> = const { Cell::new(ptr::null()) };
}

/// Pushes a frame for the duration of one loop entry; popped on drop so a
/// panicking handler unwinds the chain correctly.
struct FrameGuard {
    previous: *const SchedulerFrame,
}

impl FrameGuard {
    fn push(frame: &SchedulerFrame) -> Self {
        let previous = CONTEXT_STACK.get();
        CONTEXT_STACK.set(frame);
        Self { previous }
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        CONTEXT_STACK.set(self.previous);
    }
}

/// Decrements outstanding work after a work item executes, panic-safe.
struct WorkGuard<'a> {
    sched: &'a Scheduler,
}

impl Drop for WorkGuard<'_> {
    fn drop(&mut self) {
        self.sched.work_finished();
    }
}

pub(crate) struct Scheduler {
    reactor: Box<dyn Reactor>,
    queue: Mutex<WorkQueue>,
    outstanding: AtomicUsize,
    stopped: AtomicBool,
    shut_down: AtomicBool,
    timers: TimerQueue,
    concurrency_hint: usize,
}

impl Scheduler {
    pub(crate) fn new(reactor: Box<dyn Reactor>, concurrency_hint: usize) -> Self {
        Self {
            reactor,
            queue: Mutex::new(WorkQueue::new()),
            outstanding: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            timers: TimerQueue::new(),
            concurrency_hint,
        }
    }

    pub(crate) fn reactor(&self) -> &dyn Reactor {
        &*self.reactor
    }

    pub(crate) fn concurrency_hint(&self) -> usize {
        self.concurrency_hint
    }

    //--------------------------------------------------------------
    // Work accounting
    //--------------------------------------------------------------

    /// Counts a live operation or queued item.
    pub(crate) fn work_started(&self) {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
    }

    /// Uncounts work without the zero-crossing stop; the loop itself
    /// notices an idle counter.
    pub(crate) fn work_finished(&self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    /// Public-facing variant used by long-lived collaborators: the last
    /// unit of work stops the loop.
    pub(crate) fn on_work_started(&self) {
        self.work_started();
    }

    pub(crate) fn on_work_finished(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.stop();
        }
    }

    //--------------------------------------------------------------
    // Posting
    //--------------------------------------------------------------

    /// Counts and enqueues a work item, waking the reactor.
    pub(crate) fn post(&self, work: Work) {
        if self.shut_down.load(Ordering::Acquire) {
            work.discard();
            return;
        }
        self.work_started();
        self.queue.lock().unwrap().push(work);
        self.reactor.wakeup();
    }

    /// Like `post`, but skips the reactor wakeup when the calling thread is
    /// already driving this scheduler: the loop will see the item on its
    /// next pass. This is the dispatch fast path.
    pub(crate) fn dispatch(&self, work: Work) {
        if self.shut_down.load(Ordering::Acquire) {
            work.discard();
            return;
        }
        self.work_started();
        self.queue.lock().unwrap().push(work);
        if !self.running_in_this_thread() {
            self.reactor.wakeup();
        }
    }

    /// Enqueues an already-claimed operation whose outstanding-work count
    /// transfers from its registration. Callers off the loop thread follow
    /// with `wakeup()`.
    pub(crate) fn push_claimed(&self, work: Work) {
        self.queue.lock().unwrap().push(work);
    }

    pub(crate) fn wakeup(&self) {
        self.reactor.wakeup();
    }

    //--------------------------------------------------------------
    // Loop control
    //--------------------------------------------------------------

    pub(crate) fn stop(&self) {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            log::debug!("scheduler stopped");
            self.reactor.wakeup();
        }
    }

    pub(crate) fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn restart(&self) {
        self.stopped.store(false, Ordering::Release);
    }

    pub(crate) fn running_in_this_thread(&self) -> bool {
        let mut frame = CONTEXT_STACK.get();
        while !frame.is_null() {
            let current = unsafe { &*frame };
            if ptr::eq(current.key, self) {
                return true;
            }
            frame = current.next;
        }
        false
    }

    //--------------------------------------------------------------
    // Loop entry points
    //--------------------------------------------------------------

    pub(crate) fn run(&self) -> Result<usize, Error> {
        self.run_entry(None, usize::MAX)
    }

    pub(crate) fn run_one(&self) -> Result<usize, Error> {
        self.run_entry(None, 1)
    }

    pub(crate) fn poll(&self) -> Result<usize, Error> {
        self.run_entry(Some(Duration::ZERO), usize::MAX)
    }

    pub(crate) fn poll_one(&self) -> Result<usize, Error> {
        self.run_entry(Some(Duration::ZERO), 1)
    }

    pub(crate) fn wait_one(&self, timeout: Duration) -> Result<usize, Error> {
        self.run_entry(Some(timeout), 1)
    }

    fn run_entry(&self, timeout: Option<Duration>, limit: usize) -> Result<usize, Error> {
        if self.stopped() {
            return Ok(0);
        }
        if self.outstanding.load(Ordering::Acquire) == 0 {
            self.stop();
            return Ok(0);
        }

        let frame = SchedulerFrame {
            key: self,
            next: CONTEXT_STACK.get(),
        };
        let _guard = FrameGuard::push(&frame);

        let mut executed = 0;
        while executed < limit {
            match self.do_one(timeout)? {
                0 => break,
                n => executed += n,
            }
        }
        Ok(executed)
    }

    /// One pass of the loop: execute one ready item, or wait for readiness
    /// and timers with the effective timeout.
    fn do_one(&self, timeout: Option<Duration>) -> Result<usize, Error> {
        let mut claimed: ClaimedOps = Vec::new();

        loop {
            if self.stopped() {
                return Ok(0);
            }

            let popped = self.queue.lock().unwrap().pop();
            if let Some(work) = popped {
                let guard = WorkGuard { sched: self };
                work.execute();
                drop(guard);
                return Ok(1);
            }

            if self.outstanding.load(Ordering::Acquire) == 0 {
                self.stop();
                return Ok(0);
            }

            let now = Instant::now();
            let effective = match (timeout, self.timers.until_next(now)) {
                (None, None) => None,
                (None, Some(t)) => Some(t),
                (Some(requested), None) => Some(requested),
                (Some(requested), Some(t)) => Some(requested.min(t)),
            };

            claimed.clear();
            let wait_result = self.reactor.wait(effective, &mut claimed);

            // Expired timers post completion items for the timer waits.
            let now = Instant::now();
            self.timers.process_expired(now, |op| {
                self.queue.lock().unwrap().push(Work::Op(op));
            });

            // Claimed operations carry their registration's work count.
            if !claimed.is_empty() {
                let mut queue = self.queue.lock().unwrap();
                for op in claimed.drain(..) {
                    queue.push(Work::Op(op));
                }
            }

            if let Err(e) = wait_result {
                if e.raw_os_error() == Some(libc::EINTR) {
                    if timeout.is_none() {
                        continue;
                    }
                    return Ok(0);
                }
                log::error!("reactor wait failed: {e}");
                return Err(Error::Os(e));
            }

            if self.stopped() {
                return Ok(0);
            }

            let popped = self.queue.lock().unwrap().pop();
            if let Some(work) = popped {
                let guard = WorkGuard { sched: self };
                work.execute();
                drop(guard);
                return Ok(1);
            }

            if timeout.is_some() {
                return Ok(0);
            }
        }
    }

    /// Schedules a timer expiration, waking the reactor when the deadline
    /// becomes the new earliest. The wait's work count is carried by the
    /// heap entry until it is claimed.
    pub(crate) fn schedule_timer(&self, deadline: Instant, op: Arc<crate::io::op::OpState>) {
        self.work_started();
        if self.timers.schedule(deadline, op) {
            self.reactor.wakeup();
        }
    }
}

impl Service for Scheduler {
    /// Discards every queued handler and zeroes the work counter; pending
    /// completions can no longer be delivered once the context is going
    /// away.
    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        let mut drained = WorkQueue::new();
        drained.splice(&mut self.queue.lock().unwrap());
        drop(drained);
        self.timers.drain();
        self.outstanding.store(0, Ordering::Release);
        log::debug!("scheduler shut down");
    }
}
