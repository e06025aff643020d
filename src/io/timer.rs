//! Deadline timers.
//!
//! A [`DeadlineTimer`] holds one deadline and one wait slot. Waits go
//! through the scheduler's timer queue; scheduling a deadline earlier than
//! the queue's current earliest wakes the reactor so the run loop
//! re-evaluates its wait. Moving the deadline while a wait is outstanding
//! cancels that wait.

use crate::cancel::CancelToken;
use crate::context::ExecutionContext;
use crate::error::Error;
use crate::io::op::{OpFrontEnd, OpState, Ready, UNREGISTERED};
use crate::scheduler::core::Scheduler;
use crate::scheduler::work::Work;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// A monotonic-clock deadline awaitable.
///
/// # Example
/// ```ignore
/// let timer = DeadlineTimer::new(&ctx);
/// timer.expires_after(Duration::from_millis(10));
/// timer.wait().await?;
/// ```
pub struct DeadlineTimer {
    sched: Arc<Scheduler>,
    op: Arc<OpState>,
    deadline: Mutex<Instant>,
}

impl DeadlineTimer {
    pub fn new(ctx: &ExecutionContext) -> Self {
        Self {
            sched: ctx.scheduler().clone(),
            op: OpState::new(),
            deadline: Mutex::new(Instant::now()),
        }
    }

    /// Sets the deadline to `duration` from now, cancelling an
    /// outstanding wait.
    pub fn expires_after(&self, duration: Duration) {
        self.expires_at(Instant::now() + duration);
    }

    /// Sets an absolute deadline, cancelling an outstanding wait.
    pub fn expires_at(&self, deadline: Instant) {
        self.cancel();
        *self.deadline.lock().unwrap() = deadline;
    }

    pub fn expiry(&self) -> Instant {
        *self.deadline.lock().unwrap()
    }

    /// Cancels an outstanding wait; it completes with
    /// [`Error::Canceled`]. The heap entry it leaves behind is dead and is
    /// dropped when it surfaces.
    pub fn cancel(&self) {
        self.op.request_cancel();
        if self.op.claim() {
            self.sched.push_claimed(Work::Op(self.op.clone()));
            self.sched.wakeup();
        }
    }

    /// Waits until the deadline. Completes with `Ok(())` at expiry, or
    /// [`Error::Canceled`] if the wait was cancelled or the deadline
    /// moved.
    pub fn wait(&self) -> TimerWait<'_> {
        TimerWait {
            timer: self,
            scheduled: false,
            front: OpFrontEnd::new(),
        }
    }
}

/// Awaitable returned by [`DeadlineTimer::wait`].
pub struct TimerWait<'a> {
    timer: &'a DeadlineTimer,
    scheduled: bool,
    front: OpFrontEnd,
}

impl TimerWait<'_> {
    /// Attaches a cancellation token for the suspension.
    pub fn cancel_token(mut self, token: &CancelToken) -> Self {
        self.front.set_token(token.clone());
        self
    }

    fn finish(&mut self, result: Result<(), Error>) -> Result<(), Error> {
        self.front.finish(&self.timer.op);
        result
    }
}

impl Future for TimerWait<'_> {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.as_mut().get_mut();
        let timer = this.timer;
        let op = timer.op.clone();

        let canceller = || {
            let sched = timer.sched.clone();
            let op = op.clone();
            Box::new(move || {
                op.request_cancel();
                if op.claim() {
                    sched.push_claimed(Work::Op(op.clone()));
                    sched.wakeup();
                }
            }) as Box<dyn FnOnce() + Send>
        };
        match this.front.poll_ready(&op, "timer wait", cx, canceller) {
            Ready::Pending => return Poll::Pending,
            Ready::Canceled => return Poll::Ready(this.finish(Err(Error::Canceled))),
            Ready::Proceed => {}
        }

        if this.scheduled {
            // The heap claimed and dispatched the expiration.
            return Poll::Ready(this.finish(Ok(())));
        }

        let deadline = timer.expiry();
        if deadline <= Instant::now() {
            return Poll::Ready(this.finish(Ok(())));
        }

        op.store_waker(cx.waker());
        this.scheduled = true;
        timer.sched.schedule_timer(deadline, op);
        Poll::Pending
    }
}

impl Drop for TimerWait<'_> {
    fn drop(&mut self) {
        if self.scheduled && self.timer.op.registration() != UNREGISTERED {
            // Abandoned mid-wait: claim the entry back so the run loop is
            // not kept alive by a wait nobody observes.
            if self.timer.op.claim() {
                self.timer.sched.work_finished();
            }
        }
        self.front.finish(&self.timer.op);
    }
}
