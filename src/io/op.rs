//! Per-operation state and the completion-vs-cancel race.
//!
//! Every in-flight asynchronous operation is backed by one [`OpState`] slot
//! owned by its I/O object and reused across operations. The slot holds the
//! waker of the suspended task and the two atomics that arbitrate who may
//! complete the operation.
//!
//! The `registration` atomic is the single point of truth. It moves through
//!
//! ```text
//! UNREGISTERED -> REGISTERING -> REGISTERED -> UNREGISTERED
//! ```
//!
//! within one operation's lifetime. Exactly one actor — the reactor that
//! observed readiness, a canceller, or the initiating path unwinding — wins
//! the atomic exchange out of a non-`UNREGISTERED` value, and only that
//! actor queues the completion. The `REGISTERING` intermediate closes the
//! window where the kernel can report readiness before the initiating
//! thread has finished publishing the slot.
//!
//! The `cancelled` flag is separate from `registration` on purpose:
//! a cancellation observed while the initiator is between `REGISTERING`
//! and `REGISTERED` must still be noticed once the transition completes.
//!
//! While a completion is queued the slot may hold an impl-keepalive: a
//! reference that keeps the owning I/O object's impl alive until the
//! dispatch has run, so closing an object with a pending completion never
//! frees memory the queue still points at.

use crate::reactor::Interest;
use crate::scheduler::core::Scheduler;
use crate::scheduler::work::Work;

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Waker;

pub(crate) const UNREGISTERED: u8 = 0;
pub(crate) const REGISTERING: u8 = 1;
pub(crate) const REGISTERED: u8 = 2;

pub(crate) struct OpState {
    registration: AtomicU8,
    cancelled: AtomicBool,
    engaged: AtomicBool,
    waker: Mutex<Option<Waker>>,
    keepalive: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl OpState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            registration: AtomicU8::new(UNREGISTERED),
            cancelled: AtomicBool::new(false),
            engaged: AtomicBool::new(false),
            waker: Mutex::new(None),
            keepalive: Mutex::new(None),
        })
    }

    /// Takes ownership of the slot for a new operation, resetting the
    /// previous operation's flags.
    ///
    /// Panics if an operation of this kind is already in flight; per-object
    /// concurrency of the same kind is a usage error, not a runtime error.
    pub(crate) fn engage(&self, what: &str) {
        if self.engaged.swap(true, Ordering::AcqRel) {
            panic!("{what}: an operation of this kind is already in flight");
        }
        self.cancelled.store(false, Ordering::Relaxed);
    }

    /// Releases the slot after the operation's outcome has been consumed.
    pub(crate) fn disengage(&self) {
        *self.waker.lock().unwrap() = None;
        self.engaged.store(false, Ordering::Release);
    }

    pub(crate) fn store_waker(&self, waker: &Waker) {
        let mut slot = self.waker.lock().unwrap();
        match slot.as_mut() {
            Some(existing) => existing.clone_from(waker),
            None => *slot = Some(waker.clone()),
        }
    }

    /// Publishes intent to register with the reactor.
    pub(crate) fn begin_register(&self) {
        self.registration.store(REGISTERING, Ordering::Release);
    }

    /// Confirms the registration is visible to the reactor. Returns `false`
    /// if another actor claimed the operation while it was `REGISTERING`;
    /// the claimer then owns the completion.
    pub(crate) fn commit_register(&self) -> bool {
        self.registration
            .compare_exchange(
                REGISTERING,
                REGISTERED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Marks the slot registered without an intermediate state. Used where
    /// publication is ordered by a lock (timer heap, signal table) rather
    /// than by the reactor.
    pub(crate) fn mark_registered(&self) {
        self.registration.store(REGISTERED, Ordering::Release);
    }

    /// Attempts to claim the operation for completion.
    ///
    /// Exactly one claim succeeds per registration cycle: the exchange
    /// returns the previous state, and only a non-`UNREGISTERED` previous
    /// value authorizes the caller to complete the operation.
    pub(crate) fn claim(&self) -> bool {
        self.registration.swap(UNREGISTERED, Ordering::AcqRel) != UNREGISTERED
    }

    pub(crate) fn registration(&self) -> u8 {
        self.registration.load(Ordering::Acquire)
    }

    pub(crate) fn request_cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn set_keepalive(&self, keepalive: Arc<dyn Any + Send + Sync>) {
        *self.keepalive.lock().unwrap() = Some(keepalive);
    }

    /// Completion dispatch: runs when the queued completion item executes.
    ///
    /// The waker is cloned to the stack (the slot keeps its copy so a
    /// re-registration racing this dispatch cannot lose its wake), the
    /// impl-keepalive is dropped — which may destroy the owning impl — and
    /// only then is the task woken to resume on its bound executor.
    pub(crate) fn dispatch(&self) {
        let waker = self.waker.lock().unwrap().clone();
        let keepalive = self.keepalive.lock().unwrap().take();
        drop(keepalive);
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Drops the slot's pinned resources without resuming anyone. Runs when
    /// a queued completion is discarded at scheduler teardown.
    pub(crate) fn discard(&self) {
        self.waker.lock().unwrap().take();
        self.keepalive.lock().unwrap().take();
    }
}

/// The cancellation path shared by every descriptor-backed operation:
/// stop-callbacks, explicit `cancel()`, and `close()` all funnel here.
///
/// Sets `cancelled`, then races for the claim. On a win the reactor
/// registration is removed, the keepalive is captured into the op, and the
/// completion is queued; the registration's outstanding-work count transfers
/// to the queued item. On a loss the owner of the claim observes
/// `cancelled` itself.
pub(crate) fn cancel_io_op(
    sched: &Scheduler,
    op: &Arc<OpState>,
    fd: i32,
    interest: Interest,
    keepalive: Arc<dyn Any + Send + Sync>,
) {
    op.request_cancel();
    if op.claim() {
        log::trace!("cancel claimed op on fd {fd} ({interest:?})");
        sched.reactor().deregister(fd, interest);
        op.set_keepalive(keepalive);
        sched.push_claimed(Work::Op(op.clone()));
        sched.wakeup();
    }
}

/// Outcome of the suspension prologue shared by the awaitable front ends.
pub(crate) enum Ready {
    /// The slot is owned by this future and idle; attempt the syscall.
    Proceed,
    /// The operation is registered (or a claim is in flight); suspended.
    Pending,
    /// Cancellation was observed; the caller reports `Error::Canceled`.
    Canceled,
}

/// Outcome of arming a would-blocked operation with the reactor.
pub(crate) enum Armed {
    /// Registered; the reactor or a canceller will queue the completion.
    Waiting,
    /// Cancellation won the race during registration.
    Canceled,
    /// The reactor rejected the registration.
    Failed(crate::error::Error),
}

/// The per-future half of an operation: engagement of the slot, the
/// cancellation callback's lifetime, and cleanup on drop.
pub(crate) struct OpFrontEnd {
    token: Option<crate::cancel::CancelToken>,
    guard: Option<crate::cancel::CancelGuard>,
    engaged: bool,
}

impl OpFrontEnd {
    pub(crate) fn new() -> Self {
        Self {
            token: None,
            guard: None,
            engaged: false,
        }
    }

    pub(crate) fn set_token(&mut self, token: crate::cancel::CancelToken) {
        self.token = Some(token);
    }

    /// The suspension prologue: on the first poll, takes the slot and
    /// installs the stop-callback; on later polls, reports cancellation or
    /// refreshes the stored waker while the registration is live.
    pub(crate) fn poll_ready(
        &mut self,
        op: &Arc<OpState>,
        what: &'static str,
        cx: &std::task::Context<'_>,
        canceller: impl FnOnce() -> Box<dyn FnOnce() + Send>,
    ) -> Ready {
        if !self.engaged {
            if self.token.as_ref().is_some_and(|t| t.is_cancelled()) {
                return Ready::Canceled;
            }
            op.engage(what);
            self.engaged = true;
            if let Some(token) = &self.token {
                self.guard = token.register(canceller());
                if self.guard.is_none() && op.is_cancelled() {
                    return Ready::Canceled;
                }
            }
            return Ready::Proceed;
        }

        if op.is_cancelled() {
            return Ready::Canceled;
        }
        if op.registration() != UNREGISTERED {
            op.store_waker(cx.waker());
            return Ready::Pending;
        }
        Ready::Proceed
    }

    /// Releases the slot once the outcome has been delivered.
    pub(crate) fn finish(&mut self, op: &OpState) {
        if self.engaged {
            self.engaged = false;
            op.disengage();
        }
        self.guard = None;
    }

    /// Abandons an in-flight operation when its future is dropped:
    /// a won claim unwinds the registration, a lost claim leaves the
    /// queued completion to run as a harmless wake.
    pub(crate) fn abandon(
        &mut self,
        sched: &Scheduler,
        op: &Arc<OpState>,
        fd: i32,
        interest: Interest,
    ) {
        if self.engaged {
            if op.claim() {
                sched.reactor().deregister(fd, interest);
                sched.work_finished();
            }
            op.disengage();
            self.engaged = false;
        }
        self.guard = None;
    }
}

/// Initiate-async, second half: the eager syscall would block, so publish
/// the registration and resolve the three-way race.
pub(crate) fn arm(
    sched: &Scheduler,
    op: &Arc<OpState>,
    fd: i32,
    interest: Interest,
    cx: &std::task::Context<'_>,
) -> Armed {
    op.store_waker(cx.waker());
    sched.work_started();
    op.begin_register();

    if let Err(e) = sched.reactor().register(fd, interest, op) {
        if op.claim() {
            sched.work_finished();
            return Armed::Failed(e.into());
        }
        // A canceller claimed mid-registration and queued the completion.
        return Armed::Waiting;
    }

    if !op.commit_register() {
        // The claimer owns completion; unwind the registration that raced
        // ahead of it.
        sched.reactor().deregister(fd, interest);
        return Armed::Waiting;
    }

    // A cancellation requested between REGISTERING and REGISTERED must be
    // noticed here, after the transition completed.
    if op.is_cancelled() && op.claim() {
        sched.reactor().deregister(fd, interest);
        sched.work_finished();
        return Armed::Canceled;
    }

    Armed::Waiting
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_claim_per_cycle() {
        let op = OpState::new();
        op.begin_register();
        assert!(op.commit_register());

        assert!(op.claim());
        assert!(!op.claim());
    }

    #[test]
    fn claim_during_registering_wins_over_commit() {
        let op = OpState::new();
        op.begin_register();

        // A concurrent canceller claims while the initiator is still
        // publishing; the initiator's commit must then fail.
        assert!(op.claim());
        assert!(!op.commit_register());
    }

    #[test]
    fn engage_rejects_a_second_operation() {
        let op = OpState::new();
        op.engage("read_some");
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            op.engage("read_some");
        }));
        assert!(result.is_err());
        op.disengage();
        op.engage("read_some");
    }

    #[test]
    fn cancelled_survives_the_registration_transition() {
        let op = OpState::new();
        op.engage("connect");
        op.begin_register();
        op.request_cancel();
        assert!(op.commit_register());
        assert!(op.is_cancelled());
    }
}
