//! Signal sets.
//!
//! A [`SignalSet`] registers interest in one or more signal numbers and
//! exposes an awaitable [`wait`](SignalSet::wait) that yields the next
//! delivered signal. The process-wide handler is installed when a signal
//! number gains its first registration anywhere in the process and
//! restored to the default on the last removal, tracked by a global
//! reference count.
//!
//! Delivery crosses contexts: every signal service registers itself in a
//! process-global list, and the handler walks that list under the global
//! mutex, dispatching immediately to any waiter and otherwise queuing a
//! per-(signal, owner) undelivered count for pickup by the next wait.

use crate::cancel::CancelToken;
use crate::context::ExecutionContext;
use crate::error::Error;
use crate::io::op::{OpFrontEnd, OpState, Ready};
use crate::scheduler::core::Scheduler;
use crate::scheduler::work::Work;
use crate::service::{FromContext, Service};

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::mem;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::task::{Context, Poll};

const MAX_SIGNAL: usize = 64;

bitflags::bitflags! {
    /// Behavior flags for a signal registration.
    ///
    /// Two registrations of the same signal number must either agree on
    /// flags or one side must set [`SignalFlags::DONT_CARE`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SignalFlags: u32 {
        /// Install the handler with `SA_RESTART`.
        const RESTART = 0b01;
        /// Accept whatever flags another registration chose.
        const DONT_CARE = 0b10;
    }
}

//--------------------------------------------------------------
// Process-global state
//--------------------------------------------------------------

struct GlobalState {
    services: Vec<Weak<SignalService>>,
    counts: [usize; MAX_SIGNAL],
}

fn global() -> &'static Mutex<GlobalState> {
    static GLOBAL: OnceLock<Mutex<GlobalState>> = OnceLock::new();
    GLOBAL.get_or_init(|| {
        Mutex::new(GlobalState {
            services: Vec::new(),
            counts: [0; MAX_SIGNAL],
        })
    })
}

extern "C" fn process_signal_handler(signo: libc::c_int) {
    let state = global().lock().unwrap();
    for weak in &state.services {
        if let Some(service) = weak.upgrade() {
            service.deliver(signo);
        }
    }
}

fn install_handler(signo: i32, flags: SignalFlags) -> io::Result<()> {
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    let handler: extern "C" fn(libc::c_int) = process_signal_handler;
    action.sa_sigaction = handler as usize;
    if flags.contains(SignalFlags::RESTART) {
        action.sa_flags = libc::SA_RESTART;
    }
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(signo, &action, std::ptr::null_mut()) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn restore_default(signo: i32) {
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = libc::SIG_DFL;
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(signo, &action, std::ptr::null_mut());
    }
}

//--------------------------------------------------------------
// Service
//--------------------------------------------------------------

struct Registration {
    owner: usize,
    flags: SignalFlags,
    undelivered: usize,
}

struct ServiceTable {
    impls: HashMap<usize, Arc<SignalImpl>>,
    regs: Vec<Vec<Registration>>,
}

/// Per-context signal delivery service.
pub struct SignalService {
    sched: Arc<Scheduler>,
    table: Mutex<ServiceTable>,
    in_global_list: AtomicBool,
}

impl FromContext for SignalService {
    fn from_context(ctx: &ExecutionContext) -> Self {
        Self {
            sched: ctx.scheduler().clone(),
            table: Mutex::new(ServiceTable {
                impls: HashMap::new(),
                regs: (0..MAX_SIGNAL).map(|_| Vec::new()).collect(),
            }),
            in_global_list: AtomicBool::new(false),
        }
    }
}

impl Service for SignalService {
    fn shutdown(&self) {
        let mut state = global().lock().unwrap();
        let mut table = self.table.lock().unwrap();

        // Give back this service's share of the handler reference counts.
        for (signo, regs) in table.regs.iter_mut().enumerate() {
            for _ in regs.drain(..) {
                state.counts[signo] -= 1;
                if state.counts[signo] == 0 {
                    restore_default(signo as i32);
                }
            }
        }
        table.impls.clear();

        state
            .services
            .retain(|weak| !std::ptr::eq(weak.as_ptr(), self));
    }
}

impl SignalService {
    /// Adds this service to the process-global delivery list, once.
    fn ensure_global(self: &Arc<Self>) {
        if !self.in_global_list.swap(true, Ordering::AcqRel) {
            global().lock().unwrap().services.push(Arc::downgrade(self));
        }
    }

    fn create_impl(self: &Arc<Self>) -> Arc<SignalImpl> {
        self.ensure_global();
        let imp = Arc::new(SignalImpl {
            sched: self.sched.clone(),
            op: OpState::new(),
            state: Mutex::new(WaitState {
                waiting: false,
                pending_signal: 0,
            }),
        });
        self.table
            .lock()
            .unwrap()
            .impls
            .insert(Arc::as_ptr(&imp) as usize, imp.clone());
        imp
    }

    fn destroy_impl(&self, imp: &Arc<SignalImpl>) {
        self.table
            .lock()
            .unwrap()
            .impls
            .remove(&(Arc::as_ptr(imp) as usize));
    }

    fn add_signal(&self, imp: &Arc<SignalImpl>, signo: i32, flags: SignalFlags) -> Result<(), Error> {
        if !(0..MAX_SIGNAL as i32).contains(&signo) {
            return Err(Error::from_errno(libc::EINVAL));
        }
        let owner = Arc::as_ptr(imp) as usize;

        let mut state = global().lock().unwrap();
        let mut table = self.table.lock().unwrap();
        let regs = &mut table.regs[signo as usize];

        if regs.iter().any(|r| r.owner == owner) {
            return Ok(());
        }

        // Flag compatibility: without a don't-care bit on either side the
        // effective flags of a shared signal number must agree.
        if let Some(existing) = regs.first() {
            let this_dont_care = flags.contains(SignalFlags::DONT_CARE);
            let other_dont_care = existing.flags.contains(SignalFlags::DONT_CARE);
            if !this_dont_care && !other_dont_care {
                let this_actual = flags & !SignalFlags::DONT_CARE;
                let other_actual = existing.flags & !SignalFlags::DONT_CARE;
                if this_actual != other_actual {
                    return Err(Error::from_errno(libc::EINVAL));
                }
            }
        }

        if state.counts[signo as usize] == 0 {
            install_handler(signo, flags)?;
        }

        regs.push(Registration {
            owner,
            flags,
            undelivered: 0,
        });
        state.counts[signo as usize] += 1;
        log::debug!("signal {signo} registered (process count {})", state.counts[signo as usize]);
        Ok(())
    }

    fn remove_signal(&self, imp: &Arc<SignalImpl>, signo: i32) -> Result<(), Error> {
        if !(0..MAX_SIGNAL as i32).contains(&signo) {
            return Err(Error::from_errno(libc::EINVAL));
        }
        let owner = Arc::as_ptr(imp) as usize;

        let mut state = global().lock().unwrap();
        let mut table = self.table.lock().unwrap();
        let regs = &mut table.regs[signo as usize];

        let before = regs.len();
        regs.retain(|r| r.owner != owner);
        if regs.len() == before {
            return Ok(());
        }

        state.counts[signo as usize] -= 1;
        if state.counts[signo as usize] == 0 {
            restore_default(signo);
        }
        Ok(())
    }

    fn clear_signals(&self, imp: &Arc<SignalImpl>) {
        let owner = Arc::as_ptr(imp) as usize;
        let mut state = global().lock().unwrap();
        let mut table = self.table.lock().unwrap();

        for (signo, regs) in table.regs.iter_mut().enumerate() {
            let before = regs.len();
            regs.retain(|r| r.owner != owner);
            for _ in regs.len()..before {
                state.counts[signo] -= 1;
                if state.counts[signo] == 0 {
                    restore_default(signo as i32);
                }
            }
        }
    }

    /// Consumes a queued delivery or parks the wait.
    fn start_wait(&self, imp: &Arc<SignalImpl>) -> Option<i32> {
        let owner = Arc::as_ptr(imp) as usize;
        let mut table = self.table.lock().unwrap();

        for (signo, regs) in table.regs.iter_mut().enumerate() {
            if let Some(reg) = regs.iter_mut().find(|r| r.owner == owner) {
                if reg.undelivered > 0 {
                    reg.undelivered -= 1;
                    return Some(signo as i32);
                }
            }
        }

        let mut wait = imp.state.lock().unwrap();
        wait.waiting = true;
        wait.pending_signal = 0;
        imp.op.mark_registered();
        self.sched.on_work_started();
        None
    }

    /// Dispatches `signo` to every interested impl of this service;
    /// called from the process handler with the global mutex held.
    fn deliver(&self, signo: libc::c_int) {
        if !(0..MAX_SIGNAL as i32).contains(&signo) {
            return;
        }
        let mut table = self.table.lock().unwrap();
        let owners: Vec<usize> = table.regs[signo as usize]
            .iter()
            .map(|r| r.owner)
            .collect();

        for owner in owners {
            let Some(imp) = table.impls.get(&owner).cloned() else {
                continue;
            };

            let mut wait = imp.state.lock().unwrap();
            if wait.waiting {
                wait.waiting = false;
                wait.pending_signal = signo;
                drop(wait);
                if imp.op.claim() {
                    self.sched.push_claimed(Work::Op(imp.op.clone()));
                    self.sched.wakeup();
                }
            } else {
                drop(wait);
                if let Some(reg) = table.regs[signo as usize]
                    .iter_mut()
                    .find(|r| r.owner == owner)
                {
                    reg.undelivered += 1;
                }
            }
        }
    }

    fn cancel_wait(&self, imp: &Arc<SignalImpl>) {
        let mut wait = imp.state.lock().unwrap();
        if wait.waiting {
            wait.waiting = false;
            drop(wait);
            imp.op.request_cancel();
            if imp.op.claim() {
                self.sched.push_claimed(Work::Op(imp.op.clone()));
                self.sched.wakeup();
            }
        }
    }
}

//--------------------------------------------------------------
// Impl and public handle
//--------------------------------------------------------------

struct WaitState {
    waiting: bool,
    pending_signal: i32,
}

pub(crate) struct SignalImpl {
    sched: Arc<Scheduler>,
    op: Arc<OpState>,
    state: Mutex<WaitState>,
}

/// A set of signal numbers with an awaitable delivery queue.
///
/// # Example
/// ```ignore
/// let signals = SignalSet::new(&ctx);
/// signals.add(libc::SIGINT)?;
/// let signo = signals.wait().await?;
/// ```
pub struct SignalSet {
    svc: Arc<SignalService>,
    inner: Arc<SignalImpl>,
}

impl SignalSet {
    pub fn new(ctx: &ExecutionContext) -> Self {
        let svc = ctx.use_service::<SignalService>();
        let inner = svc.create_impl();
        Self { svc, inner }
    }

    /// Creates a set with `signals` already registered.
    pub fn with_signals(ctx: &ExecutionContext, signals: &[i32]) -> Result<Self, Error> {
        let set = Self::new(ctx);
        for &signo in signals {
            set.add(signo)?;
        }
        Ok(set)
    }

    /// Registers interest in `signo` with default flags.
    pub fn add(&self, signo: i32) -> Result<(), Error> {
        self.svc.add_signal(&self.inner, signo, SignalFlags::empty())
    }

    /// Registers interest in `signo` with explicit flags.
    pub fn add_with_flags(&self, signo: i32, flags: SignalFlags) -> Result<(), Error> {
        self.svc.add_signal(&self.inner, signo, flags)
    }

    /// Removes interest in `signo`; queued deliveries for it remain
    /// consumable.
    pub fn remove(&self, signo: i32) -> Result<(), Error> {
        self.svc.remove_signal(&self.inner, signo)
    }

    /// Removes every registered signal.
    pub fn clear(&self) {
        self.svc.clear_signals(&self.inner);
    }

    /// Cancels an outstanding wait; it completes with
    /// [`Error::Canceled`].
    pub fn cancel(&self) {
        self.svc.cancel_wait(&self.inner);
    }

    /// Waits for the next delivered signal, yielding its number.
    pub fn wait(&self) -> SignalWait<'_> {
        SignalWait {
            set: self,
            front: OpFrontEnd::new(),
        }
    }
}

impl Drop for SignalSet {
    fn drop(&mut self) {
        self.clear();
        self.cancel();
        self.svc.destroy_impl(&self.inner);
    }
}

/// Awaitable returned by [`SignalSet::wait`].
pub struct SignalWait<'a> {
    set: &'a SignalSet,
    front: OpFrontEnd,
}

impl SignalWait<'_> {
    /// Attaches a cancellation token for the suspension.
    pub fn cancel_token(mut self, token: &CancelToken) -> Self {
        self.front.set_token(token.clone());
        self
    }

    fn finish(&mut self, result: Result<i32, Error>) -> Result<i32, Error> {
        self.front.finish(&self.set.inner.op);
        result
    }
}

impl Future for SignalWait<'_> {
    type Output = Result<i32, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.as_mut().get_mut();
        let svc = this.set.svc.clone();
        let imp = this.set.inner.clone();
        let op = imp.op.clone();

        let canceller = || {
            let svc = svc.clone();
            let imp = imp.clone();
            Box::new(move || svc.cancel_wait(&imp)) as Box<dyn FnOnce() + Send>
        };
        match this.front.poll_ready(&op, "signal wait", cx, canceller) {
            Ready::Pending => return Poll::Pending,
            Ready::Canceled => return Poll::Ready(this.finish(Err(Error::Canceled))),
            Ready::Proceed => {}
        }

        {
            let mut wait = imp.state.lock().unwrap();
            if wait.pending_signal != 0 {
                let signo = wait.pending_signal;
                wait.pending_signal = 0;
                drop(wait);
                return Poll::Ready(this.finish(Ok(signo)));
            }
        }

        op.store_waker(cx.waker());
        match svc.start_wait(&imp) {
            Some(signo) => Poll::Ready(this.finish(Ok(signo))),
            None => Poll::Pending,
        }
    }
}

impl Drop for SignalWait<'_> {
    fn drop(&mut self) {
        let imp = &self.set.inner;
        let mut wait = imp.state.lock().unwrap();
        if wait.waiting {
            // Abandoned mid-wait: release the parked work unit.
            wait.waiting = false;
            drop(wait);
            if imp.op.claim() {
                imp.sched.on_work_finished();
            }
        }
        self.front.finish(&imp.op);
    }
}
