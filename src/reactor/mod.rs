//! Platform event demultiplexers.
//!
//! All backends present the same contract to the scheduler: register a
//! descriptor for read or write interest on behalf of an operation, remove
//! that interest, block until something is ready, and unblock a concurrent
//! wait from another thread. Registration is an upsert: registering a second
//! interest on a descriptor updates the existing kernel entry.
//!
//! `wait` hands back operations that the backend has already *claimed*
//! through the atomic exchange on their registration state; the scheduler
//! only queues them. A descriptor's kernel registration is removed before
//! its operation is handed back, so a completed or cancelled operation never
//! leaves residue in the kernel.
//!
//! Three interchangeable backends, selected at context construction:
//!
//! - [`epoll`]: edge-triggered readiness (the default on Linux)
//! - [`select`]: portable level-triggered readiness, interest sets rebuilt
//!   for every wait, bounded by `FD_SETSIZE`
//! - [`uring`]: completion-queue submissions; each registration is a
//!   one-shot poll submission whose completion identifies the operation

use crate::io::op::OpState;

use std::io;
use std::sync::Arc;
use std::time::Duration;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub(crate) mod epoll;
        pub(crate) mod uring;
    }
}
pub(crate) mod select;

bitflags::bitflags! {
    /// Readiness interest for a registration.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct Interest: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

/// Operations claimed by a backend during one `wait`, ready to be queued.
pub(crate) type ClaimedOps = Vec<Arc<OpState>>;

pub(crate) trait Reactor: Send + Sync {
    /// Registers (or updates) interest in `fd` on behalf of `op`.
    fn register(&self, fd: i32, interest: Interest, op: &Arc<OpState>) -> io::Result<()>;

    /// Removes interest in `fd`. The caller has already claimed the
    /// operation; errors are ignored because the descriptor may be gone.
    fn deregister(&self, fd: i32, interest: Interest);

    /// Blocks for at most `timeout` (`None` blocks indefinitely), claiming
    /// every operation whose descriptor became ready into `claimed`.
    fn wait(&self, timeout: Option<Duration>, claimed: &mut ClaimedOps) -> io::Result<()>;

    /// Unblocks a concurrent `wait` from any thread.
    fn wakeup(&self);

    /// Largest descriptor value this backend can service, if bounded.
    /// Descriptors at or above the limit are rejected at open time.
    fn descriptor_limit(&self) -> Option<i32> {
        None
    }
}

/// An eventfd used as the always-registered wakeup event of a backend.
pub(crate) struct WakeEvent {
    fd: i32,
}

impl WakeEvent {
    pub(crate) fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    pub(crate) fn fd(&self) -> i32 {
        self.fd
    }

    /// Posts one wakeup; concurrent posts accumulate into one read.
    pub(crate) fn signal(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(self.fd, &one as *const u64 as *const _, 8);
        }
    }

    /// Consumes pending wakeups.
    pub(crate) fn drain(&self) {
        let mut value: u64 = 0;
        unsafe {
            libc::read(self.fd, &mut value as *mut u64 as *mut _, 8);
        }
    }
}

impl Drop for WakeEvent {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Converts the scheduler's effective timeout to milliseconds for the
/// kernel, rounding up so a short deadline is never spun through early.
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(t) => {
            let millis = t.as_millis();
            let rounded = if t.subsec_nanos() % 1_000_000 != 0 {
                millis + 1
            } else {
                millis
            };
            rounded.min(i32::MAX as u128) as i32
        }
    }
}
