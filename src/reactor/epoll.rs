//! Edge-triggered readiness backend over `epoll`.
//!
//! One kernel registration per descriptor carries the union of its armed
//! interests; a table entry maps the descriptor back to the read and write
//! operation slots. Registration uses `EPOLLET` without one-shot: when an
//! event claims a slot the kernel entry is shrunk (or deleted) under the
//! table lock, so a claimed operation's registration is gone before its
//! completion is queued.
//!
//! Re-registering an armed descriptor always issues `EPOLL_CTL_MOD`, which
//! re-reports a currently-true condition as a fresh edge. This closes the
//! window where readiness arrives between the initiating syscall's
//! would-block and the registration becoming visible.

use crate::io::op::OpState;
use crate::reactor::{timeout_millis, ClaimedOps, Interest, Reactor, WakeEvent};

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const EVENT_BATCH: usize = 64;

#[derive(Default)]
struct FdEntry {
    read: Option<Arc<OpState>>,
    write: Option<Arc<OpState>>,
}

impl FdEntry {
    fn mask(&self) -> u32 {
        let mut mask = libc::EPOLLET as u32;
        if self.read.is_some() {
            mask |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        }
        if self.write.is_some() {
            mask |= libc::EPOLLOUT as u32;
        }
        mask
    }

    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }
}

pub(crate) struct EpollReactor {
    epoll_fd: i32,
    wake: WakeEvent,
    entries: Mutex<HashMap<i32, FdEntry>>,
}

impl EpollReactor {
    pub(crate) fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let wake = match WakeEvent::new() {
            Ok(wake) => wake,
            Err(e) => {
                unsafe { libc::close(epoll_fd) };
                return Err(e);
            }
        };

        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: wake.fd() as u64,
        };
        let rc = unsafe {
            libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wake.fd(), &mut event)
        };
        if rc < 0 {
            let e = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(e);
        }

        Ok(Self {
            epoll_fd,
            wake,
            entries: Mutex::new(HashMap::new()),
        })
    }

    fn ctl(&self, operation: i32, fd: i32, mask: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: mask,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, operation, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Shrinks or deletes the kernel entry after a slot was claimed.
    /// Caller holds the table lock.
    fn sync_entry(&self, entries: &mut HashMap<i32, FdEntry>, fd: i32) {
        let remove = entries.get(&fd).map(|e| e.is_empty()).unwrap_or(false);
        if remove {
            entries.remove(&fd);
            let _ = self.ctl(libc::EPOLL_CTL_DEL, fd, 0);
        } else if let Some(entry) = entries.get(&fd) {
            let _ = self.ctl(libc::EPOLL_CTL_MOD, fd, entry.mask());
        }
    }
}

impl Reactor for EpollReactor {
    fn register(&self, fd: i32, interest: Interest, op: &Arc<OpState>) -> io::Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let known = entries.contains_key(&fd);
        let entry = entries.entry(fd).or_default();

        if interest.contains(Interest::READ) {
            entry.read = Some(op.clone());
        }
        if interest.contains(Interest::WRITE) {
            entry.write = Some(op.clone());
        }

        let mask = entry.mask();
        let operation = if known {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };

        if let Err(e) = self.ctl(operation, fd, mask) {
            // Unwind the slot so a failed registration leaves no trace.
            let entry = entries.get_mut(&fd).unwrap();
            if interest.contains(Interest::READ) {
                entry.read = None;
            }
            if interest.contains(Interest::WRITE) {
                entry.write = None;
            }
            if entry.is_empty() && !known {
                entries.remove(&fd);
            }
            return Err(e);
        }

        log::trace!("epoll: registered fd {fd} for {interest:?}");
        Ok(())
    }

    fn deregister(&self, fd: i32, interest: Interest) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&fd) {
            if interest.contains(Interest::READ) {
                entry.read = None;
            }
            if interest.contains(Interest::WRITE) {
                entry.write = None;
            }
            self.sync_entry(&mut entries, fd);
        }
    }

    fn wait(&self, timeout: Option<Duration>, claimed: &mut ClaimedOps) -> io::Result<()> {
        let mut events: [libc::epoll_event; EVENT_BATCH] =
            unsafe { std::mem::zeroed() };

        let count = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                events.as_mut_ptr(),
                EVENT_BATCH as i32,
                timeout_millis(timeout),
            )
        };
        if count < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut entries = self.entries.lock().unwrap();
        for event in events.iter().take(count as usize) {
            let fd = event.u64 as i32;
            if fd == self.wake.fd() {
                self.wake.drain();
                continue;
            }

            let Some(entry) = entries.get_mut(&fd) else {
                continue;
            };

            let readable = event.events
                & (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32
                != 0;
            let writable =
                event.events & (libc::EPOLLOUT | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0;

            let mut touched = false;
            if readable {
                if let Some(op) = entry.read.take() {
                    touched = true;
                    if op.claim() {
                        claimed.push(op);
                    }
                }
            }
            if writable {
                if let Some(op) = entry.write.take() {
                    touched = true;
                    if op.claim() {
                        claimed.push(op);
                    }
                }
            }
            if touched {
                self.sync_entry(&mut entries, fd);
            }
        }

        Ok(())
    }

    fn wakeup(&self) {
        self.wake.signal();
    }
}

impl Drop for EpollReactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}
