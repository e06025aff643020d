//! Portable level-triggered backend over `select`.
//!
//! Interest is kept in an ordinary table and rebuilt into descriptor sets
//! for every wait. Because `select` is level-triggered, a claimed slot is
//! simply removed from the table; the kernel holds no per-descriptor state
//! between waits. The backend is bounded by `FD_SETSIZE`: descriptors at or
//! above that value are rejected when the I/O object is opened.

use crate::io::op::OpState;
use crate::reactor::{ClaimedOps, Interest, Reactor, WakeEvent};

use std::collections::HashMap;
use std::io;
use std::mem;
use std::ptr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct FdEntry {
    read: Option<Arc<OpState>>,
    write: Option<Arc<OpState>>,
}

pub(crate) struct SelectReactor {
    wake: WakeEvent,
    entries: Mutex<HashMap<i32, FdEntry>>,
}

impl SelectReactor {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            wake: WakeEvent::new()?,
            entries: Mutex::new(HashMap::new()),
        })
    }
}

impl Reactor for SelectReactor {
    fn register(&self, fd: i32, interest: Interest, op: &Arc<OpState>) -> io::Result<()> {
        if fd as usize >= libc::FD_SETSIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "descriptor exceeds the select backend's FD_SETSIZE bound",
            ));
        }

        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(fd).or_default();
        if interest.contains(Interest::READ) {
            entry.read = Some(op.clone());
        }
        if interest.contains(Interest::WRITE) {
            entry.write = Some(op.clone());
        }
        log::trace!("select: registered fd {fd} for {interest:?}");
        // A concurrent wait is watching an older interest snapshot.
        self.wake.signal();
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
            if entry.read.is_none() && entry.write.is_none() {
                entries.remove(&fd);
            }
        }
    }

    fn wait(&self, timeout: Option<Duration>, claimed: &mut ClaimedOps) -> io::Result<()> {
        let mut read_set: libc::fd_set = unsafe { mem::zeroed() };
        let mut write_set: libc::fd_set = unsafe { mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut read_set);
            libc::FD_ZERO(&mut write_set);
            libc::FD_SET(self.wake.fd(), &mut read_set);
        }
        let mut max_fd = self.wake.fd();

        // Snapshot the interest table; the sets are rebuilt on every wait.
        let watched: Vec<(i32, bool, bool)> = {
            let entries = self.entries.lock().unwrap();
            entries
                .iter()
                .map(|(&fd, entry)| (fd, entry.read.is_some(), entry.write.is_some()))
                .collect()
        };

        for &(fd, read, write) in &watched {
            unsafe {
                if read {
                    libc::FD_SET(fd, &mut read_set);
                }
                if write {
                    libc::FD_SET(fd, &mut write_set);
                }
            }
            if read || write {
                max_fd = max_fd.max(fd);
            }
        }

        let mut tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        let tv_ptr = match timeout {
            None => ptr::null_mut(),
            Some(t) => {
                tv.tv_sec = t.as_secs() as libc::time_t;
                tv.tv_usec = t.subsec_micros() as libc::suseconds_t;
                &mut tv
            }
        };

        let count = unsafe {
            libc::select(
                max_fd + 1,
                &mut read_set,
                &mut write_set,
                ptr::null_mut(),
                tv_ptr,
            )
        };
        if count < 0 {
            let e = io::Error::last_os_error();
            // A descriptor closed between the snapshot and the wait; the
            // table no longer holds it, so the next pass rebuilds clean
            // sets.
            if e.raw_os_error() == Some(libc::EBADF) {
                return Ok(());
            }
            return Err(e);
        }
        if count == 0 {
            return Ok(());
        }

        if unsafe { libc::FD_ISSET(self.wake.fd(), &read_set) } {
            self.wake.drain();
        }

        let mut entries = self.entries.lock().unwrap();
        for &(fd, read, write) in &watched {
            let readable = read && unsafe { libc::FD_ISSET(fd, &read_set) };
            let writable = write && unsafe { libc::FD_ISSET(fd, &write_set) };
            if !readable && !writable {
                continue;
            }

            let Some(entry) = entries.get_mut(&fd) else {
                continue;
            };
            if readable {
                if let Some(op) = entry.read.take() {
                    if op.claim() {
                        claimed.push(op);
                    }
                }
            }
            if writable {
                if let Some(op) = entry.write.take() {
                    if op.claim() {
                        claimed.push(op);
                    }
                }
            }
            if entry.read.is_none() && entry.write.is_none() {
                entries.remove(&fd);
            }
        }

        Ok(())
    }

    fn wakeup(&self) {
        self.wake.signal();
    }

    fn descriptor_limit(&self) -> Option<i32> {
        Some(libc::FD_SETSIZE as i32)
    }
}
