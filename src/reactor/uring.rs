//! Completion-queue backend over `io_uring`.
//!
//! Where the readiness backends register interest and report ready
//! descriptors, this backend *submits* work to the kernel: each
//! registration places a one-shot poll submission whose completion packet
//! carries a token identifying the operation directly, deregistration
//! submits an async-cancel for that token, and the wakeup event is a poll
//! submission on an eventfd that is re-armed after every firing. The ring
//! structures are mapped and driven directly with raw syscalls.
//!
//! Submissions are serialized by a lock; completions are reaped under the
//! wait lock, so only one thread walks the completion ring at a time while
//! other threads sleep on the lock until the waiter returns.

use crate::io::op::OpState;
use crate::reactor::{ClaimedOps, Interest, Reactor, WakeEvent};

use std::collections::HashMap;
use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const RING_ENTRIES: u32 = 128;

const IORING_OFF_SQ_RING: i64 = 0;
const IORING_OFF_CQ_RING: i64 = 0x0800_0000;
const IORING_OFF_SQES: i64 = 0x1000_0000;

const IORING_ENTER_GETEVENTS: u32 = 1;

const IORING_OP_POLL_ADD: u8 = 6;
const IORING_OP_TIMEOUT: u8 = 11;
const IORING_OP_ASYNC_CANCEL: u8 = 14;

// Tokens for the backend's own submissions; operation tokens start at 0.
const WAKE_TOKEN: u64 = u64::MAX;
const TIMEOUT_TOKEN: u64 = u64::MAX - 1;
const CANCEL_TOKEN: u64 = u64::MAX - 2;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct SqringOffsets {
    head: u32,
    tail: u32,
    ring_mask: u32,
    ring_entries: u32,
    flags: u32,
    dropped: u32,
    array: u32,
    resv1: u32,
    resv2: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CqringOffsets {
    head: u32,
    tail: u32,
    ring_mask: u32,
    ring_entries: u32,
    overflow: u32,
    cqes: u32,
    flags: u32,
    resv1: u32,
    resv2: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct UringParams {
    sq_entries: u32,
    cq_entries: u32,
    flags: u32,
    sq_thread_cpu: u32,
    sq_thread_idle: u32,
    features: u32,
    wq_fd: u32,
    resv: [u32; 3],
    sq_off: SqringOffsets,
    cq_off: CqringOffsets,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Sqe {
    opcode: u8,
    flags: u8,
    ioprio: u16,
    fd: i32,
    off: u64,
    addr: u64,
    len: u32,
    op_flags: u32,
    user_data: u64,
    buf_index: u16,
    personality: u16,
    splice_fd_in: i32,
    addr3: u64,
    pad2: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Cqe {
    user_data: u64,
    res: i32,
    flags: u32,
}

#[repr(C)]
struct KernelTimespec {
    tv_sec: i64,
    tv_nsec: i64,
}

struct Mapping {
    ptr: *mut u8,
    len: usize,
}

impl Mapping {
    fn new(ring_fd: i32, len: usize, offset: i64) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                ring_fd,
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            ptr: ptr as *mut u8,
            len,
        })
    }

    unsafe fn at<T>(&self, offset: u32) -> *mut T {
        self.ptr.add(offset as usize) as *mut T
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut _, self.len);
        }
    }
}

#[derive(Default)]
struct FdEntry {
    read: Option<u64>,
    write: Option<u64>,
}

struct OpTable {
    tokens: HashMap<u64, Arc<OpState>>,
    fds: HashMap<i32, FdEntry>,
}

pub(crate) struct UringReactor {
    ring_fd: i32,
    wake: WakeEvent,
    wake_armed: AtomicBool,
    next_token: AtomicU64,

    sq_ring: Mapping,
    cq_ring: Mapping,
    sqes: Mapping,
    sq_off: SqringOffsets,
    cq_off: CqringOffsets,
    sq_entries: u32,

    submit_lock: Mutex<()>,
    wait_lock: Mutex<()>,
    table: Mutex<OpTable>,
}

unsafe impl Send for UringReactor {}
unsafe impl Sync for UringReactor {}

impl UringReactor {
    pub(crate) fn new() -> io::Result<Self> {
        let mut params = UringParams::default();
        let ring_fd = unsafe {
            libc::syscall(
                libc::SYS_io_uring_setup,
                RING_ENTRIES as libc::c_ulong,
                &mut params as *mut UringParams,
            )
        } as i32;
        if ring_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let sq_len = params.sq_off.array as usize + params.sq_entries as usize * 4;
        let cq_len = params.cq_off.cqes as usize + params.cq_entries as usize * mem::size_of::<Cqe>();
        let sqes_len = params.sq_entries as usize * mem::size_of::<Sqe>();

        let result = (|| {
            let sq_ring = Mapping::new(ring_fd, sq_len, IORING_OFF_SQ_RING)?;
            let cq_ring = Mapping::new(ring_fd, cq_len, IORING_OFF_CQ_RING)?;
            let sqes = Mapping::new(ring_fd, sqes_len, IORING_OFF_SQES)?;
            Ok::<_, io::Error>((sq_ring, cq_ring, sqes))
        })();

        let (sq_ring, cq_ring, sqes) = match result {
            Ok(maps) => maps,
            Err(e) => {
                unsafe { libc::close(ring_fd) };
                return Err(e);
            }
        };

        let wake = match WakeEvent::new() {
            Ok(wake) => wake,
            Err(e) => {
                unsafe { libc::close(ring_fd) };
                return Err(e);
            }
        };

        log::debug!(
            "io_uring ring ready: {} sq entries, {} cq entries",
            params.sq_entries,
            params.cq_entries
        );

        Ok(Self {
            ring_fd,
            wake,
            wake_armed: AtomicBool::new(false),
            next_token: AtomicU64::new(0),
            sq_ring,
            cq_ring,
            sqes,
            sq_off: params.sq_off,
            cq_off: params.cq_off,
            sq_entries: params.sq_entries,
            submit_lock: Mutex::new(()),
            wait_lock: Mutex::new(()),
            table: Mutex::new(OpTable {
                tokens: HashMap::new(),
                fds: HashMap::new(),
            }),
        })
    }

    fn enter(&self, to_submit: u32, min_complete: u32, flags: u32) -> io::Result<u32> {
        let rc = unsafe {
            libc::syscall(
                libc::SYS_io_uring_enter,
                self.ring_fd,
                to_submit as libc::c_ulong,
                min_complete as libc::c_ulong,
                flags as libc::c_ulong,
                ptr::null::<libc::sigset_t>(),
                0usize,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as u32)
    }

    /// Writes one submission entry and hands it to the kernel.
    fn submit(&self, sqe: Sqe) -> io::Result<()> {
        let _guard = self.submit_lock.lock().unwrap();
        unsafe {
            let head = (*self.sq_ring.at::<AtomicU32>(self.sq_off.head)).load(Ordering::Acquire);
            let tail_ptr = self.sq_ring.at::<AtomicU32>(self.sq_off.tail);
            let tail = (*tail_ptr).load(Ordering::Relaxed);
            if tail.wrapping_sub(head) >= self.sq_entries {
                return Err(io::Error::from_raw_os_error(libc::EBUSY));
            }

            let mask = *self.sq_ring.at::<u32>(self.sq_off.ring_mask);
            let index = tail & mask;
            *self.sqes.at::<Sqe>(0).add(index as usize) = sqe;
            *self.sq_ring.at::<u32>(self.sq_off.array).add(index as usize) = index;
            (*tail_ptr).store(tail.wrapping_add(1), Ordering::Release);
        }

        self.enter(1, 0, 0)?;
        Ok(())
    }

    fn submit_poll(&self, fd: i32, interest: Interest, token: u64) -> io::Result<()> {
        let mut events = 0u32;
        if interest.contains(Interest::READ) {
            events |= (libc::POLLIN | libc::POLLRDHUP) as u32;
        }
        if interest.contains(Interest::WRITE) {
            events |= libc::POLLOUT as u32;
        }

        let mut sqe: Sqe = unsafe { mem::zeroed() };
        sqe.opcode = IORING_OP_POLL_ADD;
        sqe.fd = fd;
        sqe.op_flags = events;
        sqe.user_data = token;
        self.submit(sqe)
    }

    fn submit_cancel(&self, token: u64) {
        let mut sqe: Sqe = unsafe { mem::zeroed() };
        sqe.opcode = IORING_OP_ASYNC_CANCEL;
        sqe.fd = -1;
        sqe.addr = token;
        sqe.user_data = CANCEL_TOKEN;
        let _ = self.submit(sqe);
    }

    fn arm_wake(&self) {
        if !self.wake_armed.swap(true, Ordering::AcqRel) {
            let mut sqe: Sqe = unsafe { mem::zeroed() };
            sqe.opcode = IORING_OP_POLL_ADD;
            sqe.fd = self.wake.fd();
            sqe.op_flags = libc::POLLIN as u32;
            sqe.user_data = WAKE_TOKEN;
            if self.submit(sqe).is_err() {
                self.wake_armed.store(false, Ordering::Release);
            }
        }
    }

    /// Resolves a completion token to its operation, removing the table
    /// entries.
    fn resolve(&self, token: u64) -> Option<Arc<OpState>> {
        let mut table = self.table.lock().unwrap();
        let op = table.tokens.remove(&token)?;

        for entry in table.fds.values_mut() {
            if entry.read == Some(token) {
                entry.read = None;
            }
            if entry.write == Some(token) {
                entry.write = None;
            }
        }
        table
            .fds
            .retain(|_, entry| entry.read.is_some() || entry.write.is_some());

        Some(op)
    }

    fn reap(&self, claimed: &mut ClaimedOps) {
        unsafe {
            let head_ptr = self.cq_ring.at::<AtomicU32>(self.cq_off.head);
            let tail = (*self.cq_ring.at::<AtomicU32>(self.cq_off.tail)).load(Ordering::Acquire);
            let mask = *self.cq_ring.at::<u32>(self.cq_off.ring_mask);
            let cqes = self.cq_ring.at::<Cqe>(self.cq_off.cqes);

            let mut head = (*head_ptr).load(Ordering::Relaxed);
            while head != tail {
                let cqe = *cqes.add((head & mask) as usize);
                head = head.wrapping_add(1);

                match cqe.user_data {
                    WAKE_TOKEN => {
                        self.wake.drain();
                        self.wake_armed.store(false, Ordering::Release);
                    }
                    TIMEOUT_TOKEN | CANCEL_TOKEN => {}
                    token => {
                        if let Some(op) = self.resolve(token) {
                            if op.claim() {
                                claimed.push(op);
                            }
                        }
                    }
                }
            }
            (*head_ptr).store(head, Ordering::Release);
        }
    }
}

impl Reactor for UringReactor {
    fn register(&self, fd: i32, interest: Interest, op: &Arc<OpState>) -> io::Result<()> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        {
            let mut table = self.table.lock().unwrap();
            table.tokens.insert(token, op.clone());
            let entry = table.fds.entry(fd).or_default();
            if interest.contains(Interest::READ) {
                entry.read = Some(token);
            }
            if interest.contains(Interest::WRITE) {
                entry.write = Some(token);
            }
        }

        if let Err(e) = self.submit_poll(fd, interest, token) {
            let mut table = self.table.lock().unwrap();
            table.tokens.remove(&token);
            if let Some(entry) = table.fds.get_mut(&fd) {
                if entry.read == Some(token) {
                    entry.read = None;
                }
                if entry.write == Some(token) {
                    entry.write = None;
                }
                if entry.read.is_none() && entry.write.is_none() {
                    table.fds.remove(&fd);
                }
            }
            return Err(e);
        }

        log::trace!("uring: submitted poll for fd {fd} ({interest:?}) as token {token}");
        Ok(())
    }

    fn deregister(&self, fd: i32, interest: Interest) {
        let mut cancel = Vec::new();
        {
            let mut table = self.table.lock().unwrap();
            if let Some(entry) = table.fds.get_mut(&fd) {
                if interest.contains(Interest::READ) {
                    if let Some(token) = entry.read.take() {
                        cancel.push(token);
                    }
                }
                if interest.contains(Interest::WRITE) {
                    if let Some(token) = entry.write.take() {
                        cancel.push(token);
                    }
                }
                if entry.read.is_none() && entry.write.is_none() {
                    table.fds.remove(&fd);
                }
            }
            for token in &cancel {
                table.tokens.remove(token);
            }
        }

        for token in cancel {
            self.submit_cancel(token);
        }
    }

    fn wait(&self, timeout: Option<Duration>, claimed: &mut ClaimedOps) -> io::Result<()> {
        // One thread reaps the completion ring at a time. A thread that
        // finds the lock contended returns empty once the holder is done,
        // so its loop re-evaluates stop/queue state before waiting again
        // (the wakeup that released the holder has been consumed).
        let _guard = match self.wait_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                if timeout.map_or(false, |t| t.is_zero()) {
                    return Ok(());
                }
                drop(self.wait_lock.lock().unwrap());
                return Ok(());
            }
        };

        self.arm_wake();

        // The timespec must outlive the enter call; the kernel copies it
        // while consuming the submission.
        let mut ts = KernelTimespec {
            tv_sec: 0,
            tv_nsec: 0,
        };

        let min_complete = match timeout {
            Some(t) if t.is_zero() => 0,
            Some(t) => {
                ts.tv_sec = t.as_secs() as i64;
                ts.tv_nsec = t.subsec_nanos() as i64;
                let mut sqe: Sqe = unsafe { mem::zeroed() };
                sqe.opcode = IORING_OP_TIMEOUT;
                sqe.fd = -1;
                sqe.addr = &ts as *const KernelTimespec as u64;
                sqe.len = 1;
                sqe.user_data = TIMEOUT_TOKEN;
                self.submit(sqe)?;
                1
            }
            None => 1,
        };

        match self.enter(0, min_complete, IORING_ENTER_GETEVENTS) {
            Ok(_) => {}
            Err(e) => {
                // Reap whatever arrived before the interruption.
                if e.raw_os_error() == Some(libc::EINTR) {
                    self.reap(claimed);
                }
                return Err(e);
            }
        }

        self.reap(claimed);
        Ok(())
    }

    fn wakeup(&self) {
        self.wake.signal();
    }
}

impl Drop for UringReactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.ring_fd);
        }
    }
}
