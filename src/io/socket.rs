//! Asynchronous TCP sockets.
//!
//! A [`Socket`] owns a reference-counted impl created through the
//! per-context socket service. The impl holds the descriptor and one fixed
//! operation slot per kind (connect, read, write); at most one operation
//! of each kind may be in flight, and a second is rejected loudly.
//!
//! Every async operation follows the same shape: try the syscall eagerly,
//! and on would-block register with the reactor through the per-operation
//! state machine. Readiness wakes the task, which retries the syscall with
//! exclusive access to its own buffers. `close()` cancels everything
//! outstanding before releasing the descriptor, and an in-flight
//! completion keeps the impl alive until its dispatch has run.

use crate::cancel::CancelToken;
use crate::context::ExecutionContext;
use crate::error::{errno, Error};
use crate::io::acceptor::AcceptorImpl;
use crate::io::buffers;
use crate::io::endpoint;
use crate::io::op::{self, Armed, OpFrontEnd, OpState, Ready};
use crate::reactor::Interest;
use crate::scheduler::core::Scheduler;
use crate::service::{FromContext, Service};

use std::collections::HashMap;
use std::future::Future;
use std::io::{IoSlice, IoSliceMut};
use std::mem;
use std::net::{Shutdown, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

//--------------------------------------------------------------
// Service
//--------------------------------------------------------------

/// Per-context owner of socket and acceptor impls.
pub struct SocketService {
    sched: Arc<Scheduler>,
    sockets: Mutex<HashMap<usize, Arc<SocketImpl>>>,
    acceptors: Mutex<HashMap<usize, Arc<AcceptorImpl>>>,
}

impl FromContext for SocketService {
    fn from_context(ctx: &ExecutionContext) -> Self {
        Self {
            sched: ctx.scheduler().clone(),
            sockets: Mutex::new(HashMap::new()),
            acceptors: Mutex::new(HashMap::new()),
        }
    }
}

impl Service for SocketService {
    fn shutdown(&self) {
        let sockets: Vec<_> = self.sockets.lock().unwrap().drain().map(|(_, s)| s).collect();
        for imp in sockets {
            imp.close();
        }
        let acceptors: Vec<_> = self
            .acceptors
            .lock()
            .unwrap()
            .drain()
            .map(|(_, a)| a)
            .collect();
        for imp in acceptors {
            imp.close();
        }
    }
}

impl SocketService {
    pub(crate) fn create_socket_impl(&self) -> Arc<SocketImpl> {
        let imp = Arc::new(SocketImpl::new(self.sched.clone()));
        self.sockets
            .lock()
            .unwrap()
            .insert(Arc::as_ptr(&imp) as usize, imp.clone());
        imp
    }

    pub(crate) fn destroy_socket_impl(&self, imp: &Arc<SocketImpl>) {
        self.sockets
            .lock()
            .unwrap()
            .remove(&(Arc::as_ptr(imp) as usize));
    }

    pub(crate) fn create_acceptor_impl(&self) -> Arc<AcceptorImpl> {
        let imp = Arc::new(AcceptorImpl::new(self.sched.clone()));
        self.acceptors
            .lock()
            .unwrap()
            .insert(Arc::as_ptr(&imp) as usize, imp.clone());
        imp
    }

    pub(crate) fn destroy_acceptor_impl(&self, imp: &Arc<AcceptorImpl>) {
        self.acceptors
            .lock()
            .unwrap()
            .remove(&(Arc::as_ptr(imp) as usize));
    }

    /// Creates a non-blocking TCP descriptor, honoring the backend's
    /// descriptor bound.
    pub(crate) fn new_descriptor(&self) -> Result<i32, Error> {
        let fd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(Error::last_os_error());
        }
        if let Some(limit) = self.sched.reactor().descriptor_limit() {
            if fd >= limit {
                unsafe { libc::close(fd) };
                return Err(Error::Os(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "descriptor exceeds the backend's limit",
                )));
            }
        }
        Ok(fd)
    }
}

//--------------------------------------------------------------
// Impl
//--------------------------------------------------------------

pub(crate) struct SocketImpl {
    sched: Arc<Scheduler>,
    fd: AtomicI32,
    conn: Arc<OpState>,
    rd: Arc<OpState>,
    wr: Arc<OpState>,
    local: Mutex<Option<SocketAddr>>,
    peer: Mutex<Option<SocketAddr>>,
}

impl SocketImpl {
    fn new(sched: Arc<Scheduler>) -> Self {
        Self {
            sched,
            fd: AtomicI32::new(-1),
            conn: OpState::new(),
            rd: OpState::new(),
            wr: OpState::new(),
            local: Mutex::new(None),
            peer: Mutex::new(None),
        }
    }

    pub(crate) fn fd(&self) -> i32 {
        self.fd.load(Ordering::Acquire)
    }

    fn require_open(&self) -> i32 {
        let fd = self.fd();
        assert!(fd >= 0, "socket is not open");
        fd
    }

    pub(crate) fn assign(&self, fd: i32) {
        self.fd.store(fd, Ordering::Release);
    }

    pub(crate) fn set_endpoints(&self, local: Option<SocketAddr>, peer: Option<SocketAddr>) {
        *self.local.lock().unwrap() = local;
        *self.peer.lock().unwrap() = peer;
    }

    fn cancel_slot(self: &Arc<Self>, op: &Arc<OpState>, interest: Interest) {
        op::cancel_io_op(&self.sched, op, self.fd(), interest, self.clone());
    }

    pub(crate) fn cancel_all(self: &Arc<Self>) {
        self.cancel_slot(&self.conn.clone(), Interest::WRITE);
        self.cancel_slot(&self.rd.clone(), Interest::READ);
        self.cancel_slot(&self.wr.clone(), Interest::WRITE);
    }

    /// Cancels everything outstanding, then releases the descriptor.
    pub(crate) fn close(self: &Arc<Self>) {
        let fd = self.fd();
        if fd < 0 {
            return;
        }
        self.cancel_all();
        self.fd.store(-1, Ordering::Release);
        unsafe {
            libc::close(fd);
        }
        self.set_endpoints(None, None);
    }
}

//--------------------------------------------------------------
// Public handle
//--------------------------------------------------------------

/// An asynchronous IPv4 TCP socket.
///
/// Operations return awaitables; each may carry a cancellation token via
/// its `cancel_token` builder. Distinct sockets are safe to use from
/// different threads; one read and one write may be in flight on the same
/// socket simultaneously, but a second operation of the same kind panics.
///
/// # Example
/// ```ignore
/// let sock = Socket::new(&ctx);
/// sock.open()?;
/// sock.connect(addr).await?;
/// let n = sock.read_some(&mut buf).await?;
/// ```
pub struct Socket {
    svc: Arc<SocketService>,
    inner: Arc<SocketImpl>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket").finish_non_exhaustive()
    }
}

impl Socket {
    pub fn new(ctx: &ExecutionContext) -> Self {
        let svc = ctx.use_service::<SocketService>();
        let inner = svc.create_socket_impl();
        Self { svc, inner }
    }

    pub(crate) fn from_parts(svc: Arc<SocketService>, inner: Arc<SocketImpl>) -> Self {
        Self { svc, inner }
    }

    /// Creates the descriptor and places it in non-blocking mode. A socket
    /// that is already open is closed first.
    pub fn open(&self) -> Result<(), Error> {
        if self.is_open() {
            self.close();
        }
        let fd = self.svc.new_descriptor()?;
        self.inner.assign(fd);
        Ok(())
    }

    /// Cancels outstanding operations and releases the descriptor. The
    /// socket may be opened again afterwards.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_open(&self) -> bool {
        self.inner.fd() >= 0
    }

    /// Cancels every outstanding operation on this socket; each completes
    /// with [`Error::Canceled`].
    pub fn cancel(&self) {
        self.inner.cancel_all();
    }

    /// Half-closes the connection.
    pub fn shutdown(&self, how: Shutdown) -> Result<(), Error> {
        let fd = self.inner.require_open();
        let how = match how {
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Both => libc::SHUT_RDWR,
        };
        let rc = unsafe { libc::shutdown(fd, how) };
        if rc < 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    /// The endpoint this socket is bound to, cached on connect/accept.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        if let Some(cached) = *self.inner.local.lock().unwrap() {
            return Ok(cached);
        }
        let fd = self.inner.fd();
        if fd < 0 {
            return Err(Error::from_errno(libc::EBADF));
        }
        Ok(endpoint::local_endpoint(fd)?)
    }

    /// The connected peer's endpoint, cached on connect/accept.
    pub fn peer_addr(&self) -> Result<SocketAddr, Error> {
        if let Some(cached) = *self.inner.peer.lock().unwrap() {
            return Ok(cached);
        }
        let fd = self.inner.fd();
        if fd < 0 {
            return Err(Error::from_errno(libc::EBADF));
        }
        Ok(endpoint::peer_endpoint(fd)?)
    }

    /// Connects to `addr`. Completes with `Ok(())` once the connection is
    /// established.
    pub fn connect(&self, addr: SocketAddr) -> Connect<'_> {
        Connect {
            sock: self,
            addr,
            initiated: false,
            front: OpFrontEnd::new(),
        }
    }

    /// Reads whatever is available into `buf`, completing once at least
    /// one byte arrived. `Ok(0)` on a non-empty buffer means the peer
    /// closed the stream; an empty buffer completes immediately with zero.
    pub fn read_some<'a>(&'a self, buf: &'a mut [u8]) -> ReadSome<'a, 'a> {
        ReadSome {
            sock: self,
            bufs: ReadBufs::Single(buf),
            front: OpFrontEnd::new(),
        }
    }

    /// Scatter variant of [`read_some`](Self::read_some); at most 16
    /// buffers are used per attempt.
    pub fn read_some_vectored<'a, 'b>(
        &'a self,
        bufs: &'a mut [IoSliceMut<'b>],
    ) -> ReadSome<'a, 'b> {
        ReadSome {
            sock: self,
            bufs: ReadBufs::Vectored(bufs),
            front: OpFrontEnd::new(),
        }
    }

    /// Writes from `buf`, completing once at least one byte was accepted.
    pub fn write_some<'a>(&'a self, buf: &'a [u8]) -> WriteSome<'a, 'a> {
        WriteSome {
            sock: self,
            bufs: WriteBufs::Single(buf),
            front: OpFrontEnd::new(),
        }
    }

    /// Gather variant of [`write_some`](Self::write_some); at most 16
    /// buffers are used per attempt.
    pub fn write_some_vectored<'a, 'b>(&'a self, bufs: &'a [IoSlice<'b>]) -> WriteSome<'a, 'b> {
        WriteSome {
            sock: self,
            bufs: WriteBufs::Vectored(bufs),
            front: OpFrontEnd::new(),
        }
    }

}

impl Drop for Socket {
    fn drop(&mut self) {
        self.inner.close();
        self.svc.destroy_socket_impl(&self.inner);
    }
}

//--------------------------------------------------------------
// Connect
//--------------------------------------------------------------

/// Awaitable returned by [`Socket::connect`].
pub struct Connect<'a> {
    sock: &'a Socket,
    addr: SocketAddr,
    initiated: bool,
    front: OpFrontEnd,
}

impl Connect<'_> {
    /// Attaches a cancellation token for the suspension.
    pub fn cancel_token(mut self, token: &CancelToken) -> Self {
        self.front.set_token(token.clone());
        self
    }

    fn finish(&mut self, result: Result<(), Error>) -> Result<(), Error> {
        self.front.finish(&self.sock.inner.conn);
        result
    }
}

impl Future for Connect<'_> {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.as_mut().get_mut();
        let imp = this.sock.inner.clone();
        let op = imp.conn.clone();

        let canceller = || {
            let imp = imp.clone();
            let op = op.clone();
            Box::new(move || imp.cancel_slot(&op, Interest::WRITE)) as Box<dyn FnOnce() + Send>
        };
        match this.front.poll_ready(&op, "connect", cx, canceller) {
            Ready::Pending => return Poll::Pending,
            Ready::Canceled => return Poll::Ready(this.finish(Err(Error::Canceled))),
            Ready::Proceed => {}
        }

        let fd = imp.require_open();

        if this.initiated {
            // Readiness after an in-progress connect: the outcome is in
            // SO_ERROR, not in a syscall return value.
            let mut err: libc::c_int = 0;
            let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
            let rc = unsafe {
                libc::getsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_ERROR,
                    &mut err as *mut _ as *mut _,
                    &mut len,
                )
            };
            if rc < 0 {
                err = errno();
            }
            if err != 0 {
                return Poll::Ready(this.finish(Err(Error::from_errno(err))));
            }
            imp.set_endpoints(endpoint::local_endpoint(fd).ok(), Some(this.addr));
            return Poll::Ready(this.finish(Ok(())));
        }

        let raw = match endpoint::to_sockaddr_in(&this.addr) {
            Ok(raw) => raw,
            Err(e) => return Poll::Ready(this.finish(Err(e.into()))),
        };

        this.initiated = true;
        let rc = unsafe {
            libc::connect(
                fd,
                &raw as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc == 0 {
            imp.set_endpoints(endpoint::local_endpoint(fd).ok(), Some(this.addr));
            return Poll::Ready(this.finish(Ok(())));
        }

        match errno() {
            libc::EINPROGRESS | libc::EINTR => {}
            err => return Poll::Ready(this.finish(Err(Error::from_errno(err)))),
        }

        match op::arm(&imp.sched, &op, fd, Interest::WRITE, cx) {
            Armed::Waiting => Poll::Pending,
            Armed::Canceled => Poll::Ready(this.finish(Err(Error::Canceled))),
            Armed::Failed(e) => Poll::Ready(this.finish(Err(e))),
        }
    }
}

impl Drop for Connect<'_> {
    fn drop(&mut self) {
        let imp = &self.sock.inner;
        self.front
            .abandon(&imp.sched, &imp.conn.clone(), imp.fd(), Interest::WRITE);
    }
}

//--------------------------------------------------------------
// Read
//--------------------------------------------------------------

enum ReadBufs<'a, 'b> {
    Single(&'a mut [u8]),
    Vectored(&'a mut [IoSliceMut<'b>]),
}

impl ReadBufs<'_, '_> {
    fn total_len(&self) -> usize {
        match self {
            ReadBufs::Single(buf) => buf.len(),
            ReadBufs::Vectored(bufs) => buffers::total_len_mut(bufs),
        }
    }

    /// Performs the read. Returns the raw syscall result.
    fn read(&mut self, fd: i32) -> isize {
        match self {
            ReadBufs::Single(buf) => {
                let iov = libc::iovec {
                    iov_base: buf.as_mut_ptr() as *mut _,
                    iov_len: buf.len(),
                };
                unsafe { libc::readv(fd, &iov, 1) }
            }
            ReadBufs::Vectored(bufs) => {
                let (ptr, count) = buffers::read_vec_parts(bufs);
                unsafe { libc::readv(fd, ptr, count as libc::c_int) }
            }
        }
    }
}

/// Awaitable returned by [`Socket::read_some`].
pub struct ReadSome<'a, 'b> {
    sock: &'a Socket,
    bufs: ReadBufs<'a, 'b>,
    front: OpFrontEnd,
}

impl ReadSome<'_, '_> {
    /// Attaches a cancellation token for the suspension.
    pub fn cancel_token(mut self, token: &CancelToken) -> Self {
        self.front.set_token(token.clone());
        self
    }

    fn finish(&mut self, result: Result<usize, Error>) -> Result<usize, Error> {
        self.front.finish(&self.sock.inner.rd);
        result
    }
}

impl Future for ReadSome<'_, '_> {
    type Output = Result<usize, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.as_mut().get_mut();
        let imp = this.sock.inner.clone();
        let op = imp.rd.clone();

        let canceller = || {
            let imp = imp.clone();
            let op = op.clone();
            Box::new(move || imp.cancel_slot(&op, Interest::READ)) as Box<dyn FnOnce() + Send>
        };
        match this.front.poll_ready(&op, "read_some", cx, canceller) {
            Ready::Pending => return Poll::Pending,
            Ready::Canceled => return Poll::Ready(this.finish(Err(Error::Canceled))),
            Ready::Proceed => {}
        }

        // A zero-length request completes without touching the reactor and
        // without implying end-of-stream.
        if this.bufs.total_len() == 0 {
            return Poll::Ready(this.finish(Ok(0)));
        }

        let fd = imp.require_open();
        loop {
            let n = this.bufs.read(fd);
            if n >= 0 {
                return Poll::Ready(this.finish(Ok(n as usize)));
            }
            match errno() {
                libc::EINTR => continue,
                libc::EAGAIN => break,
                err if err == libc::EWOULDBLOCK => break,
                err => return Poll::Ready(this.finish(Err(Error::from_errno(err)))),
            }
        }

        match op::arm(&imp.sched, &op, fd, Interest::READ, cx) {
            Armed::Waiting => Poll::Pending,
            Armed::Canceled => Poll::Ready(this.finish(Err(Error::Canceled))),
            Armed::Failed(e) => Poll::Ready(this.finish(Err(e))),
        }
    }
}

impl Drop for ReadSome<'_, '_> {
    fn drop(&mut self) {
        let imp = &self.sock.inner;
        self.front
            .abandon(&imp.sched, &imp.rd.clone(), imp.fd(), Interest::READ);
    }
}

//--------------------------------------------------------------
// Write
//--------------------------------------------------------------

enum WriteBufs<'a, 'b> {
    Single(&'a [u8]),
    Vectored(&'a [IoSlice<'b>]),
}

impl WriteBufs<'_, '_> {
    fn total_len(&self) -> usize {
        match self {
            WriteBufs::Single(buf) => buf.len(),
            WriteBufs::Vectored(bufs) => buffers::total_len(bufs),
        }
    }

    /// Performs the write with `sendmsg` so a peer reset raises an error
    /// instead of a process-wide signal.
    fn write(&self, fd: i32) -> isize {
        let single_iov;
        let (iov_ptr, count) = match self {
            WriteBufs::Single(buf) => {
                single_iov = libc::iovec {
                    iov_base: buf.as_ptr() as *mut _,
                    iov_len: buf.len(),
                };
                (&single_iov as *const libc::iovec, 1)
            }
            WriteBufs::Vectored(bufs) => buffers::write_vec_parts(bufs),
        };

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = iov_ptr as *mut libc::iovec;
        msg.msg_iovlen = count;
        unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) }
    }
}

/// Awaitable returned by [`Socket::write_some`].
pub struct WriteSome<'a, 'b> {
    sock: &'a Socket,
    bufs: WriteBufs<'a, 'b>,
    front: OpFrontEnd,
}

impl WriteSome<'_, '_> {
    /// Attaches a cancellation token for the suspension.
    pub fn cancel_token(mut self, token: &CancelToken) -> Self {
        self.front.set_token(token.clone());
        self
    }

    fn finish(&mut self, result: Result<usize, Error>) -> Result<usize, Error> {
        self.front.finish(&self.sock.inner.wr);
        result
    }
}

impl Future for WriteSome<'_, '_> {
    type Output = Result<usize, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.as_mut().get_mut();
        let imp = this.sock.inner.clone();
        let op = imp.wr.clone();

        let canceller = || {
            let imp = imp.clone();
            let op = op.clone();
            Box::new(move || imp.cancel_slot(&op, Interest::WRITE)) as Box<dyn FnOnce() + Send>
        };
        match this.front.poll_ready(&op, "write_some", cx, canceller) {
            Ready::Pending => return Poll::Pending,
            Ready::Canceled => return Poll::Ready(this.finish(Err(Error::Canceled))),
            Ready::Proceed => {}
        }

        if this.bufs.total_len() == 0 {
            return Poll::Ready(this.finish(Ok(0)));
        }

        let fd = imp.require_open();
        loop {
            let n = this.bufs.write(fd);
            if n >= 0 {
                return Poll::Ready(this.finish(Ok(n as usize)));
            }
            match errno() {
                libc::EINTR => continue,
                libc::EAGAIN => break,
                err if err == libc::EWOULDBLOCK => break,
                err => return Poll::Ready(this.finish(Err(Error::from_errno(err)))),
            }
        }

        match op::arm(&imp.sched, &op, fd, Interest::WRITE, cx) {
            Armed::Waiting => Poll::Pending,
            Armed::Canceled => Poll::Ready(this.finish(Err(Error::Canceled))),
            Armed::Failed(e) => Poll::Ready(this.finish(Err(e))),
        }
    }
}

impl Drop for WriteSome<'_, '_> {
    fn drop(&mut self) {
        let imp = &self.sock.inner;
        self.front
            .abandon(&imp.sched, &imp.wr.clone(), imp.fd(), Interest::WRITE);
    }
}
