//! Listening sockets.
//!
//! An [`Acceptor`] binds and listens at open time, then hands out
//! connected [`Socket`]s through its awaitable [`accept`](Acceptor::accept)
//! operation. Accepted peers are materialized as impls of the same socket
//! service that owns the acceptor, with their endpoints cached so later
//! queries are synchronous.

use crate::cancel::CancelToken;
use crate::context::ExecutionContext;
use crate::error::{errno, Error};
use crate::io::endpoint;
use crate::io::op::{self, Armed, OpFrontEnd, OpState, Ready};
use crate::io::socket::{Socket, SocketService};
use crate::reactor::Interest;
use crate::scheduler::core::Scheduler;

use std::future::Future;
use std::mem;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

const DEFAULT_BACKLOG: i32 = 128;

pub(crate) struct AcceptorImpl {
    sched: Arc<Scheduler>,
    fd: AtomicI32,
    acc: Arc<OpState>,
    local: Mutex<Option<SocketAddr>>,
}

impl AcceptorImpl {
    pub(crate) fn new(sched: Arc<Scheduler>) -> Self {
        Self {
            sched,
            fd: AtomicI32::new(-1),
            acc: OpState::new(),
            local: Mutex::new(None),
        }
    }

    fn fd(&self) -> i32 {
        self.fd.load(Ordering::Acquire)
    }

    fn require_open(&self) -> i32 {
        let fd = self.fd();
        assert!(fd >= 0, "acceptor is not open");
        fd
    }

    fn cancel_wait(self: &Arc<Self>) {
        op::cancel_io_op(
            &self.sched,
            &self.acc.clone(),
            self.fd(),
            Interest::READ,
            self.clone(),
        );
    }

    pub(crate) fn close(self: &Arc<Self>) {
        let fd = self.fd();
        if fd < 0 {
            return;
        }
        self.cancel_wait();
        self.fd.store(-1, Ordering::Release);
        unsafe {
            libc::close(fd);
        }
        *self.local.lock().unwrap() = None;
    }
}

/// A listening IPv4 TCP socket producing connected [`Socket`]s.
///
/// # Example
/// ```ignore
/// let acceptor = Acceptor::new(&ctx);
/// acceptor.open("127.0.0.1:0".parse().unwrap())?;
/// let peer = acceptor.accept().await?;
/// ```
pub struct Acceptor {
    svc: Arc<SocketService>,
    inner: Arc<AcceptorImpl>,
}

impl Acceptor {
    pub fn new(ctx: &ExecutionContext) -> Self {
        let svc = ctx.use_service::<SocketService>();
        let inner = svc.create_acceptor_impl();
        Self { svc, inner }
    }

    /// Binds to `addr` (with address reuse) and starts listening. An
    /// acceptor that is already open is closed first.
    pub fn open(&self, addr: SocketAddr) -> Result<(), Error> {
        self.open_with_backlog(addr, DEFAULT_BACKLOG)
    }

    pub fn open_with_backlog(&self, addr: SocketAddr, backlog: i32) -> Result<(), Error> {
        if self.is_open() {
            self.close();
        }

        let fd = self.svc.new_descriptor()?;

        let reuse: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &reuse as *const _ as *const _,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        let raw = match endpoint::to_sockaddr_in(&addr) {
            Ok(raw) => raw,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e.into());
            }
        };
        let rc = unsafe {
            libc::bind(
                fd,
                &raw as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let e = Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(e);
        }

        if unsafe { libc::listen(fd, backlog) } < 0 {
            let e = Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(e);
        }

        self.inner.fd.store(fd, Ordering::Release);
        *self.inner.local.lock().unwrap() = endpoint::local_endpoint(fd).ok();
        Ok(())
    }

    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_open(&self) -> bool {
        self.inner.fd() >= 0
    }

    /// Cancels an outstanding accept; it completes with
    /// [`Error::Canceled`].
    pub fn cancel(&self) {
        self.inner.cancel_wait();
    }

    /// The bound endpoint, resolved at open time. Useful after binding
    /// port zero.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        if let Some(cached) = *self.inner.local.lock().unwrap() {
            return Ok(cached);
        }
        let fd = self.inner.require_open();
        Ok(endpoint::local_endpoint(fd)?)
    }

    /// Waits for the next incoming connection.
    pub fn accept(&self) -> Accept<'_> {
        Accept {
            acceptor: self,
            front: OpFrontEnd::new(),
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.inner.close();
        self.svc.destroy_acceptor_impl(&self.inner);
    }
}

/// Awaitable returned by [`Acceptor::accept`].
pub struct Accept<'a> {
    acceptor: &'a Acceptor,
    front: OpFrontEnd,
}

impl Accept<'_> {
    /// Attaches a cancellation token for the suspension.
    pub fn cancel_token(mut self, token: &CancelToken) -> Self {
        self.front.set_token(token.clone());
        self
    }

    fn finish(&mut self, result: Result<Socket, Error>) -> Result<Socket, Error> {
        self.front.finish(&self.acceptor.inner.acc);
        result
    }

    /// Materializes a peer socket from an accepted descriptor, caching its
    /// endpoints.
    fn make_peer(&self, fd: i32, raw: &libc::sockaddr_in) -> Socket {
        let svc = self.acceptor.svc.clone();
        let imp = svc.create_socket_impl();
        imp.assign(fd);
        imp.set_endpoints(
            endpoint::local_endpoint(fd).ok(),
            Some(endpoint::from_sockaddr_in(raw)),
        );
        Socket::from_parts(svc, imp)
    }
}

impl Future for Accept<'_> {
    type Output = Result<Socket, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.as_mut().get_mut();
        let imp = this.acceptor.inner.clone();
        let op = imp.acc.clone();

        let canceller = || {
            let imp = imp.clone();
            Box::new(move || imp.cancel_wait()) as Box<dyn FnOnce() + Send>
        };
        match this.front.poll_ready(&op, "accept", cx, canceller) {
            Ready::Pending => return Poll::Pending,
            Ready::Canceled => return Poll::Ready(this.finish(Err(Error::Canceled))),
            Ready::Proceed => {}
        }

        let fd = imp.require_open();
        loop {
            let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            let accepted = unsafe {
                libc::accept4(
                    fd,
                    &mut raw as *mut _ as *mut libc::sockaddr,
                    &mut len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if accepted >= 0 {
                let peer = this.make_peer(accepted, &raw);
                return Poll::Ready(this.finish(Ok(peer)));
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

impl Drop for Accept<'_> {
    fn drop(&mut self) {
        let imp = &self.acceptor.inner;
        self.front
            .abandon(&imp.sched, &imp.acc.clone(), imp.fd(), Interest::READ);
    }
}
