//! Name resolution as an awaitable collaborator.
//!
//! The platform resolver blocks, so each resolve runs on a short-lived
//! helper thread. The operation holds an outstanding-work unit while in
//! flight, keeping the run loop alive until the result has been delivered
//! (or the wait was cancelled, in which case the late result is dropped).

use crate::cancel::{CancelGuard, CancelToken};
use crate::context::ExecutionContext;
use crate::error::Error;
use crate::executor::Executor;

use std::future::Future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::thread;

/// Resolves host/service names to endpoint lists.
pub struct Resolver {
    ex: Executor,
}

impl Resolver {
    pub fn new(ctx: &ExecutionContext) -> Self {
        Self { ex: ctx.executor() }
    }

    /// Resolves `host:port`, yielding every IPv4 endpoint found.
    pub fn resolve(&self, host: &str, port: u16) -> Resolve {
        Resolve {
            ex: self.ex.clone(),
            host: host.to_string(),
            port,
            token: None,
            guard: None,
            shared: None,
        }
    }
}

struct ResolveShared {
    result: Mutex<ResolveSlot>,
}

struct ResolveSlot {
    outcome: Option<io::Result<Vec<SocketAddr>>>,
    waker: Option<Waker>,
}

/// Awaitable returned by [`Resolver::resolve`].
pub struct Resolve {
    ex: Executor,
    host: String,
    port: u16,
    token: Option<CancelToken>,
    guard: Option<CancelGuard>,
    shared: Option<Arc<ResolveShared>>,
}

impl Resolve {
    /// Attaches a cancellation token; cancellation completes the wait with
    /// [`Error::Canceled`] and drops the helper thread's late result.
    pub fn cancel_token(mut self, token: &CancelToken) -> Self {
        self.token = Some(token.clone());
        self
    }
}

impl Future for Resolve {
    type Output = Result<Vec<SocketAddr>, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.as_mut().get_mut();

        if this.token.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Poll::Ready(Err(Error::Canceled));
        }

        if let Some(shared) = &this.shared {
            let mut slot = shared.result.lock().unwrap();
            return match slot.outcome.take() {
                Some(Ok(addrs)) => Poll::Ready(Ok(addrs)),
                Some(Err(e)) => Poll::Ready(Err(e.into())),
                None => {
                    slot.waker = Some(cx.waker().clone());
                    Poll::Pending
                }
            };
        }

        let shared = Arc::new(ResolveShared {
            result: Mutex::new(ResolveSlot {
                outcome: None,
                waker: Some(cx.waker().clone()),
            }),
        });
        this.shared = Some(shared.clone());

        let ex = this.ex.clone();
        let query = (this.host.clone(), this.port);
        ex.on_work_started();

        thread::spawn(move || {
            let outcome = query.to_socket_addrs().map(|addrs| {
                addrs.filter(|a| a.is_ipv4()).collect::<Vec<_>>()
            });

            let waker = {
                let mut slot = shared.result.lock().unwrap();
                slot.outcome = Some(outcome);
                slot.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
            ex.on_work_finished();
        });

        // A triggered token wakes the wait so cancellation is observed; a
        // late wake after completion is harmless.
        if let Some(token) = this.token.clone() {
            let waker = cx.waker().clone();
            this.guard = token.register(Box::new(move || waker.wake()));
        }

        Poll::Pending
    }
}
