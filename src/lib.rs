//! Asynchronous I/O runtime with per-platform event demultiplexing.
//!
//! This crate provides the building blocks a network server or client
//! needs: a run loop that multiplexes I/O readiness and posted work,
//! cancellable awaitables for connect/accept/read/write/timer/signal
//! operations, and a cooperative ownership model that guarantees a task
//! always resumes on its bound executor.
//!
//! # Architecture
//!
//! - **ExecutionContext**: service registry and owner of the scheduler;
//!   threads drive it through `run`/`poll` and friends
//! - **Scheduler**: multiplexes posted work, reactor readiness, and timer
//!   expirations; its outstanding-work counter bounds the loop's lifetime
//! - **Reactor**: interchangeable backends (`epoll`, `select`, `io_uring`)
//!   behind one registration contract
//! - **I/O objects**: `Socket`, `Acceptor`, `DeadlineTimer`, `SignalSet`,
//!   `Resolver`, each owning a service-managed impl
//! - **Tasks**: `run_async`/`spawn`/`run_on` bind futures to an executor;
//!   wakers route every resume through that executor
//!
//! # Example
//!
//! ```ignore
//! use evio::{ExecutionContext, Acceptor, Socket, run_async};
//!
//! let ctx = ExecutionContext::new();
//! let ex = ctx.executor();
//!
//! let acceptor = Acceptor::new(&ctx);
//! acceptor.open("127.0.0.1:0".parse().unwrap()).unwrap();
//! let addr = acceptor.local_addr().unwrap();
//!
//! run_async(&ex, async move {
//!     let peer = acceptor.accept().await.unwrap();
//!     let mut buf = [0u8; 5];
//!     let n = peer.read_some(&mut buf).await.unwrap();
//!     evio::write_all(&peer, &buf[..n]).await.unwrap();
//! });
//!
//! ctx.run().unwrap();
//! ```

mod builder;
mod cancel;
mod context;
mod error;
mod executor;
mod io;
mod reactor;
mod scheduler;
mod service;
mod task;
mod transfer;

pub use builder::{Backend, ContextBuilder};
pub use cancel::{CancelSource, CancelToken};
pub use context::ExecutionContext;
pub use error::Error;
pub use executor::Executor;
pub use io::acceptor::{Accept, Acceptor};
pub use io::resolver::{Resolve, Resolver};
pub use io::signal::{SignalFlags, SignalService, SignalSet, SignalWait};
pub use io::socket::{Connect, ReadSome, Socket, SocketService, WriteSome};
pub use io::timer::{DeadlineTimer, TimerWait};
pub use service::{FromContext, Service};
pub use task::{run_async, run_on, spawn, yield_now, JoinHandle, JoinSet};
pub use transfer::{read, write_all};
