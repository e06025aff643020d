//! Tasks: futures bound to an executor.
//!
//! A task wraps a future together with the executor it must resume on.
//! Waking the task enqueues exactly one poll through that executor, so a
//! task is never polled on a thread that is not driving its scheduler, and
//! duplicate wakes between polls coalesce.

use crate::executor::Executor;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

pub(crate) struct TaskCore {
    future: Mutex<Option<Pin<Box<dyn Future<Output = ()> + Send>>>>,
    executor: Executor,
    queued: AtomicBool,
}

impl TaskCore {
    pub(crate) fn new<F>(executor: Executor, future: F) -> Arc<Self>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Arc::new(Self {
            future: Mutex::new(Some(Box::pin(future))),
            executor,
            queued: AtomicBool::new(false),
        })
    }

    /// Polls the task once. Runs only from the scheduler loop.
    pub(crate) fn run(self: &Arc<Self>) {
        // Clear before polling so a wake arriving mid-poll queues a re-run.
        self.queued.store(false, Ordering::Release);

        let waker = make_waker(self.clone());
        let mut cx = Context::from_waker(&waker);

        let mut slot = self.future.lock().unwrap();
        if let Some(future) = slot.as_mut() {
            if let Poll::Ready(()) = future.as_mut().poll(&mut cx) {
                *slot = None;
            }
        }
    }

    /// Enqueues one poll unless one is already queued.
    pub(crate) fn schedule(self: &Arc<Self>) {
        if !self.queued.swap(true, Ordering::AcqRel) {
            self.executor.schedule_task(self.clone());
        }
    }
}

//--------------------------------------------------------------
// Waker
//--------------------------------------------------------------

const VTABLE: RawWakerVTable = RawWakerVTable::new(clone_raw, wake_raw, wake_by_ref_raw, drop_raw);

fn clone_raw(data: *const ()) -> RawWaker {
    let task = unsafe { Arc::from_raw(data as *const TaskCore) };
    let cloned = task.clone();
    std::mem::forget(task);
    RawWaker::new(Arc::into_raw(cloned) as *const (), &VTABLE)
}

fn wake_raw(data: *const ()) {
    let task = unsafe { Arc::from_raw(data as *const TaskCore) };
    task.schedule();
}

fn wake_by_ref_raw(data: *const ()) {
    let task = unsafe { Arc::from_raw(data as *const TaskCore) };
    task.schedule();
    std::mem::forget(task);
}

fn drop_raw(data: *const ()) {
    unsafe {
        drop(Arc::from_raw(data as *const TaskCore));
    }
}

/// Builds a waker that re-queues the task through its bound executor.
pub(crate) fn make_waker(task: Arc<TaskCore>) -> Waker {
    let raw = RawWaker::new(Arc::into_raw(task) as *const (), &VTABLE);
    unsafe { Waker::from_raw(raw) }
}

//--------------------------------------------------------------
// Join handles
//--------------------------------------------------------------

struct JoinShared<T> {
    result: Mutex<Option<T>>,
    completed: AtomicBool,
    waiters: Mutex<Vec<Waker>>,
}

/// A future resolving to a spawned task's output.
pub struct JoinHandle<T> {
    shared: Arc<JoinShared<T>>,
}

impl<T: Send> Future for JoinHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.shared.completed.load(Ordering::Acquire) {
            self.shared.waiters.lock().unwrap().push(cx.waker().clone());
            // Re-check after publishing the waker so a completion that
            // raced the push is not missed.
            if !self.shared.completed.load(Ordering::Acquire) {
                return Poll::Pending;
            }
        }

        let result = self
            .shared
            .result
            .lock()
            .unwrap()
            .take()
            .expect("task completed but result missing");
        Poll::Ready(result)
    }
}

/// Starts `future` as a task on `executor` and returns a handle to its
/// output.
pub fn spawn<F, T>(executor: &Executor, future: F) -> JoinHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let shared = Arc::new(JoinShared {
        result: Mutex::new(None),
        completed: AtomicBool::new(false),
        waiters: Mutex::new(Vec::new()),
    });

    let completion = shared.clone();
    let task = TaskCore::new(executor.clone(), async move {
        let output = future.await;
        *completion.result.lock().unwrap() = Some(output);
        completion.completed.store(true, Ordering::Release);
        for waker in completion.waiters.lock().unwrap().drain(..) {
            waker.wake();
        }
    });

    executor.post_task(task);
    JoinHandle { shared }
}

/// Starts a detached task on `executor`.
///
/// The task is fire-and-forget: there is no handle and no way to retrieve
/// a result. A panic escaping the root future terminates the process —
/// errors are expected to be handled at the task boundary.
pub fn run_async<F>(executor: &Executor, future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let task = TaskCore::new(executor.clone(), RootTask { inner: future });
    executor.post_task(task);
}

struct RootTask<F> {
    inner: F,
}

impl<F: Future<Output = ()>> Future for RootTask<F> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = unsafe { self.map_unchecked_mut(|s| &mut s.inner) };
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut cx = Context::from_waker(cx.waker());
            inner.poll(&mut cx)
        })) {
            Ok(poll) => poll,
            Err(_) => {
                log::error!("panic escaped a detached root task; aborting");
                std::process::abort();
            }
        }
    }
}

/// Runs `future` bound to `executor` and awaits its output from the
/// calling task.
pub async fn run_on<F, T>(executor: &Executor, future: F) -> T
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    spawn(executor, future).await
}

/// A set of join handles awaited together.
pub struct JoinSet<T> {
    handles: Vec<JoinHandle<T>>,
}

impl<T: Send> JoinSet<T> {
    pub fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    pub fn push(&mut self, handle: JoinHandle<T>) {
        self.handles.push(handle);
    }

    pub async fn await_all(&mut self) -> Vec<T> {
        let mut outputs = Vec::with_capacity(self.handles.len());
        for handle in self.handles.drain(..) {
            outputs.push(handle.await);
        }
        outputs
    }
}

impl<T: Send> Default for JoinSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Cooperative scheduler hint: yields once so other queued work runs.
///
/// The returned future is `Pending` on its first poll and immediately
/// schedules the task to be polled again.
pub async fn yield_now() {
    struct YieldOnce(bool);

    impl Future for YieldOnce {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
            if !self.0 {
                self.0 = true;
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            Poll::Ready(())
        }
    }

    YieldOnce(false).await
}
