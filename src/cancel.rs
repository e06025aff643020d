//! Cooperative cancellation tokens.
//!
//! A [`CancelSource`] owns the cancellation state; any number of
//! [`CancelToken`] clones observe it. An in-flight operation registers a
//! callback for the window in which it is suspended; triggering the source
//! runs every registered callback once, and a callback registered after the
//! trigger runs immediately.
//!
//! Tokens are attached to operations with the `cancel_token` builder on each
//! awaitable. Triggering the token completes the operation with
//! [`Error::Canceled`](crate::Error::Canceled).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

type Callback = Box<dyn FnOnce() + Send>;

struct CancelInner {
    flag: AtomicBool,
    callbacks: Mutex<CallbackList>,
}

#[derive(Default)]
struct CallbackList {
    next_id: u64,
    entries: Vec<(u64, Callback)>,
}

/// The triggering half of a cancellation channel.
pub struct CancelSource {
    inner: Arc<CancelInner>,
}

/// An observer of a [`CancelSource`]; cheap to clone.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

/// Removes a registered callback when dropped, if it has not already run.
pub(crate) struct CancelGuard {
    inner: Arc<CancelInner>,
    id: u64,
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSource {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                flag: AtomicBool::new(false),
                callbacks: Mutex::new(CallbackList::default()),
            }),
        }
    }

    /// Returns a token observing this source.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            inner: self.inner.clone(),
        }
    }

    /// Requests cancellation.
    ///
    /// Every callback registered so far runs exactly once, on the calling
    /// thread. Later registrations run at registration time. Triggering a
    /// second time has no effect.
    pub fn cancel(&self) {
        let drained = {
            let mut list = self.inner.callbacks.lock().unwrap();
            if self.inner.flag.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut list.entries)
        };

        for (_, callback) in drained {
            callback();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// Registers `callback` to run when the source is triggered.
    ///
    /// If the source has already been triggered the callback runs now and
    /// no guard is returned.
    pub(crate) fn register(&self, callback: Callback) -> Option<CancelGuard> {
        {
            let mut list = self.inner.callbacks.lock().unwrap();
            if !self.inner.flag.load(Ordering::Acquire) {
                let id = list.next_id;
                list.next_id += 1;
                list.entries.push((id, callback));
                return Some(CancelGuard {
                    inner: self.inner.clone(),
                    id,
                });
            }
        }

        callback();
        None
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        let mut list = self.inner.callbacks.lock().unwrap();
        list.entries.retain(|(id, _)| *id != self.id);
    }
}
