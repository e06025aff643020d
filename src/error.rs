//! Error values produced by asynchronous operations.
//!
//! Errors are delivered through the awaitable's output, never across a
//! suspension point as a panic. Operating-system failures are surfaced
//! unchanged; cancellation and end-of-stream get distinguished variants so
//! callers can branch without inspecting raw error numbers.

use std::io;

/// The error type for every asynchronous operation in this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The operation was terminated by an explicit `cancel()`, a triggered
    /// cancellation token, or the close of its I/O object.
    #[error("operation canceled")]
    Canceled,

    /// A composed read observed end-of-stream before the buffer was filled.
    ///
    /// `read` carries the number of bytes transferred before the stream
    /// ended.
    #[error("unexpected end of stream after {read} bytes")]
    UnexpectedEof {
        /// Bytes successfully read before end-of-stream.
        read: usize,
    },

    /// An operating-system error, surfaced unchanged.
    #[error(transparent)]
    Os(#[from] io::Error),
}

impl Error {
    /// Builds an `Error::Os` from a raw errno value.
    pub(crate) fn from_errno(errn: i32) -> Self {
        Error::Os(io::Error::from_raw_os_error(errn))
    }

    /// Builds an `Error::Os` from the calling thread's current errno.
    pub(crate) fn last_os_error() -> Self {
        Error::Os(io::Error::last_os_error())
    }

    /// Returns `true` if this is the cancellation error.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }
}

/// Reads the calling thread's errno.
pub(crate) fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canceled_is_distinguished() {
        assert!(Error::Canceled.is_canceled());
        assert!(!Error::from_errno(libc::EPIPE).is_canceled());
    }

    #[test]
    fn os_errors_keep_their_number() {
        match Error::from_errno(libc::ECONNREFUSED) {
            Error::Os(e) => assert_eq!(e.raw_os_error(), Some(libc::ECONNREFUSED)),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
