//! Buffer-sequence plumbing for the scatter/gather operations.
//!
//! Vectored operations consume at most [`MAX_IOVECS`] descriptors per
//! syscall; longer sequences are truncated to the cap and the caller's
//! transfer loop picks up the rest. `IoSlice`/`IoSliceMut` are
//! ABI-compatible with `iovec` on Unix, so the slices are passed to the
//! kernel directly.

use std::io::{IoSlice, IoSliceMut};

pub(crate) const MAX_IOVECS: usize = 16;

pub(crate) fn read_vec_parts(bufs: &mut [IoSliceMut<'_>]) -> (*mut libc::iovec, usize) {
    let count = bufs.len().min(MAX_IOVECS);
    (bufs.as_mut_ptr() as *mut libc::iovec, count)
}

pub(crate) fn write_vec_parts(bufs: &[IoSlice<'_>]) -> (*const libc::iovec, usize) {
    let count = bufs.len().min(MAX_IOVECS);
    (bufs.as_ptr() as *const libc::iovec, count)
}

pub(crate) fn total_len_mut(bufs: &[IoSliceMut<'_>]) -> usize {
    bufs.iter()
        .take(MAX_IOVECS)
        .map(|b| b.len())
        .sum()
}

pub(crate) fn total_len(bufs: &[IoSlice<'_>]) -> usize {
    bufs.iter().take(MAX_IOVECS).map(|b| b.len()).sum()
}
