//! Append-only, reference-counted array shared between one writer and its readers.
//!
//! Elements carry a count of readers that have released them. Once every
//! retained reader has released an element, the array drops it and advances its
//! base index; indices are never reused, so a reader holding an index can always
//! tell "not yet written" from "already collected". Finalization freezes the
//! write cursor and wakes all waiting readers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::constants::streaming::{MAX_READERS, WAIT_SLICE};
use crate::constants::tables::SYNC_ARRAY_INITIAL;
use crate::error::{DecoderError, Result};

/// Outcome of waiting for an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The element is available.
    Ready,
    /// The array was finalized below the requested index.
    EndOfData,
    /// The timeout elapsed first.
    TimedOut,
}

struct Inner<T> {
    data: VecDeque<T>,
    seen: VecDeque<u8>,
    base: usize,
    final_next: Option<usize>,
    readers: usize,
    departed: u8,
}

impl<T> Inner<T> {
    fn next_idx(&self) -> usize {
        self.base + self.data.len()
    }

    /// Drop leading elements every reader has released.
    fn collect(&mut self) -> usize {
        let mut freed = 0;
        while let Some(&count) = self.seen.front() {
            if self.readers == 0 || (count as usize) < self.readers {
                break;
            }
            self.seen.pop_front();
            self.data.pop_front();
            self.base += 1;
            freed += 1;
        }
        freed
    }
}

/// Growable shared array with bounded blocking reads.
pub struct SyncArray<T> {
    name: String,
    inner: Mutex<Inner<T>>,
    cond: Condvar,
}

impl<T> std::fmt::Debug for SyncArray<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SyncArray")
            .field("name", &self.name)
            .field("base", &inner.base)
            .field("next", &inner.next_idx())
            .field("final", &inner.final_next)
            .field("readers", &inner.readers)
            .finish()
    }
}

impl<T: Clone> SyncArray<T> {
    /// Create an empty array. The caller holds the writer reference.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                data: VecDeque::with_capacity(SYNC_ARRAY_INITIAL),
                seen: VecDeque::with_capacity(SYNC_ARRAY_INITIAL),
                base: 0,
                final_next: None,
                readers: 0,
                departed: 0,
            }),
            cond: Condvar::new(),
        })
    }

    /// Name used in errors and logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a reader starting at the current base.
    pub fn retain(self: &Arc<Self>) -> Result<SyncReader<T>> {
        let mut inner = self.inner.lock();
        if inner.readers >= MAX_READERS {
            return Err(DecoderError::TooManyReaders {
                buffer: self.name.clone(),
                max: MAX_READERS,
            });
        }
        inner.readers += 1;
        let start = inner.base;
        Ok(SyncReader {
            array: Arc::clone(self),
            released: start,
        })
    }

    /// Append an element, returning its index.
    pub fn append(&self, value: T) -> Result<usize> {
        let mut inner = self.inner.lock();
        if inner.final_next.is_some() {
            return Err(DecoderError::BufferFinalizedWriteAttempt {
                buffer: self.name.clone(),
            });
        }
        if inner.data.len() == inner.data.capacity() {
            let requested = inner.data.len().max(SYNC_ARRAY_INITIAL);
            inner
                .data
                .try_reserve(requested)
                .map_err(|e| DecoderError::growth("sync array", requested * 2, e))?;
            inner
                .seen
                .try_reserve(requested)
                .map_err(|e| DecoderError::growth("sync array", requested * 2, e))?;
        }
        let idx = inner.next_idx();
        let departed = inner.departed;
        inner.data.push_back(value);
        inner.seen.push_back(departed);
        drop(inner);
        self.cond.notify_all();
        Ok(idx)
    }

    /// Freeze the write cursor. Returns the final element count.
    pub fn finalize(&self) -> Result<usize> {
        let mut inner = self.inner.lock();
        if inner.final_next.is_some() {
            return Err(DecoderError::AlreadyFinalized {
                buffer: self.name.clone(),
            });
        }
        let next = inner.next_idx();
        inner.final_next = Some(next);
        drop(inner);
        self.cond.notify_all();
        debug!(buffer = %self.name, elements = next, "Sync array finalized");
        Ok(next)
    }

    /// Whether the writer has finalized.
    pub fn is_finalized(&self) -> bool {
        self.inner.lock().final_next.is_some()
    }

    /// Final element count, once finalized.
    pub fn final_next(&self) -> Option<usize> {
        self.inner.lock().final_next
    }

    /// Index the next append will receive.
    pub fn next_idx(&self) -> usize {
        self.inner.lock().next_idx()
    }

    /// Lowest index still stored.
    pub fn base(&self) -> usize {
        self.inner.lock().base
    }

    /// Number of elements still stored.
    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    /// Whether no elements are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy out element `idx`; `None` if it has not been written yet.
    pub fn get(&self, idx: usize) -> Result<Option<T>> {
        let inner = self.inner.lock();
        if idx < inner.base {
            return Err(DecoderError::StaleIndexRead {
                index: idx,
                base: inner.base,
            });
        }
        Ok(inner.data.get(idx - inner.base).cloned())
    }

    /// Wait until element `idx` exists or the array is finalized below it.
    pub fn wait(&self, idx: usize, timeout: Duration) -> Result<WaitStatus> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if idx < inner.base {
                return Err(DecoderError::StaleIndexRead {
                    index: idx,
                    base: inner.base,
                });
            }
            if idx < inner.next_idx() {
                return Ok(WaitStatus::Ready);
            }
            if inner.final_next.is_some() {
                return Ok(WaitStatus::EndOfData);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitStatus::TimedOut);
            }
            let slice = (deadline - now).min(WAIT_SLICE);
            self.cond.wait_for(&mut inner, slice);
        }
    }

    /// Block until element `idx` exists (`Some`) or the array ends below it (`None`).
    pub fn wait_get(&self, idx: usize) -> Result<Option<T>> {
        loop {
            match self.wait(idx, WAIT_SLICE)? {
                WaitStatus::Ready => return self.get(idx),
                WaitStatus::EndOfData => return Ok(None),
                WaitStatus::TimedOut => trace!(buffer = %self.name, idx, "Still waiting"),
            }
        }
    }

    fn release_range(&self, start: usize, end: usize) -> usize {
        let mut inner = self.inner.lock();
        let lo = start.max(inner.base);
        let hi = end.min(inner.next_idx());
        let base = inner.base;
        for count in inner.seen.range_mut(lo.saturating_sub(base)..hi.saturating_sub(base)) {
            *count = count.saturating_add(1);
        }
        inner.collect();
        inner.base
    }

    fn detach(&self, released: usize) {
        let mut inner = self.inner.lock();
        let base = inner.base;
        let next = inner.next_idx();
        let lo = released.max(base) - base;
        for count in inner.seen.range_mut(lo..next - base) {
            *count = count.saturating_add(1);
        }
        inner.departed = inner.departed.saturating_add(1);
        inner.collect();
    }
}

/// A reader's reference to a [`SyncArray`]. Dropping it releases everything
/// the reader has not released yet.
pub struct SyncReader<T: Clone> {
    array: Arc<SyncArray<T>>,
    released: usize,
}

impl<T: Clone> std::fmt::Debug for SyncReader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncReader")
            .field("array", &self.array.name)
            .field("released", &self.released)
            .finish()
    }
}

impl<T: Clone> SyncReader<T> {
    /// The shared array.
    pub fn array(&self) -> &Arc<SyncArray<T>> {
        &self.array
    }

    /// First index this reader has not released.
    pub fn released(&self) -> usize {
        self.released
    }

    /// Mark `[start, end)` as consumed by this reader. Returns the array's new base.
    ///
    /// Ranges must be released in order; a gap before `start` is an error.
    pub fn release(&mut self, start: usize, end: usize) -> Result<usize> {
        if start > self.released {
            return Err(DecoderError::InvalidInput(format!(
                "release of [{}, {}) on '{}' skips unreleased index {}",
                start, end, self.array.name, self.released
            )));
        }
        let end = end.min(self.array.next_idx());
        if end <= self.released {
            return Ok(self.array.base());
        }
        let base = self.array.release_range(self.released, end);
        self.released = end;
        Ok(base)
    }

    /// Release everything below `end`.
    pub fn release_to(&mut self, end: usize) -> Result<usize> {
        let start = self.released;
        self.release(start, end)
    }
}

impl<T: Clone> Drop for SyncReader<T> {
    fn drop(&mut self) {
        self.array.detach(self.released);
    }
}
