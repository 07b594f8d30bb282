//! Memory-bounded article cache
//!
//! The cache hands out [`CachedSegment`] buffers while the total reservation
//! stays within the configured ceiling. Writers that are refused fall back to
//! disk; the [`CacheFlusher`] drains cached segments of idle files to disk in
//! the background.
//!
//! Two lock domains are involved:
//! - the accounting lock, guarding `allocated` (innermost, never held across I/O)
//! - the flush lock, held for a whole drain or cached completion pass; while it
//!   is held the [`flushing`](ArticleCache::flushing) flag is set so writers can
//!   see that memory is about to be freed without touching the lock
//!
//! Per-file segment slots and cached counts are guarded by each file's own
//! content lock (see [`FileInfo::lock_content`](crate::queue::FileInfo::lock_content)).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Notify, watch};

use crate::types::FileId;

mod flusher;
mod marker;
mod segment;

pub use flusher::{CacheFlusher, FlushInputs, FlusherState, high_water_mark, next_state};
pub use marker::spawn_cache_marker_persister;
pub use segment::CachedSegment;

/// Process-wide bounded pool of segment buffers
#[derive(Debug)]
pub struct ArticleCache {
    max_bytes: usize,
    allocated: Mutex<usize>,
    alloc_notify: Notify,
    flush_lock: Mutex<()>,
    flushing: AtomicBool,
    busy_file: Mutex<Option<FileId>>,
    marker: watch::Sender<bool>,
}

impl ArticleCache {
    /// Create a cache with a ceiling of `max_bytes`
    pub fn new(max_bytes: usize) -> Arc<Self> {
        let (marker, _) = watch::channel(false);
        Arc::new(Self {
            max_bytes,
            allocated: Mutex::new(0),
            alloc_notify: Notify::new(),
            flush_lock: Mutex::new(()),
            flushing: AtomicBool::new(false),
            busy_file: Mutex::new(None),
            marker,
        })
    }

    fn lock_allocated(&self) -> MutexGuard<'_, usize> {
        self.allocated.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve a buffer of `size` bytes
    ///
    /// Returns `None` when the reservation would exceed the ceiling or the
    /// memory cannot be obtained. The first reservation into an empty cache
    /// wakes the flusher and raises the "cache not empty" marker.
    pub fn alloc(self: &Arc<Self>, size: usize) -> Option<CachedSegment> {
        let mut allocated = self.lock_allocated();

        if allocated.checked_add(size)? > self.max_bytes {
            return None;
        }

        let mut data = Vec::new();
        if data.try_reserve_exact(size).is_err() {
            tracing::warn!(size, "Could not allocate memory for article cache");
            return None;
        }

        if *allocated == 0 && size > 0 {
            self.marker.send_replace(true);
            // stored as a permit if the flusher is not waiting yet
            self.alloc_notify.notify_one();
        }
        *allocated += size;

        Some(CachedSegment {
            data,
            reserved: size,
            cache: Arc::clone(self),
        })
    }

    /// Shrink a buffer's reservation to `new_size` bytes
    ///
    /// Used when a segment turned out smaller than reserved. Only ever lowers
    /// the accounted size; a `new_size` above the current reservation is
    /// ignored.
    pub fn shrink(&self, segment: &mut CachedSegment, new_size: usize) {
        if new_size >= segment.reserved {
            return;
        }
        segment.data.truncate(new_size);
        segment.data.shrink_to_fit();

        let delta = segment.reserved - new_size;
        segment.reserved = new_size;
        self.free(delta);
    }

    pub(crate) fn free(&self, size: usize) {
        let mut allocated = self.lock_allocated();
        *allocated = allocated.saturating_sub(size);
        if *allocated == 0 {
            self.marker.send_replace(false);
        }
    }

    /// Bytes currently reserved
    pub fn allocated(&self) -> usize {
        *self.lock_allocated()
    }

    /// Ceiling in bytes
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Whether a drain (or cached completion) pass is running
    pub fn flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    /// Acquire the flush lock for the duration of a drain pass
    pub fn guard_flush(&self) -> FlushGuard<'_> {
        let guard = self.flush_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.flushing.store(true, Ordering::Release);
        FlushGuard {
            _guard: guard,
            flushing: &self.flushing,
        }
    }

    /// Whether the flusher is currently draining `file_id`
    pub fn file_busy(&self, file_id: FileId) -> bool {
        *self.busy_file.lock().unwrap_or_else(PoisonError::into_inner) == Some(file_id)
    }

    pub(crate) fn set_busy_file(&self, file_id: Option<FileId>) {
        *self.busy_file.lock().unwrap_or_else(PoisonError::into_inner) = file_id;
    }

    /// Watch the "cache not empty" marker
    pub fn subscribe_marker(&self) -> watch::Receiver<bool> {
        self.marker.subscribe()
    }

    /// Wait until the first reservation into an empty cache
    pub(crate) async fn wait_allocated(&self) {
        self.alloc_notify.notified().await;
    }
}

/// Held for the whole duration of a drain pass; clears the flushing flag on drop
pub struct FlushGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    flushing: &'a AtomicBool,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.flushing.store(false, Ordering::Release);
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    const MB: usize = 1024 * 1024;

    #[test]
    fn alloc_refuses_requests_beyond_the_ceiling() {
        let cache = ArticleCache::new(30 * MB);

        let a = cache.alloc(10 * MB).unwrap();
        let b = cache.alloc(10 * MB).unwrap();
        let c = cache.alloc(10 * MB).unwrap();
        assert_eq!(cache.allocated(), 30 * MB);

        assert!(cache.alloc(MB).is_none());
        assert_eq!(cache.allocated(), 30 * MB, "refused request must not count");

        drop((a, b, c));
        assert_eq!(cache.allocated(), 0);
    }

    #[test]
    fn shrink_only_lowers_the_reservation() {
        let cache = ArticleCache::new(1000);
        let mut segment = cache.alloc(600).unwrap();
        segment.append(&[7u8; 400]);

        cache.shrink(&mut segment, 400);
        assert_eq!(cache.allocated(), 400);
        assert_eq!(segment.reserved(), 400);
        assert_eq!(segment.len(), 400);

        cache.shrink(&mut segment, 900);
        assert_eq!(cache.allocated(), 400, "growing is not allowed");

        drop(segment);
        assert_eq!(cache.allocated(), 0);
    }

    #[test]
    fn bound_holds_over_mixed_operation_sequences() {
        let cache = ArticleCache::new(10_000);
        let mut held = Vec::new();

        for round in 0..200usize {
            let size = (round * 7919) % 3000 + 1;
            if let Some(mut seg) = cache.alloc(size) {
                if round % 3 == 0 {
                    cache.shrink(&mut seg, size / 2);
                }
                held.push(seg);
            }
            if round % 5 == 0 && !held.is_empty() {
                held.remove(0);
            }
            assert!(cache.allocated() <= cache.max_bytes());
            let expected: usize = held.iter().map(|s| s.reserved()).sum();
            assert_eq!(cache.allocated(), expected);
        }
    }

    #[test]
    fn marker_follows_empty_and_non_empty_transitions() {
        let cache = ArticleCache::new(100);
        let marker = cache.subscribe_marker();
        assert!(!*marker.borrow());

        let a = cache.alloc(10).unwrap();
        assert!(*marker.borrow());
        let b = cache.alloc(10).unwrap();

        drop(a);
        assert!(*marker.borrow(), "still non-empty");
        drop(b);
        assert!(!*marker.borrow());
    }

    #[test]
    fn zero_sized_alloc_does_not_raise_marker() {
        let cache = ArticleCache::new(100);
        let marker = cache.subscribe_marker();

        let _seg = cache.alloc(0).unwrap();

        assert!(!*marker.borrow());
    }

    #[test]
    fn flush_guard_sets_and_clears_flushing() {
        let cache = ArticleCache::new(100);
        assert!(!cache.flushing());

        {
            let _guard = cache.guard_flush();
            assert!(cache.flushing());
        }

        assert!(!cache.flushing());
    }

    #[test]
    fn busy_file_is_reported() {
        let cache = ArticleCache::new(100);
        cache.set_busy_file(Some(FileId(4)));

        assert!(cache.file_busy(FileId(4)));
        assert!(!cache.file_busy(FileId(5)));

        cache.set_busy_file(None);
        assert!(!cache.file_busy(FileId(4)));
    }

    #[tokio::test]
    async fn first_allocation_wakes_waiter() {
        let cache = ArticleCache::new(100);
        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.wait_allocated().await })
        };

        let _seg = cache.alloc(10).unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(2), waiter)
            .await
            .expect("waiter was not woken")
            .unwrap();
    }
}
