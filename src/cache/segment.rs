//! Owned, size-tagged cache buffer holding one segment's decoded bytes.

use std::sync::Arc;

use super::ArticleCache;

/// Segment bytes held in the article cache
///
/// The buffer owns a reservation of `reserved` bytes in its [`ArticleCache`].
/// Dropping it (or calling [`release`](CachedSegment::release)) returns the
/// reservation; moving it into a segment slot transfers ownership without
/// copying, so a reservation is released exactly once.
pub struct CachedSegment {
    pub(super) data: Vec<u8>,
    pub(super) reserved: usize,
    pub(super) cache: Arc<ArticleCache>,
}

impl CachedSegment {
    /// Bytes written so far
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Number of bytes written so far
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing was written yet
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes accounted against the cache for this buffer
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Append bytes, capped at the reserved size; returns how many were taken
    pub fn append(&mut self, buf: &[u8]) -> usize {
        let room = self.reserved.saturating_sub(self.data.len());
        let take = buf.len().min(room);
        self.data.extend_from_slice(&buf[..take]);
        take
    }

    /// Return the buffer to the cache
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for CachedSegment {
    fn drop(&mut self) {
        if self.reserved > 0 {
            self.cache.free(self.reserved);
            self.reserved = 0;
        }
    }
}

impl std::fmt::Debug for CachedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedSegment")
            .field("len", &self.data.len())
            .field("reserved", &self.reserved)
            .finish()
    }
}
