//! In-memory download queue: downloads, their files and articles.
//!
//! ## Submodules
//!
//! - `nzb`: [`NzbInfo`], one download with its message log and completed files
//! - `file`: [`FileInfo`] and [`ArticleInfo`], the per-file segment state

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::types::{DownloadId, FileId};

mod file;
mod nzb;

pub use file::{ArticleInfo, FileContent, FileInfo, OutputFile, SegmentContent};
pub use nzb::{CompletedFile, DupeMode, NzbInfo};

/// Ordered list of downloads shared by the writers and the cache flusher
#[derive(Debug, Default)]
pub struct DownloadQueue {
    downloads: RwLock<Vec<Arc<NzbInfo>>>,
    next_file_id: AtomicU32,
}

impl DownloadQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a process-unique file ID
    pub fn next_file_id(&self) -> FileId {
        FileId(self.next_file_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Append a download
    pub fn add(&self, nzb: Arc<NzbInfo>) {
        self.downloads
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(nzb);
    }

    /// Remove a download, returning it if it was queued
    pub fn remove(&self, id: DownloadId) -> Option<Arc<NzbInfo>> {
        let mut downloads = self
            .downloads
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let pos = downloads.iter().position(|n| n.id() == id)?;
        Some(downloads.remove(pos))
    }

    /// Look up a download
    pub fn get(&self, id: DownloadId) -> Option<Arc<NzbInfo>> {
        self.downloads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|n| n.id() == id)
            .cloned()
    }

    /// Snapshot of all queued downloads
    pub fn downloads(&self) -> Vec<Arc<NzbInfo>> {
        self.downloads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// First file in queue order that has cached segments and may be drained
    ///
    /// A file qualifies when no article download is running for it, or when
    /// `force` is set (memory pressure or shutdown).
    pub fn find_flush_candidate(&self, force: bool) -> Option<(Arc<NzbInfo>, Arc<FileInfo>)> {
        let downloads = self
            .downloads
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        downloads.iter().find_map(|nzb| {
            nzb.files()
                .into_iter()
                .find(|f| f.cached_articles() > 0 && (f.active_downloads() == 0 || force))
                .map(|f| (Arc::clone(nzb), f))
        })
    }
}
