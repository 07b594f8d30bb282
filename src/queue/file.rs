//! Files of a download and the articles (segments) they are made of.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use crate::cache::CachedSegment;
use crate::types::{ArticleStatus, FileId};

/// Where the bytes of a finished segment currently live
#[derive(Debug, Default)]
pub enum SegmentContent {
    /// Nothing stored (not downloaded yet, failed, or consumed by completion)
    #[default]
    Absent,
    /// Held in the article cache
    Cached(CachedSegment),
    /// Written to disk: a per-segment result file (offset 0) or the
    /// direct-write artifact at the segment's offset
    OnDisk {
        /// File holding the bytes
        path: PathBuf,
        /// Position of the segment inside `path`
        offset: u64,
    },
}

impl SegmentContent {
    /// Whether the segment is held in the cache
    pub fn is_cached(&self) -> bool {
        matches!(self, SegmentContent::Cached(_))
    }
}

/// One article of a file
#[derive(Debug)]
pub struct ArticleInfo {
    /// 1-based part number; defines the order of segments
    pub part_number: u32,
    /// Expected decoded size (from the NZB / yEnc header)
    pub size: u32,
    /// Download outcome
    pub status: ArticleStatus,
    /// Byte offset of the segment within the file, known once decoded
    pub segment_offset: Option<u64>,
    /// Number of bytes actually written for the segment
    pub segment_size: u32,
    /// CRC32 of the written bytes
    pub crc: u32,
    /// Per-segment result file in the temp directory
    pub result_filename: Option<PathBuf>,
    /// Current storage of the segment bytes
    pub segment: SegmentContent,
}

impl ArticleInfo {
    /// Create a pending article
    pub fn new(part_number: u32, size: u32) -> Self {
        Self {
            part_number,
            size,
            status: ArticleStatus::Pending,
            segment_offset: None,
            segment_size: 0,
            crc: 0,
            result_filename: None,
            segment: SegmentContent::Absent,
        }
    }

    /// Bytes a finished segment came up short of its expected size
    fn shortfall(&self) -> u64 {
        u64::from(self.size.saturating_sub(self.segment_size))
    }
}

/// Article state of a file, guarded by the file's content lock
///
/// The content lock is only ever held to read or mutate these fields and
/// never across disk I/O.
#[derive(Debug, Default)]
pub struct FileContent {
    /// Articles in part-number order
    pub articles: Vec<ArticleInfo>,
    /// Number of articles whose segment is in the cache
    pub cached_articles: usize,
    /// Set while a cache drain works on this file
    pub flush_locked: bool,
    /// Articles finished successfully
    pub success_articles: u32,
    /// Articles failed or missing
    pub failed_articles: u32,
    /// Bytes permanently unavailable because articles failed
    pub missed_size: u64,
    /// CRC32 of the assembled file
    pub crc: u32,
}

impl FileContent {
    /// Sum of the written sizes of all finished articles
    pub fn finished_size(&self) -> u64 {
        self.articles
            .iter()
            .filter(|a| a.status == ArticleStatus::Finished)
            .map(|a| u64::from(a.segment_size))
            .sum()
    }

    /// Record the number of bytes written for an article
    ///
    /// A finished article's shortfall against its expected size counts as
    /// missed, so `finished size + missed size` stays equal to the file size.
    pub(crate) fn set_segment_size(&mut self, index: usize, size: u32) {
        let article = &mut self.articles[index];
        if article.status != ArticleStatus::Finished {
            article.segment_size = size;
            return;
        }
        let before = article.shortfall();
        article.segment_size = size;
        let after = article.shortfall();
        self.missed_size = self.missed_size.saturating_sub(before) + after;
    }

    /// Record that a finished article turned out to be unusable
    pub(crate) fn demote_finished(&mut self, index: usize) {
        let article = &mut self.articles[index];
        if article.status != ArticleStatus::Finished {
            return;
        }
        article.status = ArticleStatus::Failed;
        // the shortfall is already counted
        let lost = u64::from(article.segment_size);
        self.success_articles = self.success_articles.saturating_sub(1);
        self.failed_articles += 1;
        self.missed_size += lost;
    }
}

/// Direct-write artifact of a file, guarded by the file's output lock
#[derive(Debug, Default, Clone)]
pub struct OutputFile {
    /// The artifact has been created and pre-allocated
    pub initialized: bool,
    /// Path of the artifact
    pub filename: Option<PathBuf>,
}

/// A file of a download, assembled from its articles
#[derive(Debug)]
pub struct FileInfo {
    id: FileId,
    filename: RwLock<String>,
    size: u64,
    force_direct_write: bool,
    content: Mutex<FileContent>,
    output: Mutex<OutputFile>,
    active_downloads: AtomicU32,
    deleted: AtomicBool,
    hard_linked: AtomicBool,
    completed: AtomicBool,
}

impl FileInfo {
    /// Create a file from `(part_number, expected_size)` pairs
    pub fn new(id: FileId, filename: impl Into<String>, size: u64, parts: &[(u32, u32)]) -> Self {
        let mut articles: Vec<ArticleInfo> = parts
            .iter()
            .map(|&(part, part_size)| ArticleInfo::new(part, part_size))
            .collect();
        articles.sort_by_key(|a| a.part_number);

        Self {
            id,
            filename: RwLock::new(filename.into()),
            size,
            force_direct_write: false,
            content: Mutex::new(FileContent {
                articles,
                ..FileContent::default()
            }),
            output: Mutex::new(OutputFile::default()),
            active_downloads: AtomicU32::new(0),
            deleted: AtomicBool::new(false),
            hard_linked: AtomicBool::new(false),
            completed: AtomicBool::new(false),
        }
    }

    /// Always write this file directly, regardless of the global setting
    #[must_use]
    pub fn with_force_direct_write(mut self, force: bool) -> Self {
        self.force_direct_write = force;
        self
    }

    /// File ID
    pub fn id(&self) -> FileId {
        self.id
    }

    /// Current (final) filename
    pub fn filename(&self) -> String {
        self.filename
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Rename the file; takes effect at completion
    pub fn set_filename(&self, filename: impl Into<String>) {
        *self.filename.write().unwrap_or_else(PoisonError::into_inner) = filename.into();
    }

    /// Expected total size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether direct-write is forced for this file
    pub fn force_direct_write(&self) -> bool {
        self.force_direct_write
    }

    /// Number of articles
    pub fn total_articles(&self) -> usize {
        self.lock_content().articles.len()
    }

    /// Acquire the content lock
    pub fn lock_content(&self) -> MutexGuard<'_, FileContent> {
        self.content.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire the output lock
    pub fn lock_output(&self) -> MutexGuard<'_, OutputFile> {
        self.output.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of segments currently held in the cache
    pub fn cached_articles(&self) -> usize {
        self.lock_content().cached_articles
    }

    /// Record the outcome of an article download
    ///
    /// Keeps `finished size + missed size == file size` once every article
    /// has an outcome. Repeated calls for the same article replace its
    /// previous outcome.
    pub fn complete_article(&self, index: usize, status: ArticleStatus) {
        let mut content = self.lock_content();
        let Some(article) = content.articles.get_mut(index) else {
            tracing::warn!(file_id = self.id.0, index, "Outcome for unknown article ignored");
            return;
        };

        let previous = std::mem::replace(&mut article.status, status);
        let size = u64::from(article.size);
        let shortfall = article.shortfall();
        if previous == status {
            return;
        }

        match previous {
            ArticleStatus::Finished => {
                content.success_articles = content.success_articles.saturating_sub(1);
                content.missed_size = content.missed_size.saturating_sub(shortfall);
            }
            ArticleStatus::Failed | ArticleStatus::Missing => {
                content.failed_articles = content.failed_articles.saturating_sub(1);
                content.missed_size = content.missed_size.saturating_sub(size);
            }
            ArticleStatus::Pending => {}
        }

        match status {
            ArticleStatus::Finished => {
                content.success_articles += 1;
                content.missed_size += shortfall;
            }
            ArticleStatus::Failed | ArticleStatus::Missing => {
                content.failed_articles += 1;
                content.missed_size += size;
            }
            ArticleStatus::Pending => {}
        }
    }

    /// Number of article downloads currently running for this file
    pub fn active_downloads(&self) -> u32 {
        self.active_downloads.load(Ordering::Acquire)
    }

    /// Register a running article download
    pub fn download_started(&self) {
        self.active_downloads.fetch_add(1, Ordering::AcqRel);
    }

    /// Unregister a running article download
    pub fn download_finished(&self) {
        // saturating: an unmatched call must not wrap around
        let _ = self
            .active_downloads
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Whether the file was deleted from the queue
    pub fn deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Mark the file as deleted; a running drain stops early
    pub fn set_deleted(&self, deleted: bool) {
        self.deleted.store(deleted, Ordering::Release);
    }

    /// Whether the direct-write artifact is a hard link
    pub fn hard_linked(&self) -> bool {
        self.hard_linked.load(Ordering::Acquire)
    }

    /// Mark the direct-write artifact as a hard link
    pub fn set_hard_linked(&self, hard_linked: bool) {
        self.hard_linked.store(hard_linked, Ordering::Release);
    }

    /// Whether the file has been assembled
    pub fn completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub(crate) fn set_completed(&self) {
        self.completed.store(true, Ordering::Release);
    }

    /// Whether the direct-write artifact may still receive writes
    pub fn has_pending_writes(&self) -> bool {
        if self.completed() {
            return false;
        }
        let output = self.lock_output();
        output.initialized && output.filename.is_some()
    }

    /// CRC32 of the assembled file (valid after completion)
    pub fn crc(&self) -> u32 {
        self.lock_content().crc
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn three_part_file() -> FileInfo {
        FileInfo::new(FileId(1), "data.bin", 250, &[(3, 100), (1, 100), (2, 50)])
    }

    #[test]
    fn articles_are_kept_in_part_order() {
        let file = three_part_file();

        let parts: Vec<u32> = file
            .lock_content()
            .articles
            .iter()
            .map(|a| a.part_number)
            .collect();

        assert_eq!(parts, vec![1, 2, 3]);
    }

    #[test]
    fn complete_article_tracks_counters_and_missed_size() {
        let file = three_part_file();
        {
            let mut content = file.lock_content();
            content.articles[0].segment_size = 100;
            content.articles[2].segment_size = 100;
        }

        file.complete_article(0, ArticleStatus::Finished);
        file.complete_article(1, ArticleStatus::Missing);
        file.complete_article(2, ArticleStatus::Finished);

        let content = file.lock_content();
        assert_eq!(content.success_articles, 2);
        assert_eq!(content.failed_articles, 1);
        assert_eq!(content.missed_size, 50);
        assert_eq!(content.finished_size() + content.missed_size, file.size());
    }

    #[test]
    fn complete_article_replaces_previous_outcome() {
        let file = three_part_file();

        file.complete_article(1, ArticleStatus::Failed);
        file.complete_article(1, ArticleStatus::Failed);
        file.complete_article(1, ArticleStatus::Finished);

        let content = file.lock_content();
        assert_eq!(content.failed_articles, 0);
        assert_eq!(content.missed_size, 0);
        assert_eq!(content.success_articles, 1);
    }

    #[test]
    fn demote_finished_moves_bytes_to_missed() {
        let file = three_part_file();
        {
            let mut content = file.lock_content();
            content.articles[0].segment_size = 100;
        }
        file.complete_article(0, ArticleStatus::Finished);

        let mut content = file.lock_content();
        content.demote_finished(0);

        assert_eq!(content.articles[0].status, ArticleStatus::Failed);
        assert_eq!(content.success_articles, 0);
        assert_eq!(content.failed_articles, 1);
        assert_eq!(content.missed_size, 100);
    }

    #[test]
    fn short_segment_counts_its_shortfall_as_missed() {
        let file = FileInfo::new(FileId(1), "data.bin", 200, &[(1, 100), (2, 100)]);
        file.lock_content().set_segment_size(0, 60);

        file.complete_article(0, ArticleStatus::Finished);
        file.complete_article(1, ArticleStatus::Failed);

        let content = file.lock_content();
        assert_eq!(content.finished_size(), 60);
        assert_eq!(content.missed_size, 140);
        assert_eq!(content.finished_size() + content.missed_size, file.size());
    }

    #[test]
    fn shortfall_follows_outcome_changes() {
        let file = FileInfo::new(FileId(1), "data.bin", 100, &[(1, 100)]);
        file.lock_content().set_segment_size(0, 60);
        file.complete_article(0, ArticleStatus::Finished);

        // a retry delivers the full segment
        file.lock_content().set_segment_size(0, 100);
        assert_eq!(file.lock_content().missed_size, 0);

        file.lock_content().set_segment_size(0, 70);
        file.lock_content().demote_finished(0);
        assert_eq!(file.lock_content().missed_size, 100);

        file.complete_article(0, ArticleStatus::Finished);
        let content = file.lock_content();
        assert_eq!(content.missed_size, 30);
        assert_eq!(content.finished_size() + content.missed_size, file.size());
    }

    #[test]
    fn download_finished_never_underflows() {
        let file = three_part_file();

        file.download_started();
        file.download_finished();
        file.download_finished();

        assert_eq!(file.active_downloads(), 0);
    }
}
