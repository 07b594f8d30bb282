//! Downloads (one per NZB) and their per-download message log.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use super::file::FileInfo;
use crate::types::{CompletionStatus, DownloadId, Message, MessageKind};

/// How duplicates of this download are treated
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DupeMode {
    /// Regular duplicate handling (default)
    #[default]
    Score,
    /// Download even if a duplicate with the same score exists
    All,
    /// Never treat anything as a duplicate
    Force,
}

/// A file of the download that has been assembled
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompletedFile {
    /// Name of the file inside the download's destination directory
    pub filename: String,
    /// CRC32 of the file
    pub crc: u32,
    /// Completion outcome
    pub status: CompletionStatus,
}

/// A download in the queue
#[derive(Debug)]
pub struct NzbInfo {
    id: DownloadId,
    name: String,
    dest_dir: RwLock<PathBuf>,
    files: RwLock<Vec<Arc<FileInfo>>>,
    completed_files: Mutex<Vec<CompletedFile>>,
    messages: Mutex<Vec<Message>>,
    dupe_mode: DupeMode,
    many_dupe_files: AtomicBool,
    skip_disk_write: AtomicBool,
    parking: AtomicBool,
}

impl NzbInfo {
    /// Create a download writing into `dest_dir`
    pub fn new(id: DownloadId, name: impl Into<String>, dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            id,
            name: name.into(),
            dest_dir: RwLock::new(dest_dir.into()),
            files: RwLock::new(Vec::new()),
            completed_files: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            dupe_mode: DupeMode::default(),
            many_dupe_files: AtomicBool::new(false),
            skip_disk_write: AtomicBool::new(false),
            parking: AtomicBool::new(false),
        }
    }

    /// Set the duplicate handling mode
    #[must_use]
    pub fn with_dupe_mode(mut self, mode: DupeMode) -> Self {
        self.dupe_mode = mode;
        self
    }

    /// Download ID
    pub fn id(&self) -> DownloadId {
        self.id
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current destination directory
    pub fn dest_dir(&self) -> PathBuf {
        self.dest_dir
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Change the destination directory; returns the previous one
    pub fn set_dest_dir(&self, dest_dir: impl Into<PathBuf>) -> PathBuf {
        let mut guard = self.dest_dir.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, dest_dir.into())
    }

    /// Add a file to the download
    pub fn add_file(&self, file: Arc<FileInfo>) {
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(file);
    }

    /// Snapshot of the download's files
    pub fn files(&self) -> Vec<Arc<FileInfo>> {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Files that have been assembled so far
    pub fn completed_files(&self) -> Vec<CompletedFile> {
        self.completed_files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn push_completed_file(&self, file: CompletedFile) {
        self.completed_files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(file);
    }

    pub(crate) fn rename_completed_file(&self, old: &str, new: &str) {
        let mut files = self
            .completed_files
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = files.iter_mut().find(|f| f.filename == old) {
            entry.filename = new.to_string();
        }
    }

    /// Duplicate handling mode
    pub fn dupe_mode(&self) -> DupeMode {
        self.dupe_mode
    }

    /// Whether the download is known to contain many duplicate files
    pub fn many_dupe_files(&self) -> bool {
        self.many_dupe_files.load(Ordering::Acquire)
    }

    /// Mark the download as containing many duplicate files (disables the dupe check)
    pub fn set_many_dupe_files(&self, value: bool) {
        self.many_dupe_files.store(value, Ordering::Release);
    }

    /// Whether disk writes are suppressed for this download
    pub fn skip_disk_write(&self) -> bool {
        self.skip_disk_write.load(Ordering::Acquire)
    }

    /// Suppress disk writes for this download
    pub fn set_skip_disk_write(&self, value: bool) {
        self.skip_disk_write.store(value, Ordering::Release);
    }

    /// Whether the download is being parked (moved aside) rather than deleted
    pub fn parking(&self) -> bool {
        self.parking.load(Ordering::Acquire)
    }

    /// Mark the download as being parked
    pub fn set_parking(&self, value: bool) {
        self.parking.store(value, Ordering::Release);
    }

    /// Record a message on the download and mirror it to the log
    pub fn print_message(&self, kind: MessageKind, text: impl Into<String>) {
        let text = text.into();
        match kind {
            MessageKind::Detail => tracing::debug!(download_id = self.id.0, "{}", text),
            MessageKind::Info => tracing::info!(download_id = self.id.0, "{}", text),
            MessageKind::Warning => tracing::warn!(download_id = self.id.0, "{}", text),
            MessageKind::Error => tracing::error!(download_id = self.id.0, "{}", text),
        }

        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Message {
                kind,
                text,
                time: Utc::now(),
            });
    }

    /// Messages recorded so far
    pub fn messages(&self) -> Vec<Message> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FileId;

    #[test]
    fn print_message_records_kind_and_text() {
        let nzb = NzbInfo::new(DownloadId(1), "Show.S01E01", "/dest");

        nzb.print_message(MessageKind::Warning, "2 of 10 article downloads failed");

        let messages = nzb.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageKind::Warning);
        assert!(messages[0].text.contains("2 of 10"));
    }

    #[test]
    fn set_dest_dir_returns_previous_directory() {
        let nzb = NzbInfo::new(DownloadId(1), "job", "/old");

        let previous = nzb.set_dest_dir("/new");

        assert_eq!(previous, PathBuf::from("/old"));
        assert_eq!(nzb.dest_dir(), PathBuf::from("/new"));
    }

    #[test]
    fn files_snapshot_contains_added_files() {
        let nzb = NzbInfo::new(DownloadId(1), "job", "/dest");
        nzb.add_file(Arc::new(FileInfo::new(FileId(1), "a.bin", 10, &[(1, 10)])));
        nzb.add_file(Arc::new(FileInfo::new(FileId(2), "b.bin", 10, &[(1, 10)])));

        let names: Vec<String> = nzb.files().iter().map(|f| f.filename()).collect();

        assert_eq!(names, vec!["a.bin", "b.bin"]);
    }
}
