//! Disk side of the write path
//!
//! ## Submodules
//!
//! - `segment`: [`ArticleWriter`], per-article placement into cache, temp file or
//!   the direct-write artifact
//! - `assembly`: [`FileAssembler::complete_file_parts`], joining a file's segments
//! - `flush`: [`FileAssembler::flush_cache`], draining one file's cached segments
//! - `relocate`: [`move_completed_files`] after a download's destination changed
//!
//! Everything here does blocking file I/O and is meant to run on blocking
//! threads (`tokio::task::spawn_blocking` or the download pipeline's decode
//! threads).

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::cache::ArticleCache;
use crate::config::Config;
use crate::queue::{FileInfo, NzbInfo};
use crate::types::{ArticleFormat, Event};

mod assembly;
mod flush;
mod relocate;
mod segment;

pub use assembly::FileAssembler;
pub use flush::FlushOutcome;
pub use relocate::move_completed_files;
pub use segment::{ArticleWriter, StartOutcome};

/// Shared collaborators of the writers, the assembler and the flusher
#[derive(Debug)]
pub struct WriterContext {
    /// Effective configuration
    pub config: Arc<Config>,
    /// The article cache
    pub cache: Arc<ArticleCache>,
    /// Event channel
    pub event_tx: broadcast::Sender<Event>,
}

impl WriterContext {
    /// Bundle the collaborators
    pub fn new(
        config: Arc<Config>,
        cache: Arc<ArticleCache>,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            config,
            cache,
            event_tx,
        }
    }

    /// Whether disk writes are suppressed for `nzb`
    pub fn skip_disk_write(&self, nzb: &NzbInfo) -> bool {
        nzb.skip_disk_write() || self.config.cache.skip_write
    }

    /// Whether segments of `format` are written straight into `file`'s artifact
    pub fn direct_write_for(&self, file: &FileInfo, format: ArticleFormat) -> bool {
        (self.config.cache.direct_write || file.force_direct_write()) && format == ArticleFormat::Yenc
    }

    /// Whether `file` was set up for direct-write (artifact created)
    pub(crate) fn direct_write_active(&self, file: &FileInfo) -> bool {
        if !(self.config.cache.direct_write || file.force_direct_write()) {
            return false;
        }
        let output = file.lock_output();
        output.initialized && output.filename.is_some()
    }

    /// Buffer size for a disk writer handling records of `record_size` bytes (0 = unknown)
    pub(crate) fn write_buffer(&self, record_size: usize) -> usize {
        // BufWriter's own default when no buffer is configured
        self.config
            .cache
            .write_buffer_for(record_size)
            .unwrap_or(8 * 1024)
    }

    /// Directory below which emptied directories may be removed
    pub(crate) fn cleanup_root(&self, dir: &Path) -> PathBuf {
        let paths = &self.config.paths;
        paths
            .inter_dir
            .iter()
            .chain(std::iter::once(&paths.download_dir))
            .find(|root| dir.starts_with(root) && dir != root.as_path())
            .cloned()
            .or_else(|| dir.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| dir.to_path_buf())
    }

    pub(crate) fn emit(&self, event: Event) {
        // no subscribers is fine
        let _ = self.event_tx.send(event);
    }
}

/// `path` with `suffix` appended to its last component
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// Per-segment result file: `<temp_dir>/<file_id>.<part:03>`
pub(crate) fn result_filename(config: &Config, file: &FileInfo, part_number: u32) -> PathBuf {
    config
        .temp_dir()
        .join(format!("{}.{:03}", file.id(), part_number))
}

/// Direct-write artifact while downloading: `<dest_dir>/<file_id>.out.tmp`
pub(crate) fn output_filename(dest_dir: &Path, file: &FileInfo) -> PathBuf {
    dest_dir.join(format!("{}.out.tmp", file.id()))
}
