//! Per-article segment writer
//!
//! One [`ArticleWriter`] handles one article download: [`start`](ArticleWriter::start)
//! decides where the decoded bytes go, [`write`](ArticleWriter::write) appends them and
//! [`finish`](ArticleWriter::finish) attaches the result to the article.
//!
//! Placement, in order of preference:
//! 1. a buffer from the article cache
//! 2. the pre-allocated direct-write artifact, at the segment's offset (yEnc only)
//! 3. a private per-segment temp file, renamed to the result file on success

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{WriterContext, output_filename, result_filename, with_suffix};
use crate::cache::CachedSegment;
use crate::error::WriteError;
use crate::queue::{DupeMode, FileInfo, NzbInfo, SegmentContent};
use crate::types::{ArticleFormat, ArticleStatus, MessageKind};
use crate::utils::{allocate_file, delete_file, force_directories, move_file};

/// Pause between allocation attempts while a drain is running
const ALLOC_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Result of [`ArticleWriter::start`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    /// Ready to receive bytes
    Ready,
    /// The file already exists at the destination; do not download the article
    Duplicate,
}

enum Sink {
    None,
    Cache(CachedSegment),
    Disk {
        path: PathBuf,
        writer: BufWriter<File>,
    },
}

/// Writer for one article of a file
pub struct ArticleWriter {
    ctx: Arc<WriterContext>,
    nzb: Arc<NzbInfo>,
    file: Arc<FileInfo>,
    index: usize,
    part_number: u32,
    expected_size: u32,
    result_filename: PathBuf,
    temp_filename: PathBuf,
    output_filename: Option<PathBuf>,
    info_name: String,
    format: ArticleFormat,
    article_offset: u64,
    article_size: usize,
    written: usize,
    hasher: crc32fast::Hasher,
    sink: Sink,
    started: bool,
    duplicate: bool,
}

impl ArticleWriter {
    /// Prepare a writer for the article at `index` of `file`
    ///
    /// Assigns the article's result filename and, when direct-write applies to
    /// the file, the path of its artifact.
    pub fn new(
        ctx: Arc<WriterContext>,
        nzb: Arc<NzbInfo>,
        file: Arc<FileInfo>,
        index: usize,
    ) -> Result<Self, WriteError> {
        let result = {
            let mut content = file.lock_content();
            let article = content
                .articles
                .get_mut(index)
                .ok_or(WriteError::UnknownArticle {
                    file_id: file.id(),
                    index,
                })?;
            let result = result_filename(&ctx.config, &file, article.part_number);
            article.result_filename = Some(result.clone());
            (result, article.part_number, article.size)
        };
        let (result_filename, part_number, expected_size) = result;

        let output = if ctx.config.cache.direct_write || file.force_direct_write() {
            let mut output = file.lock_output();
            let path = output
                .filename
                .get_or_insert_with(|| output_filename(&nzb.dest_dir(), &file))
                .clone();
            Some(path)
        } else {
            None
        };

        let info_name = format!("{}/{}", nzb.name(), file.filename());

        Ok(Self {
            temp_filename: with_suffix(&result_filename, ".tmp"),
            result_filename,
            output_filename: output,
            info_name,
            ctx,
            nzb,
            file,
            index,
            part_number,
            expected_size,
            format: ArticleFormat::Unknown,
            article_offset: 0,
            article_size: 0,
            written: 0,
            hasher: crc32fast::Hasher::new(),
            sink: Sink::None,
            started: false,
            duplicate: false,
        })
    }

    /// Part number of the article
    pub fn part_number(&self) -> u32 {
        self.part_number
    }

    /// Whether the last [`start`](Self::start) detected a duplicate
    pub fn is_duplicate(&self) -> bool {
        self.duplicate
    }

    /// Number of bytes accepted since the last start
    pub fn written(&self) -> usize {
        self.written
    }

    fn direct_write(&self) -> bool {
        self.ctx.direct_write_for(&self.file, self.format)
    }

    /// Begin receiving a decoded segment
    ///
    /// `filename` is the file name announced by the decoder (used for the
    /// duplicate check), `file_size` the total size of the file and
    /// `article_offset`/`article_size` the segment's position and length. An
    /// `article_size` of 0 falls back to the size expected from the NZB.
    ///
    /// May block briefly: while a cache drain is running, a refused allocation
    /// is retried until memory frees up or `flush_wait_timeout` elapses.
    pub fn start(
        &mut self,
        format: ArticleFormat,
        filename: Option<&str>,
        file_size: u64,
        article_offset: u64,
        article_size: u32,
    ) -> Result<StartOutcome, WriteError> {
        self.sink = Sink::None;
        self.started = false;
        self.duplicate = false;
        self.format = format;
        self.article_offset = article_offset;
        self.article_size = if article_size > 0 {
            article_size as usize
        } else {
            self.expected_size as usize
        };
        self.written = 0;
        self.hasher = crc32fast::Hasher::new();

        let config = &self.ctx.config.cache;
        let direct_write = self.direct_write();

        if format == ArticleFormat::Yenc {
            if self.dupe_check_applies() {
                let initialized = {
                    let mut output = self.file.lock_output();
                    let initialized = output.initialized;
                    // only the first segment of an assembled file checks
                    if !direct_write {
                        output.initialized = true;
                    }
                    initialized
                };

                if !initialized
                    && let Some(name) = filename
                    && self.nzb.dest_dir().join(name).exists()
                {
                    debug!(
                        download_id = self.nzb.id().0,
                        file_id = self.file.id().0,
                        filename = name,
                        "Destination file exists, skipping article"
                    );
                    self.duplicate = true;
                    return Ok(StartOutcome::Duplicate);
                }
            }

            if direct_write {
                let mut output = self.file.lock_output();
                if !output.initialized {
                    let path = self
                        .output_filename
                        .clone()
                        .unwrap_or_else(|| output_filename(&self.nzb.dest_dir(), &self.file));
                    self.create_output_file(&path, file_size)?;
                    output.filename = Some(path.clone());
                    output.initialized = true;
                    self.output_filename = Some(path);
                }
            }
        }

        if config.article_cache_mb > 0
            && !config.raw_article
            && (!config.direct_write || format == ArticleFormat::Yenc)
        {
            match self.acquire_cache() {
                Some(segment) => self.sink = Sink::Cache(segment),
                None => self.nzb.print_message(
                    MessageKind::Detail,
                    format!("Article cache is full, using disk for {}", self.info_name),
                ),
            }
        }

        if matches!(self.sink, Sink::None) {
            self.sink = self.open_disk_sink(direct_write)?;
        }

        self.started = true;
        Ok(StartOutcome::Ready)
    }

    fn dupe_check_applies(&self) -> bool {
        self.ctx.config.cache.dupe_check
            && self.nzb.dupe_mode() != DupeMode::Force
            && !self.nzb.many_dupe_files()
    }

    fn acquire_cache(&self) -> Option<CachedSegment> {
        let cache = &self.ctx.cache;
        let timeout = self.ctx.config.cache.flush_wait_timeout;
        let started = Instant::now();

        loop {
            if let Some(segment) = cache.alloc(self.article_size) {
                return Some(segment);
            }
            if !cache.flushing() {
                return None;
            }
            if started.elapsed() >= timeout {
                warn!(
                    download_id = self.nzb.id().0,
                    file_id = self.file.id().0,
                    waited_secs = started.elapsed().as_secs(),
                    "Cache drain did not free memory in time, falling back to disk"
                );
                return None;
            }
            std::thread::sleep(ALLOC_RETRY_DELAY);
        }
    }

    fn open_disk_sink(&self, direct_write: bool) -> Result<Sink, WriteError> {
        let path = match (&self.output_filename, direct_write) {
            (Some(output), true) => output.clone(),
            _ => self.temp_filename.clone(),
        };

        let opened = if direct_write {
            OpenOptions::new().read(true).write(true).open(&path)
        } else {
            File::create(&path)
        };

        let file = match opened {
            Ok(f) => f,
            Err(e) => {
                self.nzb.print_message(
                    MessageKind::Error,
                    format!(
                        "Could not {} file {}: {}",
                        if direct_write { "open" } else { "create" },
                        path.display(),
                        e
                    ),
                );
                return Err(if direct_write {
                    WriteError::OpenFile { path, source: e }
                } else {
                    WriteError::CreateFile { path, source: e }
                });
            }
        };

        let capacity = self.ctx.write_buffer(self.expected_size as usize);
        let mut writer = BufWriter::with_capacity(capacity, file);

        if direct_write {
            writer
                .seek(SeekFrom::Start(self.article_offset))
                .map_err(|e| WriteError::WriteFile {
                    path: path.clone(),
                    source: e,
                })?;
        }

        Ok(Sink::Disk { path, writer })
    }

    /// Create and pre-allocate the direct-write artifact, creating parent directories
    ///
    /// An existing file of exactly `size` bytes is left from a previous session and kept.
    fn create_output_file(&self, path: &Path, size: u64) -> Result<(), WriteError> {
        if let Ok(meta) = std::fs::metadata(path) {
            if meta.len() == size {
                debug!(path = %path.display(), size, "Keeping existing output file");
                return Ok(());
            }
            if let Err(e) = delete_file(path) {
                debug!(path = %path.display(), error = %e, "Could not delete stale output file");
            }
        }

        if let Some(dir) = path.parent()
            && let Err(e) = force_directories(dir)
        {
            self.nzb.print_message(MessageKind::Error, e.to_string());
            return Err(e);
        }

        // real reservation only when segments go straight to disk
        let sparse = self.ctx.config.cache.article_cache_mb > 0;
        if let Err(e) = allocate_file(path, size, sparse) {
            self.nzb.print_message(
                MessageKind::Error,
                format!("Could not create file {}: {}", path.display(), e),
            );
            return Err(e);
        }

        Ok(())
    }

    /// Append decoded bytes
    ///
    /// Bytes beyond the segment's size are dropped; a damaged article is
    /// detected by the decoder's integrity check, not here.
    pub fn write(&mut self, buf: &[u8]) -> Result<(), WriteError> {
        if !self.started {
            return Err(WriteError::NotStarted);
        }

        let data = if self.ctx.config.cache.raw_article {
            buf
        } else {
            let room = self.article_size.saturating_sub(self.written);
            if buf.len() > room {
                debug!(
                    file_id = self.file.id().0,
                    part = self.part_number,
                    excess = buf.len() - room,
                    "Write beyond article size truncated"
                );
            }
            &buf[..buf.len().min(room)]
        };

        self.written += data.len();
        self.hasher.update(data);

        if let Sink::Cache(segment) = &mut self.sink {
            segment.append(data);
            return Ok(());
        }

        if self.ctx.skip_disk_write(&self.nzb) {
            return Ok(());
        }

        if let Sink::Disk { path, writer } = &mut self.sink {
            writer.write_all(data).map_err(|e| WriteError::WriteFile {
                path: path.clone(),
                source: e,
            })?;
        }

        Ok(())
    }

    /// Complete the article
    ///
    /// On failure the segment's temp and result files are removed and any
    /// cache buffer is returned. On success the segment is attached to its
    /// article (cache buffer or on-disk location) and the article is recorded
    /// as finished; if the temp file cannot be renamed to its result file the
    /// article is recorded as failed instead. Problems are reported on the
    /// download's message log.
    pub fn finish(&mut self, success: bool) {
        let sink = std::mem::replace(&mut self.sink, Sink::None);
        let started = std::mem::replace(&mut self.started, false);
        if !started {
            return;
        }

        let mut success = success;
        let mut segment = None;
        match sink {
            Sink::Cache(s) => segment = Some(s),
            Sink::Disk { path, mut writer } => {
                if let Err(e) = writer.flush() {
                    self.nzb.print_message(
                        MessageKind::Error,
                        format!("Could not write file {}: {}", path.display(), e),
                    );
                    success = false;
                }
            }
            Sink::None => {}
        }

        let direct_write = self.direct_write();
        let raw = self.ctx.config.cache.raw_article;
        let mut rename_failed = false;

        if success
            && (raw || !direct_write)
            && segment.is_none()
            && let Err(e) = move_file(&self.temp_filename, &self.result_filename)
        {
            self.nzb.print_message(
                MessageKind::Error,
                format!(
                    "Could not {} file {} to {}: {}",
                    if raw { "move" } else { "rename" },
                    self.temp_filename.display(),
                    self.result_filename.display(),
                    e
                ),
            );
            success = false;
            rename_failed = true;
        }

        if !success {
            drop(segment);
            for path in [&self.temp_filename, &self.result_filename] {
                if let Err(e) = delete_file(path) {
                    debug!(path = %path.display(), error = %e, "Could not delete segment file");
                }
            }
            if rename_failed {
                // the bytes were downloaded but are gone
                self.file.complete_article(self.index, ArticleStatus::Failed);
            }
            return;
        }

        let crc = self.hasher.clone().finalize();
        let size = u32::try_from(self.written).unwrap_or(u32::MAX);

        if let Some(mut buffer) = segment {
            if self.written < buffer.reserved() {
                self.ctx.cache.shrink(&mut buffer, self.written);
            }
            let mut content = self.file.lock_content();
            let was_cached = {
                let article = &mut content.articles[self.index];
                let previous = std::mem::replace(&mut article.segment, SegmentContent::Cached(buffer));
                article.segment_offset = Some(self.article_offset);
                article.crc = crc;
                previous.is_cached()
            };
            content.set_segment_size(self.index, size);
            if !was_cached {
                content.cached_articles += 1;
            }
        } else {
            let location = match (&self.output_filename, direct_write && !raw) {
                (Some(output), true) => SegmentContent::OnDisk {
                    path: output.clone(),
                    offset: self.article_offset,
                },
                _ => SegmentContent::OnDisk {
                    path: self.result_filename.clone(),
                    offset: 0,
                },
            };
            let mut content = self.file.lock_content();
            let was_cached = {
                let article = &mut content.articles[self.index];
                let previous = std::mem::replace(&mut article.segment, location);
                article.segment_offset = Some(self.article_offset);
                article.crc = crc;
                previous.is_cached()
            };
            content.set_segment_size(self.index, size);
            if was_cached {
                content.cached_articles = content.cached_articles.saturating_sub(1);
            }
        }

        self.file.complete_article(self.index, ArticleStatus::Finished);
    }
}

impl Drop for ArticleWriter {
    fn drop(&mut self) {
        // an unfinished article leaves nothing behind
        if self.started {
            self.finish(false);
        }
    }
}

impl std::fmt::Debug for ArticleWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArticleWriter")
            .field("file_id", &self.file.id())
            .field("part_number", &self.part_number)
            .field("format", &self.format)
            .field("written", &self.written)
            .finish_non_exhaustive()
    }
}
