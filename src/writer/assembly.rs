//! File completion: joining a file's segments into its final artifact.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use super::{WriterContext, with_suffix};
use crate::cache::CachedSegment;
use crate::crc32;
use crate::error::WriteError;
use crate::queue::{CompletedFile, FileInfo, NzbInfo, SegmentContent};
use crate::types::{ArticleStatus, CompletionStatus, Event, MessageKind};
use crate::utils::{
    delete_file, force_directories, get_unique_path, move_file, remove_empty_dirs,
};

/// Zero-fill and copy chunk size
const JOIN_BUFFER_SIZE: usize = 64 * 1024;

/// Assembles one file of a download
///
/// Used for full completion once the file's last article finished and by
/// the cache flusher for partial drains (see [`flush_cache`](Self::flush_cache)).
pub struct FileAssembler {
    pub(super) ctx: Arc<WriterContext>,
    pub(super) nzb: Arc<NzbInfo>,
    pub(super) file: Arc<FileInfo>,
}

/// How the artifact is produced
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum JoinMode {
    /// Segments joined sequentially into `<final>.tmp`
    Assembled,
    /// Segments already at their offsets in the pre-allocated artifact
    DirectWrite,
    /// Segments moved as numbered files into a directory
    Raw,
}

struct JoinItem {
    index: usize,
    part_number: u32,
    offset: Option<u64>,
    size: u32,
    crc: u32,
    source: Source,
}

enum Source {
    Cached(CachedSegment),
    ResultFile(Option<PathBuf>),
    InArtifact,
}

enum Output {
    None,
    File { path: PathBuf, writer: BufWriter<File> },
    Directory(PathBuf),
}

impl FileAssembler {
    /// Create an assembler for `file` of `nzb`
    pub fn new(ctx: Arc<WriterContext>, nzb: Arc<NzbInfo>, file: Arc<FileInfo>) -> Self {
        Self { ctx, nzb, file }
    }

    pub(super) fn info_name(&self) -> String {
        format!("{}/{}", self.nzb.name(), self.file.filename())
    }

    /// Assemble the file from its finished segments
    ///
    /// Writes cached segments, joins per-segment result files (zero-filling
    /// gaps left by failed articles) or, for direct-write files, writes the
    /// remaining cached segments into the artifact. The file CRC is combined
    /// from the segment CRCs. The artifact ends up under the file's final name
    /// in the download's current destination directory.
    ///
    /// Never fails: problems are recorded on the download's message log and
    /// reflected in the returned status.
    pub fn complete_file_parts(&self) -> CompletionStatus {
        let info_name = self.info_name();
        let raw = self.ctx.config.cache.raw_article;
        let skip_write = self.ctx.skip_disk_write(&self.nzb);
        let direct_write = !raw && self.ctx.direct_write_active(&self.file);

        let nzb_dest_dir = self.nzb.dest_dir();
        let output_filename = self.file.lock_output().filename.clone();
        let (dest_dir, filename) = match (&output_filename, direct_write) {
            (Some(output), true) => (
                output.parent().map(Path::to_path_buf).unwrap_or_default(),
                output
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            ),
            _ => (nzb_dest_dir.clone(), self.file.filename()),
        };

        let mode = if raw {
            JoinMode::Raw
        } else if direct_write {
            JoinMode::DirectWrite
        } else {
            JoinMode::Assembled
        };
        let cached = self.file.cached_articles() > 0;

        let action = match (mode, cached) {
            (JoinMode::Raw, _) => "Moving",
            (JoinMode::DirectWrite, true) => "Writing",
            (JoinMode::DirectWrite, false) => "Checking",
            (JoinMode::Assembled, _) => "Joining",
        };
        self.nzb
            .print_message(MessageKind::Detail, format!("{} articles for {}", action, info_name));

        let prepared = self.prepare_output(
            mode,
            cached,
            &dest_dir,
            &filename,
            output_filename.as_deref(),
        );
        let (final_path, mut output) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.nzb.print_message(MessageKind::Error, e.to_string());
                return self.finalize(CompletionStatus::Failed, None, 0);
            }
        };

        // waits for a running drain; blocks new ones
        let flush_guard = cached.then(|| self.ctx.cache.guard_flush());
        let items = self.take_join_items(mode);
        let total_articles = self.file.total_articles();

        let mut crc: Option<u32> = None;
        let mut position: u64 = 0;
        let mut write_failed = false;
        let zeros = vec![0u8; JOIN_BUFFER_SIZE];

        for item in items {
            let joined = self.join_item(
                &mut output,
                mode,
                item,
                &mut position,
                &zeros,
                skip_write,
                total_articles,
                &info_name,
            );
            match joined {
                Ok(Some((segment_crc, size))) => {
                    crc = Some(match crc {
                        None => segment_crc,
                        Some(running) => crc32::combine(running, segment_crc, u64::from(size)),
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    self.nzb.print_message(MessageKind::Error, e.to_string());
                    write_failed = true;
                    break;
                }
            }
        }
        drop(flush_guard);

        let mut final_path = Some(final_path);
        if let Output::File { path, mut writer } = output {
            let closed = writer.flush().map_err(|e| WriteError::WriteFile {
                path: path.clone(),
                source: e,
            });
            drop(writer);
            if let Err(e) = closed {
                self.nzb.print_message(MessageKind::Error, e.to_string());
                write_failed = true;
            }

            if mode == JoinMode::Assembled
                && let Some(ofn) = &final_path
                && let Err(e) = move_file(&path, ofn)
            {
                self.nzb.print_message(
                    MessageKind::Error,
                    format!("Could not move file {} to {}: {}", path.display(), ofn.display(), e),
                );
                write_failed = true;
                final_path = None;
            }
        }

        if mode != JoinMode::DirectWrite {
            self.delete_result_files();
        }

        let crc = crc.unwrap_or(0);
        let status = self.report(write_failed, &info_name);

        if mode == JoinMode::DirectWrite {
            final_path = self.reconcile_artifact(&filename, &dest_dir, &nzb_dest_dir);
        }

        self.finalize(status, final_path, crc)
    }

    /// Create the destination directory and open whatever the mode writes into
    fn prepare_output(
        &self,
        mode: JoinMode,
        cached: bool,
        dest_dir: &Path,
        filename: &str,
        artifact: Option<&Path>,
    ) -> Result<(PathBuf, Output), WriteError> {
        force_directories(dest_dir)?;

        match mode {
            JoinMode::Assembled => {
                let ofn = get_unique_path(&dest_dir.join(filename))?;
                let tmp = with_suffix(&ofn, ".tmp");
                let _ = delete_file(&tmp);
                let file = File::create(&tmp).map_err(|e| WriteError::CreateFile {
                    path: tmp.clone(),
                    source: e,
                })?;
                let writer = BufWriter::with_capacity(self.ctx.write_buffer(0), file);
                Ok((ofn, Output::File { path: tmp, writer }))
            }
            JoinMode::DirectWrite => {
                let artifact = artifact.map(Path::to_path_buf).unwrap_or_else(|| dest_dir.join(filename));
                if !cached {
                    return Ok((artifact, Output::None));
                }
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&artifact)
                    .map_err(|e| WriteError::OpenFile {
                        path: artifact.clone(),
                        source: e,
                    })?;
                let writer = BufWriter::with_capacity(self.ctx.write_buffer(0), file);
                Ok((
                    artifact.clone(),
                    Output::File {
                        path: artifact,
                        writer,
                    },
                ))
            }
            JoinMode::Raw => {
                let ofn = get_unique_path(&dest_dir.join(filename))?;
                let _ = delete_file(&with_suffix(&ofn, ".tmp"));
                std::fs::create_dir(&ofn).map_err(|e| WriteError::CreateDirectory {
                    path: ofn.clone(),
                    reason: e.to_string(),
                })?;
                Ok((ofn.clone(), Output::Directory(ofn)))
            }
        }
    }

    /// Collect the finished articles in part order, taking their cached buffers
    fn take_join_items(&self, mode: JoinMode) -> Vec<JoinItem> {
        let mut content = self.file.lock_content();
        content.flush_locked = true;

        let mut released = 0;
        let items: Vec<JoinItem> = content
            .articles
            .iter_mut()
            .enumerate()
            .filter(|(_, a)| a.status == ArticleStatus::Finished)
            .map(|(index, article)| {
                let source = match std::mem::take(&mut article.segment) {
                    SegmentContent::Cached(segment) => {
                        released += 1;
                        Source::Cached(segment)
                    }
                    other => {
                        article.segment = other;
                        if mode == JoinMode::DirectWrite {
                            Source::InArtifact
                        } else {
                            Source::ResultFile(article.result_filename.clone())
                        }
                    }
                };
                JoinItem {
                    index,
                    part_number: article.part_number,
                    offset: article.segment_offset,
                    size: article.segment_size,
                    crc: article.crc,
                    source,
                }
            })
            .collect();

        content.cached_articles = content.cached_articles.saturating_sub(released);
        items
    }

    /// Write one segment; returns its CRC and size when it made it into the output
    #[allow(clippy::too_many_arguments)]
    fn join_item(
        &self,
        output: &mut Output,
        mode: JoinMode,
        item: JoinItem,
        position: &mut u64,
        zeros: &[u8],
        skip_write: bool,
        total_articles: usize,
        info_name: &str,
    ) -> Result<Option<(u32, u32)>, WriteError> {
        let JoinItem {
            index,
            part_number,
            offset,
            size,
            crc,
            source,
        } = item;

        match (output, source) {
            (Output::File { path, writer }, source) => {
                let io_err = |e: std::io::Error| WriteError::WriteFile {
                    path: path.clone(),
                    source: e,
                };

                // gap left by missing articles
                if mode == JoinMode::Assembled
                    && !skip_write
                    && let Some(offset) = offset
                {
                    while *position < offset {
                        let chunk = (offset - *position).min(zeros.len() as u64) as usize;
                        writer.write_all(&zeros[..chunk]).map_err(io_err)?;
                        *position += chunk as u64;
                    }
                }

                match source {
                    Source::Cached(segment) => {
                        if !skip_write {
                            let at = offset.unwrap_or(*position);
                            if at != *position || mode == JoinMode::DirectWrite {
                                writer.seek(SeekFrom::Start(at)).map_err(io_err)?;
                            }
                            writer.write_all(segment.as_bytes()).map_err(io_err)?;
                            *position = at + segment.len() as u64;
                        }
                        drop(segment);
                        Ok(Some((crc, size)))
                    }
                    Source::ResultFile(result) if !skip_write => {
                        let opened = result.as_deref().map(File::open);
                        match opened {
                            Some(Ok(mut infile)) => {
                                let copied = std::io::copy(&mut infile, writer).map_err(io_err)?;
                                *position += copied;
                                Ok(Some((crc, size)))
                            }
                            _ => {
                                self.file.lock_content().demote_finished(index);
                                self.nzb.print_message(
                                    MessageKind::Error,
                                    format!(
                                        "Could not find file {} for {} [{}/{}]",
                                        result.as_deref().unwrap_or(Path::new("")).display(),
                                        info_name,
                                        part_number,
                                        total_articles
                                    ),
                                );
                                Ok(None)
                            }
                        }
                    }
                    _ => Ok(Some((crc, size))),
                }
            }
            (Output::Directory(dir), Source::ResultFile(Some(result))) => {
                let dest = dir.join(format!("{:03}", part_number));
                if let Err(e) = move_file(&result, &dest) {
                    self.nzb.print_message(
                        MessageKind::Error,
                        format!("Could not move file {} to {}: {}", result.display(), dest.display(), e),
                    );
                }
                Ok(Some((crc, size)))
            }
            (Output::Directory(_), Source::Cached(segment)) => {
                // raw mode never caches
                drop(segment);
                Ok(None)
            }
            (_, _) => Ok(Some((crc, size))),
        }
    }

    fn delete_result_files(&self) {
        let mut content = self.file.lock_content();
        for article in content.articles.iter_mut() {
            let Some(result) = &article.result_filename else {
                continue;
            };
            if let Err(e) = delete_file(result) {
                debug!(path = %result.display(), error = %e, "Could not delete segment file");
            }
            if matches!(&article.segment, SegmentContent::OnDisk { path, .. } if path == result) {
                article.segment = SegmentContent::Absent;
            }
        }
    }

    /// Record the outcome message and derive the completion status
    fn report(&self, write_failed: bool, info_name: &str) -> CompletionStatus {
        let mut content = self.file.lock_content();
        content.flush_locked = false;
        let total = content.articles.len();
        let success = content.success_articles as usize;
        let failed = content.failed_articles as usize;
        drop(content);

        if total == success {
            self.nzb
                .print_message(MessageKind::Info, format!("Successfully downloaded {}", info_name));
        } else if failed > 0 {
            self.nzb.print_message(
                MessageKind::Warning,
                format!(
                    "{} of {} article downloads failed for \"{}\"",
                    failed, total, info_name
                ),
            );
        } else {
            self.nzb
                .print_message(MessageKind::Info, format!("Partially downloaded {}", info_name));
        }

        if write_failed {
            CompletionStatus::Failed
        } else if failed > 0 || success < total {
            CompletionStatus::Partial
        } else {
            CompletionStatus::Success
        }
    }

    /// Give the direct-write artifact its final name and directory
    fn reconcile_artifact(&self, filename: &str, dest_dir: &Path, nzb_dest_dir: &Path) -> Option<PathBuf> {
        let artifact = self.file.lock_output().filename.clone()?;

        if self.file.hard_linked() && self.ctx.config.paths.inter_dir.is_none() {
            // the link itself is not needed
            match delete_file(&artifact) {
                Ok(()) => {
                    self.file.lock_output().filename = None;
                    return None;
                }
                Err(e) => self.nzb.print_message(
                    MessageKind::Error,
                    format!("Cannot remove hardlink {}: {}", artifact.display(), e),
                ),
            }
        }

        let mut artifact = self.rename_output_file(filename, dest_dir, artifact);

        if dest_dir != nzb_dest_dir {
            artifact = self.move_to_dest_dir(artifact, dest_dir, nzb_dest_dir);
        }

        Some(artifact)
    }

    /// Rename the artifact to the file's current name if it differs from `filename`
    pub(super) fn rename_output_file(&self, filename: &str, dest_dir: &Path, artifact: PathBuf) -> PathBuf {
        let wanted = self.file.filename();
        if filename == wanted {
            return artifact;
        }

        let ofn = match get_unique_path(&dest_dir.join(&wanted)) {
            Ok(ofn) => ofn,
            Err(e) => {
                self.nzb.print_message(MessageKind::Error, e.to_string());
                return artifact;
            }
        };
        if let Err(e) = move_file(&artifact, &ofn) {
            self.nzb.print_message(
                MessageKind::Error,
                format!("Could not rename file {} to {}: {}", artifact.display(), ofn.display(), e),
            );
            return artifact;
        }

        self.file.lock_output().filename = Some(ofn.clone());
        ofn
    }

    /// The download's destination changed while the artifact was being written
    fn move_to_dest_dir(&self, artifact: PathBuf, old_dir: &Path, new_dir: &Path) -> PathBuf {
        let moved = force_directories(new_dir).and_then(|()| {
            let name = artifact.file_name().map(PathBuf::from).unwrap_or_default();
            let target = get_unique_path(&new_dir.join(name))?;
            move_file(&artifact, &target).map_err(|e| WriteError::MoveFailed {
                source_path: artifact.clone(),
                dest_path: target.clone(),
                reason: e.to_string(),
            })?;
            Ok(target)
        });

        match moved {
            Ok(target) => {
                debug!(from = %artifact.display(), to = %target.display(), "Moved artifact to new destination");
                self.file.lock_output().filename = Some(target.clone());
                let others_pending = self
                    .nzb
                    .files()
                    .iter()
                    .any(|f| f.id() != self.file.id() && f.has_pending_writes());
                if !others_pending {
                    remove_empty_dirs(old_dir, &self.ctx.cleanup_root(old_dir));
                }
                target
            }
            Err(e) => {
                self.nzb.print_message(MessageKind::Error, e.to_string());
                artifact
            }
        }
    }

    /// Store the CRC, record the completed file and announce it
    fn finalize(&self, status: CompletionStatus, path: Option<PathBuf>, crc: u32) -> CompletionStatus {
        {
            let mut content = self.file.lock_content();
            content.crc = crc;
            content.flush_locked = false;
        }
        self.file.set_completed();

        if let Some(name) = path
            .as_deref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
        {
            self.nzb.push_completed_file(CompletedFile {
                filename: name,
                crc,
                status,
            });
        }

        info!(
            download_id = self.nzb.id().0,
            file_id = self.file.id().0,
            ?status,
            crc = format_args!("{:08x}", crc),
            "File completed"
        );

        self.ctx.emit(Event::FileCompleted {
            id: self.nzb.id(),
            file_id: self.file.id(),
            path,
            status,
            crc,
        });

        status
    }
}
