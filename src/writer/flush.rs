//! Draining one file's cached segments to disk.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{FileAssembler, with_suffix};
use crate::cache::CachedSegment;
use crate::queue::SegmentContent;
use crate::types::{Event, MessageKind};
use crate::utils::move_file;

/// What a drain pass moved to disk
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Segments written
    pub articles: usize,
    /// Bytes written
    pub bytes: u64,
}

struct Pending {
    index: usize,
    offset: u64,
    result_filename: Option<PathBuf>,
    segment: CachedSegment,
}

enum Target {
    Artifact {
        path: PathBuf,
        writer: Option<BufWriter<File>>,
    },
    ResultFiles,
}

impl FileAssembler {
    /// Move all cached segments of the file to disk
    ///
    /// Runs under the cache's flush lock for its whole duration. The
    /// segments are taken out of their slots under the file's content lock
    /// and written with the lock released. Direct-write files get each
    /// segment written at its offset into the artifact; assembled files get
    /// one result file per segment, staged as `<result>.tmp` and renamed.
    ///
    /// If the file is deleted mid-drain (and its download is not being
    /// parked) the remaining segments are discarded and their articles marked
    /// failed. A disk error fails only the segment being written; the ones
    /// not reached yet go back into the cache.
    pub fn flush_cache(&self) -> FlushOutcome {
        let cache = &self.ctx.cache;
        let _flush_guard = cache.guard_flush();

        let direct_write = self.ctx.direct_write_active(&self.file);
        let skip_write = self.ctx.skip_disk_write(&self.nzb);

        let pending: Vec<Pending> = {
            let mut content = self.file.lock_content();
            if content.flush_locked {
                return FlushOutcome::default();
            }
            content.flush_locked = true;

            content
                .articles
                .iter_mut()
                .enumerate()
                .filter_map(|(index, article)| {
                    match std::mem::take(&mut article.segment) {
                        SegmentContent::Cached(segment) => Some(Pending {
                            index,
                            offset: article.segment_offset.unwrap_or(0),
                            result_filename: article.result_filename.clone(),
                            segment,
                        }),
                        other => {
                            article.segment = other;
                            None
                        }
                    }
                })
                .collect()
        };
        let taken = pending.len();

        let mut target = match (direct_write, self.file.lock_output().filename.clone()) {
            (true, Some(path)) => Target::Artifact { path, writer: None },
            _ => Target::ResultFiles,
        };

        let mut outcome = FlushOutcome::default();
        let mut written: Vec<(usize, SegmentContent)> = Vec::with_capacity(taken);
        let mut failed: Vec<usize> = Vec::new();
        let mut discarded: Vec<usize> = Vec::new();
        let mut remaining = pending.into_iter();

        while let Some(item) = remaining.next() {
            if self.file.deleted() && !self.nzb.parking() {
                debug!(file_id = self.file.id().0, "File deleted during drain, discarding cached segments");
                discarded.push(item.index);
                discarded.extend(remaining.by_ref().map(|p| p.index));
                break;
            }

            let size = item.segment.len() as u64;
            match self.write_pending(&mut target, &item, skip_write) {
                Ok(location) => {
                    written.push((item.index, location));
                    outcome.articles += 1;
                    outcome.bytes += size;
                }
                Err(message) => {
                    // untouched segments stay cached for the next pass
                    self.nzb.print_message(MessageKind::Error, message);
                    failed.push(item.index);
                    break;
                }
            }
            // buffer returned to the cache here
        }
        let untouched: Vec<Pending> = remaining.collect();

        if let Target::Artifact {
            path,
            writer: Some(mut writer),
        } = target
            && let Err(e) = writer.flush()
        {
            self.nzb.print_message(
                MessageKind::Error,
                format!("Could not write file {}: {}", path.display(), e),
            );
            failed.extend(written.drain(..).map(|(index, _)| index));
            outcome = FlushOutcome::default();
        }

        {
            let mut content = self.file.lock_content();
            for (index, location) in written {
                content.articles[index].segment = location;
            }
            for &index in failed.iter().chain(&discarded) {
                content.demote_finished(index);
            }
            let mut restored = 0;
            for item in untouched {
                let slot = &mut content.articles[item.index].segment;
                if matches!(slot, SegmentContent::Absent) {
                    *slot = SegmentContent::Cached(item.segment);
                    restored += 1;
                }
            }
            content.cached_articles = content.cached_articles.saturating_sub(taken - restored);
            content.flush_locked = false;
        }

        if !discarded.is_empty() {
            debug!(
                file_id = self.file.id().0,
                discarded = discarded.len(),
                "Dropped cached segments of deleted file"
            );
        }

        self.nzb.print_message(
            MessageKind::Detail,
            format!(
                "Saved {} articles ({:.2} MB) from cache into disk for {}",
                outcome.articles,
                outcome.bytes as f64 / 1024.0 / 1024.0,
                self.info_name()
            ),
        );

        if outcome.articles > 0 {
            self.ctx.emit(Event::CacheFlushed {
                id: self.nzb.id(),
                file_id: self.file.id(),
                articles: outcome.articles,
                bytes: outcome.bytes,
            });
        }

        outcome
    }

    fn write_pending(
        &self,
        target: &mut Target,
        item: &Pending,
        skip_write: bool,
    ) -> Result<SegmentContent, String> {
        match target {
            Target::Artifact { path, writer } => {
                if writer.is_none() {
                    let file = OpenOptions::new()
                        .read(true)
                        .write(true)
                        .open(&*path)
                        .map_err(|e| format!("Could not open file {}: {}", path.display(), e))?;
                    *writer = Some(BufWriter::with_capacity(self.ctx.write_buffer(0), file));
                }
                if let Some(w) = writer.as_mut()
                    && !skip_write
                {
                    w.seek(SeekFrom::Start(item.offset))
                        .and_then(|_| w.write_all(item.segment.as_bytes()))
                        .map_err(|e| format!("Could not write file {}: {}", path.display(), e))?;
                }
                Ok(SegmentContent::OnDisk {
                    path: path.clone(),
                    offset: item.offset,
                })
            }
            Target::ResultFiles => {
                let Some(result) = item.result_filename.as_deref() else {
                    return Err(format!(
                        "No result file assigned for article {} of {}",
                        item.index + 1,
                        self.info_name()
                    ));
                };
                self.write_result_file(result, &item.segment, skip_write)?;
                Ok(SegmentContent::OnDisk {
                    path: result.to_path_buf(),
                    offset: 0,
                })
            }
        }
    }

    fn write_result_file(
        &self,
        result: &Path,
        segment: &CachedSegment,
        skip_write: bool,
    ) -> Result<(), String> {
        let staging = with_suffix(result, ".tmp");
        let file = File::create(&staging)
            .map_err(|e| format!("Could not create file {}: {}", staging.display(), e))?;

        let mut writer = BufWriter::with_capacity(self.ctx.write_buffer(0), file);
        if !skip_write {
            writer
                .write_all(segment.as_bytes())
                .map_err(|e| format!("Could not write file {}: {}", staging.display(), e))?;
        }
        writer
            .flush()
            .map_err(|e| format!("Could not write file {}: {}", staging.display(), e))?;
        drop(writer);

        move_file(&staging, result).map_err(|e| {
            format!(
                "Could not rename file {} to {}: {}",
                staging.display(),
                result.display(),
                e
            )
        })
    }
}
