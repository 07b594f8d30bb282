//! Engine facade wiring the cache, the flusher, the database and the writers.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::{ArticleCache, CacheFlusher, spawn_cache_marker_persister};
use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::queue::{DownloadQueue, FileInfo, NzbInfo};
use crate::types::{CompletionStatus, Event};
use crate::writer::{ArticleWriter, FileAssembler, WriterContext, move_completed_files};

/// How long shutdown waits for the flusher to empty the cache
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Segment cache and file assembly engine
///
/// Owns the article cache and its background flusher. Download pipelines
/// register their downloads in [`queue`](Self::queue), obtain an
/// [`ArticleWriter`] per article via [`writer`](Self::writer) and call
/// [`complete_file`](Self::complete_file) once a file's last article finished.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use usenet_writer::{ArticleFormat, Config, DownloadId, FileInfo, NzbInfo, WriterEngine};
///
/// # async fn run() -> usenet_writer::Result<()> {
/// let engine = WriterEngine::new(Config::default()).await?;
///
/// let nzb = Arc::new(NzbInfo::new(DownloadId(1), "Show.S01E01", "./downloads/Show.S01E01"));
/// let file = Arc::new(FileInfo::new(
///     engine.queue().next_file_id(),
///     "show.mkv",
///     750_000,
///     &[(1, 750_000)],
/// ));
/// nzb.add_file(Arc::clone(&file));
/// engine.queue().add(Arc::clone(&nzb));
///
/// let mut writer = engine.writer(&nzb, &file, 0)?;
/// writer.start(ArticleFormat::Yenc, Some("show.mkv"), 750_000, 0, 750_000)?;
/// writer.write(&[0u8; 750_000])?;
/// writer.finish(true);
///
/// engine.complete_file(&nzb, &file).await?;
/// engine.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct WriterEngine {
    ctx: Arc<WriterContext>,
    queue: Arc<DownloadQueue>,
    db: Arc<Database>,
    cancel_token: CancellationToken,
    marker_cancel: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
    marker: Mutex<Option<JoinHandle<()>>>,
    accepting: AtomicBool,
}

impl WriterEngine {
    /// Start the engine
    ///
    /// Validates the configuration, creates the download and temp
    /// directories, opens the database and spawns the cache flusher. A cache
    /// flag left by a previous session means cached segments were lost in an
    /// unclean shutdown; it is reported and cleared.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn new(config: Config) -> Result<Self> {
        for warning in config.validate()? {
            tracing::warn!("{}", warning);
        }
        let config = config.effective();

        for (dir, what) in [
            (&config.paths.download_dir, "download"),
            (&config.paths.temp_dir, "temp"),
        ] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to create {} directory '{}': {}", what, dir.display(), e),
                ))
            })?;
        }

        let db = Database::new(&config.persistence.database_path).await?;

        if db.was_unclean_shutdown().await? {
            tracing::warn!("Previous session did not shut down cleanly");
        }
        if db.has_cache_flag().await? {
            tracing::warn!(
                "Article cache held unsaved segments when the previous session ended; \
                 affected files need repair"
            );
            db.delete_cache_flag().await?;
        }
        db.set_clean_start().await?;
        let db = Arc::new(db);

        let (event_tx, _rx) = broadcast::channel(1000);
        let cache = ArticleCache::new(config.cache.max_bytes());
        let continue_partial = config.cache.continue_partial;
        let ctx = Arc::new(WriterContext::new(
            Arc::new(config),
            Arc::clone(&cache),
            event_tx,
        ));
        let queue = Arc::new(DownloadQueue::new());

        let cancel_token = CancellationToken::new();
        let marker_cancel = CancellationToken::new();

        let flusher = CacheFlusher::new(
            Arc::clone(&ctx),
            Arc::clone(&queue),
            cancel_token.clone(),
        )
        .spawn();

        let marker = continue_partial.then(|| {
            spawn_cache_marker_persister(
                Arc::clone(&db),
                cache.subscribe_marker(),
                marker_cancel.clone(),
            )
        });

        tracing::info!(
            cache_mb = ctx.config.cache.article_cache_mb,
            direct_write = ctx.config.cache.direct_write,
            raw_article = ctx.config.cache.raw_article,
            "Writer engine started"
        );

        Ok(Self {
            ctx,
            queue,
            db,
            cancel_token,
            marker_cancel,
            flusher: Mutex::new(Some(flusher)),
            marker: Mutex::new(marker),
            accepting: AtomicBool::new(true),
        })
    }

    /// Effective configuration
    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    /// Downloads the flusher drains
    pub fn queue(&self) -> &Arc<DownloadQueue> {
        &self.queue
    }

    /// The article cache
    pub fn cache(&self) -> &Arc<ArticleCache> {
        &self.ctx.cache
    }

    /// Runtime state store
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.ctx.event_tx.subscribe()
    }

    /// Create the writer for the article at `index` of `file`
    ///
    /// # Errors
    ///
    /// [`Error::ShuttingDown`] once [`shutdown`](Self::shutdown) started, or
    /// [`Error::Write`] if `index` is not an article of the file.
    pub fn writer(
        &self,
        nzb: &Arc<NzbInfo>,
        file: &Arc<FileInfo>,
        index: usize,
    ) -> Result<ArticleWriter> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        Ok(ArticleWriter::new(
            Arc::clone(&self.ctx),
            Arc::clone(nzb),
            Arc::clone(file),
            index,
        )?)
    }

    /// Assemble `file` on a blocking thread
    pub async fn complete_file(
        &self,
        nzb: &Arc<NzbInfo>,
        file: &Arc<FileInfo>,
    ) -> Result<CompletionStatus> {
        let assembler = FileAssembler::new(Arc::clone(&self.ctx), Arc::clone(nzb), Arc::clone(file));
        tokio::task::spawn_blocking(move || assembler.complete_file_parts())
            .await
            .map_err(|e| Error::Other(format!("file completion task failed: {}", e)))
    }

    /// Point `nzb` at a new destination and move its completed files there
    pub async fn change_dest_dir(&self, nzb: &Arc<NzbInfo>, dest_dir: PathBuf) -> Result<()> {
        let old_dest_dir = nzb.set_dest_dir(dest_dir);
        let nzb = Arc::clone(nzb);
        tokio::task::spawn_blocking(move || move_completed_files(&nzb, &old_dest_dir))
            .await
            .map_err(|e| Error::Other(format!("file relocation task failed: {}", e)))??;
        Ok(())
    }

    /// Gracefully shut down the engine
    ///
    /// 1. Stops handing out writers
    /// 2. Lets the flusher drain the whole cache (forced drains) and waits
    ///    for it, up to 30 seconds
    /// 3. Persists the final cache marker and marks a clean shutdown
    /// 4. Emits [`Event::Shutdown`]
    ///
    /// Calling it again is a no-op apart from the event.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating writer engine shutdown");
        self.accepting.store(false, Ordering::SeqCst);
        self.cancel_token.cancel();

        if let Some(mut handle) = self.flusher.lock().await.take() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => tracing::info!("Article cache drained"),
                Ok(Err(e)) => tracing::error!(error = %e, "Cache flusher task failed"),
                Err(_) => {
                    tracing::warn!(
                        allocated = self.ctx.cache.allocated(),
                        "Timeout waiting for the cache to drain, proceeding with shutdown"
                    );
                    handle.abort();
                }
            }
        }

        self.marker_cancel.cancel();
        if let Some(handle) = self.marker.lock().await.take()
            && let Err(e) = handle.await
        {
            tracing::error!(error = %e, "Cache marker task failed");
        }

        if let Err(e) = self.db.set_clean_shutdown().await {
            tracing::error!(error = %e, "Failed to mark clean shutdown in database");
        }

        self.ctx.emit(Event::Shutdown);
        tracing::info!("Writer engine shutdown complete");
        Ok(())
    }
}

impl std::fmt::Debug for WriterEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterEngine")
            .field("allocated", &self.ctx.cache.allocated())
            .field("accepting", &self.accepting.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ArticleFormat, DownloadId};
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.paths.download_dir = dir.path().join("downloads");
        config.paths.temp_dir = dir.path().join("temp");
        config.persistence.database_path = dir.path().join("state.db");
        config
    }

    #[tokio::test]
    async fn new_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let engine = WriterEngine::new(config).await.unwrap();

        assert!(dir.path().join("downloads").is_dir());
        assert!(dir.path().join("temp").is_dir());
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn new_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.paths.temp_dir = PathBuf::new();

        let result = WriterEngine::new(config).await;

        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[tokio::test]
    async fn writer_is_refused_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let engine = WriterEngine::new(test_config(&dir)).await.unwrap();
        let nzb = Arc::new(NzbInfo::new(DownloadId(1), "job", dir.path().join("downloads/job")));
        let file = Arc::new(FileInfo::new(engine.queue().next_file_id(), "a.bin", 10, &[(1, 10)]));

        engine.shutdown().await.unwrap();

        assert!(matches!(
            engine.writer(&nzb, &file, 0),
            Err(Error::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn shutdown_emits_event_and_marks_clean() {
        let dir = tempfile::tempdir().unwrap();
        let engine = WriterEngine::new(test_config(&dir)).await.unwrap();
        let mut events = engine.subscribe();

        engine.shutdown().await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), Event::Shutdown));
        assert!(!engine.database().was_unclean_shutdown().await.unwrap());
    }

    #[tokio::test]
    async fn left_over_cache_flag_is_cleared_on_start() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::new(&dir.path().join("state.db")).await.unwrap();
            db.write_cache_flag().await.unwrap();
            db.close().await;
        }

        let engine = WriterEngine::new(test_config(&dir)).await.unwrap();

        assert!(!engine.database().has_cache_flag().await.unwrap());
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_drains_cached_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.cache.direct_write = false;
        // keep the idle drain out of the way
        config.cache.idle_flush_interval = Duration::from_secs(3600);
        let engine = WriterEngine::new(config).await.unwrap();

        let nzb = Arc::new(NzbInfo::new(DownloadId(1), "job", dir.path().join("downloads/job")));
        let file = Arc::new(FileInfo::new(engine.queue().next_file_id(), "a.bin", 100, &[(1, 100)]));
        nzb.add_file(Arc::clone(&file));
        engine.queue().add(Arc::clone(&nzb));

        let mut writer = engine.writer(&nzb, &file, 0).unwrap();
        writer
            .start(ArticleFormat::Yenc, None, 100, 0, 100)
            .unwrap();
        writer.write(&[7u8; 100]).unwrap();
        writer.finish(true);
        assert_eq!(engine.cache().allocated(), 100);

        engine.shutdown().await.unwrap();

        assert_eq!(engine.cache().allocated(), 0);
        assert_eq!(file.cached_articles(), 0);
        let result = engine.config().temp_dir().join(format!("{}.001", file.id()));
        assert_eq!(std::fs::read(result).unwrap(), vec![7u8; 100]);
        assert!(!engine.database().has_cache_flag().await.unwrap());
    }
}
