//! Background task draining the article cache to disk
//!
//! The flusher is a small state machine evaluated every poll period:
//!
//! - **IdleWaiting**: the cache is empty; suspend until the first allocation
//!   or shutdown
//! - **Polling**: the cache holds data but no drain is due yet
//! - **Draining**: move all cached segments of one file to disk
//!
//! A drain is due on shutdown, when occupancy reaches the high-water mark
//! while direct-write is active, after `idle_flush_interval` of polling, or
//! right after a drain that found work (back-to-back drains). Any drain taken
//! at or above the high-water mark is forced, so files with running downloads
//! are drained too.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::queue::DownloadQueue;
use crate::writer::{FileAssembler, WriterContext};

/// Occupancy at which a drain starts immediately (90% of the ceiling)
pub fn high_water_mark(max_bytes: usize) -> usize {
    max_bytes / 100 * 90
}

/// Flusher scheduling state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlusherState {
    /// Cache is empty; wait for the first allocation
    IdleWaiting,
    /// Cache holds data; keep polling
    Polling,
    /// Run a drain pass; `force` also drains files with running downloads
    Draining {
        /// Drain files even when article downloads are still active for them
        force: bool,
    },
}

/// Observations the next state is decided on
#[derive(Clone, Copy, Debug)]
pub struct FlushInputs {
    /// Bytes currently reserved in the cache
    pub allocated: usize,
    /// Cache ceiling in bytes
    pub max_bytes: usize,
    /// Whether direct-write is active for the process
    pub direct_write: bool,
    /// Time spent polling since the last drain
    pub idle_elapsed: Duration,
    /// Polling time after which a drain is due
    pub idle_limit: Duration,
    /// Shutdown requested
    pub stopping: bool,
    /// The previous drain pass found work
    pub just_flushed: bool,
}

/// Decide what the flusher does next
pub fn next_state(inputs: &FlushInputs) -> FlusherState {
    if inputs.allocated == 0 && !inputs.stopping {
        return FlusherState::IdleWaiting;
    }

    let high = inputs.allocated >= high_water_mark(inputs.max_bytes);
    let immediate = inputs.direct_write && high;
    if inputs.stopping
        || immediate
        || inputs.just_flushed
        || inputs.idle_elapsed >= inputs.idle_limit
    {
        FlusherState::Draining {
            force: inputs.stopping || high,
        }
    } else {
        FlusherState::Polling
    }
}

/// The single background task moving cached segments to disk
pub struct CacheFlusher {
    ctx: Arc<WriterContext>,
    queue: Arc<DownloadQueue>,
    cancel: CancellationToken,
}

impl CacheFlusher {
    /// Create a flusher for the files of `queue`
    pub fn new(
        ctx: Arc<WriterContext>,
        queue: Arc<DownloadQueue>,
        cancel: CancellationToken,
    ) -> Self {
        Self { ctx, queue, cancel }
    }

    /// Run the flusher on the tokio runtime
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until shutdown is requested and the cache is empty
    pub async fn run(self) {
        let cache = Arc::clone(&self.ctx.cache);
        let poll = self.ctx.config.cache.flush_poll_interval();
        let idle_limit = self.ctx.config.cache.idle_flush_interval;
        let direct_write = self.ctx.config.cache.direct_write;

        let mut idle_elapsed = Duration::ZERO;
        let mut just_flushed = false;

        debug!(max_bytes = cache.max_bytes(), "Cache flusher started");

        loop {
            let stopping = self.cancel.is_cancelled();
            let allocated = cache.allocated();
            if stopping && allocated == 0 {
                break;
            }

            let state = next_state(&FlushInputs {
                allocated,
                max_bytes: cache.max_bytes(),
                direct_write,
                idle_elapsed,
                idle_limit,
                stopping,
                just_flushed,
            });

            match state {
                FlusherState::IdleWaiting => {
                    idle_elapsed = Duration::ZERO;
                    just_flushed = false;
                    tokio::select! {
                        _ = cache.wait_allocated() => {}
                        _ = self.cancel.cancelled() => {}
                    }
                }
                FlusherState::Polling => {
                    tokio::time::sleep(poll).await;
                    idle_elapsed += poll;
                }
                FlusherState::Draining { force } => {
                    idle_elapsed = Duration::ZERO;
                    just_flushed = self.check_flush(force).await;
                    if !just_flushed {
                        // memory may be held by writers that have not finished yet
                        tokio::time::sleep(poll).await;
                    }
                }
            }
        }

        info!("Cache flusher stopped");
    }

    /// Drain the first eligible file; returns whether one was found
    pub async fn check_flush(&self, force: bool) -> bool {
        let Some((nzb, file)) = self.queue.find_flush_candidate(force) else {
            return false;
        };

        let cache = Arc::clone(&self.ctx.cache);
        let file_id = file.id();
        cache.set_busy_file(Some(file_id));

        let assembler = FileAssembler::new(Arc::clone(&self.ctx), nzb, file);
        let result = tokio::task::spawn_blocking(move || assembler.flush_cache()).await;

        cache.set_busy_file(None);

        match result {
            Ok(flushed) => {
                debug!(
                    file_id = file_id.0,
                    articles = flushed.articles,
                    bytes = flushed.bytes,
                    allocated = cache.allocated(),
                    force,
                    "Drained cached segments"
                );
                true
            }
            Err(e) => {
                error!(file_id = file_id.0, error = %e, "Cache drain task failed");
                false
            }
        }
    }
}
