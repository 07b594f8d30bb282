//! # usenet-writer
//!
//! Segment cache and file assembly engine for Usenet download clients.
//!
//! Decoded article segments arrive out of order from many connections. This
//! crate holds them in a memory-bounded write-back cache, drains that cache
//! to disk in the background and finally assembles every file from its
//! segments: at the correct offsets, with zero-filled gaps for articles that
//! could not be downloaded and a CRC32 combined from the segment checksums.
//!
//! ## Design Philosophy
//!
//! usenet-writer is designed to be:
//! - **Memory-bounded** - The cache never reserves more than its ceiling; writers fall back to disk
//! - **Sensible defaults** - Works out of the box with zero configuration
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use usenet_writer::{Config, Event, WriterEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.cache.article_cache_mb = 500;
//!
//!     let engine = WriterEngine::new(config).await?;
//!
//!     // Subscribe to events
//!     let mut events = engine.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             if let Event::FileCompleted { path, status, .. } = event {
//!                 println!("{:?}: {:?}", path, status);
//!             }
//!         }
//!     });
//!
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Memory-bounded article cache and its background flusher
pub mod cache;
/// Configuration types
pub mod config;
/// CRC32 helpers
pub mod crc32;
/// Database persistence layer
pub mod db;
/// Engine facade
pub mod engine;
/// Error types
pub mod error;
/// Downloads, files and articles
pub mod queue;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;
/// Segment placement, cache drains and file assembly
pub mod writer;

// Re-export commonly used types
pub use cache::{ArticleCache, CacheFlusher, CachedSegment};
pub use config::{CacheConfig, Config, PathsConfig, PersistenceConfig};
pub use db::Database;
pub use engine::WriterEngine;
pub use error::{DatabaseError, Error, Result, WriteError};
pub use queue::{
    ArticleInfo, CompletedFile, DownloadQueue, DupeMode, FileInfo, NzbInfo, SegmentContent,
};
pub use types::{
    ArticleFormat, ArticleStatus, CompletionStatus, DownloadId, Event, FileId, Message,
    MessageKind,
};
pub use writer::{
    ArticleWriter, FileAssembler, FlushOutcome, StartOutcome, WriterContext, move_completed_files,
};
