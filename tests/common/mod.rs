//! Common test utilities for usenet-writer integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use usenet_writer::{
    ArticleFormat, Config, DownloadId, FileInfo, NzbInfo, StartOutcome, WriterEngine,
};

/// Size of the segments produced by [`segment`]
pub const SEGMENT_SIZE: usize = 64 * 1024;

/// Create an engine rooted in a fresh temp directory
///
/// The returned `TempDir` must outlive the engine.
pub async fn test_engine(configure: impl FnOnce(&mut Config)) -> (WriterEngine, TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");

    let mut config = Config::default();
    config.paths.download_dir = dir.path().join("downloads");
    config.paths.temp_dir = dir.path().join("temp");
    config.persistence.database_path = dir.path().join("state.db");
    configure(&mut config);

    let engine = WriterEngine::new(config)
        .await
        .expect("Failed to start engine");
    (engine, dir)
}

/// Register a download with a single file split into `count` equal segments
pub fn add_download(
    engine: &WriterEngine,
    id: i64,
    filename: &str,
    count: usize,
) -> (Arc<NzbInfo>, Arc<FileInfo>) {
    let dest = engine.config().paths.download_dir.join(format!("job-{id}"));
    let nzb = Arc::new(NzbInfo::new(DownloadId(id), format!("job-{id}"), dest));
    let parts: Vec<(u32, u32)> = (1..=count as u32)
        .map(|part| (part, SEGMENT_SIZE as u32))
        .collect();
    let file = Arc::new(FileInfo::new(
        engine.queue().next_file_id(),
        filename,
        (count * SEGMENT_SIZE) as u64,
        &parts,
    ));
    nzb.add_file(Arc::clone(&file));
    engine.queue().add(Arc::clone(&nzb));
    (nzb, file)
}

/// Deterministic content of segment `index`
pub fn segment(index: usize) -> Vec<u8> {
    (0..SEGMENT_SIZE)
        .map(|i| (i as u8).wrapping_add((index as u8).wrapping_mul(17)))
        .collect()
}

/// Concatenation of the first `count` segments
pub fn expected_file(count: usize) -> Vec<u8> {
    (0..count).flat_map(segment).collect()
}

/// Download one article on a blocking thread, the way a decoder thread would
pub async fn write_article(
    engine: &WriterEngine,
    nzb: &Arc<NzbInfo>,
    file: &Arc<FileInfo>,
    index: usize,
) {
    let mut writer = engine
        .writer(nzb, file, index)
        .expect("Failed to create writer");
    let filename = file.filename();
    let file_size = file.size();

    tokio::task::spawn_blocking(move || {
        let outcome = writer
            .start(
                ArticleFormat::Yenc,
                Some(&filename),
                file_size,
                (index * SEGMENT_SIZE) as u64,
                SEGMENT_SIZE as u32,
            )
            .expect("Failed to start article");
        assert_eq!(outcome, StartOutcome::Ready);
        writer
            .write(&segment(index))
            .expect("Failed to write article");
        writer.finish(true);
    })
    .await
    .expect("Writer task panicked");
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
