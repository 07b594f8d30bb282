//! End-to-end tests of the writer engine: out-of-order segments, the
//! background flusher, memory pressure and shutdown.

mod common;

use std::time::Duration;

use common::{
    add_download, expected_file, test_engine, wait_until, write_article, SEGMENT_SIZE,
};
use usenet_writer::{CompletionStatus, Event, crc32};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn out_of_order_segments_assemble_with_direct_write() {
    let (engine, _dir) = test_engine(|_| {}).await;
    let (nzb, file) = add_download(&engine, 1, "movie.mkv", 4);

    for index in [2, 0, 3, 1] {
        write_article(&engine, &nzb, &file, index).await;
    }
    let status = engine.complete_file(&nzb, &file).await.unwrap();

    assert_eq!(status, CompletionStatus::Success);
    let output = std::fs::read(nzb.dest_dir().join("movie.mkv")).unwrap();
    assert_eq!(output, expected_file(4));
    assert_eq!(file.crc(), crc32::checksum(&output));
    assert_eq!(engine.cache().allocated(), 0);

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn out_of_order_segments_assemble_without_direct_write() {
    let (engine, _dir) = test_engine(|c| c.cache.direct_write = false).await;
    let (nzb, file) = add_download(&engine, 1, "movie.mkv", 4);

    for index in [3, 1, 0, 2] {
        write_article(&engine, &nzb, &file, index).await;
    }
    let status = engine.complete_file(&nzb, &file).await.unwrap();

    assert_eq!(status, CompletionStatus::Success);
    let output = std::fs::read(nzb.dest_dir().join("movie.mkv")).unwrap();
    assert_eq!(output, expected_file(4));

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn small_cache_stays_bounded_and_output_is_unchanged() {
    // 1 MB cache, 3 MB file
    let count = 48;
    let (engine, _dir) = test_engine(|c| {
        c.cache.article_cache_mb = 1;
        c.cache.direct_write = false;
    })
    .await;
    let (nzb, file) = add_download(&engine, 1, "big.bin", count);
    let max_bytes = engine.cache().max_bytes();

    for index in (0..count).rev() {
        write_article(&engine, &nzb, &file, index).await;
        assert!(engine.cache().allocated() <= max_bytes);
    }
    let status = engine.complete_file(&nzb, &file).await.unwrap();

    assert_eq!(status, CompletionStatus::Success);
    let output = std::fs::read(nzb.dest_dir().join("big.bin")).unwrap();
    assert_eq!(output.len(), count * SEGMENT_SIZE);
    assert_eq!(output, expected_file(count));

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_flusher_drains_cached_segments() {
    let (engine, _dir) = test_engine(|c| {
        c.cache.direct_write = false;
        c.cache.idle_flush_interval = Duration::from_millis(50);
    })
    .await;
    let mut events = engine.subscribe();
    let (nzb, file) = add_download(&engine, 1, "show.mkv", 2);

    write_article(&engine, &nzb, &file, 0).await;
    write_article(&engine, &nzb, &file, 1).await;

    let drained = wait_until(Duration::from_secs(5), || engine.cache().allocated() == 0).await;
    assert!(drained, "flusher did not drain the idle file");
    assert_eq!(file.cached_articles(), 0);

    // one pass normally, two if the flusher ran between the writes
    let mut flushed = 0;
    while flushed < 2 {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            Event::CacheFlushed { file_id, articles, .. } => {
                assert_eq!(file_id, file.id());
                flushed += articles;
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(flushed, 2);

    // completion joins from the drained result files
    let status = engine.complete_file(&nzb, &file).await.unwrap();
    assert_eq!(status, CompletionStatus::Success);
    let output = std::fs::read(nzb.dest_dir().join("show.mkv")).unwrap();
    assert_eq!(output, expected_file(2));

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_flusher_skips_files_with_running_downloads() {
    let (engine, _dir) = test_engine(|c| {
        c.cache.direct_write = false;
        c.cache.idle_flush_interval = Duration::from_millis(20);
    })
    .await;
    let (nzb, file) = add_download(&engine, 1, "show.mkv", 2);
    file.download_started();

    write_article(&engine, &nzb, &file, 0).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(file.cached_articles(), 1, "file with running downloads must stay cached");

    // shutdown drains regardless
    engine.shutdown().await.unwrap();
    assert_eq!(file.cached_articles(), 0);
    assert_eq!(engine.cache().allocated(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_leaves_empty_cache_and_clean_state() {
    let (engine, _dir) = test_engine(|c| {
        c.cache.direct_write = false;
        c.cache.idle_flush_interval = Duration::from_secs(3600);
    })
    .await;
    let (nzb, file) = add_download(&engine, 1, "show.mkv", 3);
    for index in 0..3 {
        write_article(&engine, &nzb, &file, index).await;
    }
    assert!(engine.cache().allocated() > 0);

    let mut flagged = false;
    for _ in 0..500 {
        if engine.database().has_cache_flag().await.unwrap() {
            flagged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(flagged, "non-empty cache marker was not persisted");

    engine.shutdown().await.unwrap();

    assert_eq!(engine.cache().allocated(), 0);
    assert!(!engine.database().has_cache_flag().await.unwrap());
    assert!(!engine.database().was_unclean_shutdown().await.unwrap());

    let status = engine.complete_file(&nzb, &file).await.unwrap();
    assert_eq!(status, CompletionStatus::Success);
    assert_eq!(
        std::fs::read(nzb.dest_dir().join("show.mkv")).unwrap(),
        expected_file(3)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn change_dest_dir_moves_completed_files() {
    let (engine, dir) = test_engine(|_| {}).await;
    let (nzb, file) = add_download(&engine, 1, "movie.mkv", 1);
    write_article(&engine, &nzb, &file, 0).await;
    engine.complete_file(&nzb, &file).await.unwrap();
    let old_dest = nzb.dest_dir();

    let new_dest = dir.path().join("downloads").join("Movies").join("movie");
    engine.change_dest_dir(&nzb, new_dest.clone()).await.unwrap();

    assert_eq!(std::fs::read(new_dest.join("movie.mkv")).unwrap(), expected_file(1));
    assert!(!old_dest.exists());

    engine.shutdown().await.unwrap();
}
