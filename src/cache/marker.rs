//! Persists the "cache not empty" marker so an unclean shutdown with data still
//! in memory can be detected on the next start.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::Database;

/// Spawn a task mirroring the cache's empty/non-empty marker into the database
///
/// Transitions are written as they are observed; intermediate flips that
/// happen faster than the database can be updated collapse into the latest
/// value. On cancellation the current value is written once more.
pub fn spawn_cache_marker_persister(
    db: Arc<Database>,
    mut marker_rx: watch::Receiver<bool>,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut persisted: Option<bool> = None;

        loop {
            let current = *marker_rx.borrow_and_update();
            if persisted != Some(current) {
                sync_marker(&db, current).await;
                persisted = Some(current);
            }

            tokio::select! {
                changed = marker_rx.changed() => {
                    if changed.is_err() {
                        // cache dropped
                        break;
                    }
                }
                _ = cancel_token.cancelled() => {
                    break;
                }
            }
        }

        let current = *marker_rx.borrow();
        if persisted != Some(current) {
            sync_marker(&db, current).await;
        }
    })
}

async fn sync_marker(db: &Database, non_empty: bool) {
    let result = if non_empty {
        db.write_cache_flag().await
    } else {
        db.delete_cache_flag().await
    };
    if let Err(e) = result {
        tracing::error!(non_empty, error = %e, "Failed to persist article cache marker");
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ArticleCache;
    use std::time::Duration;

    async fn wait_for_flag(db: &Database, expected: bool) {
        for _ in 0..100 {
            if db.has_cache_flag().await.unwrap() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("cache flag never became {expected}");
    }

    #[tokio::test]
    async fn marker_follows_cache_occupancy() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        let db = Arc::new(Database::new(temp_file.path()).await.unwrap());
        let cache = ArticleCache::new(1024);
        let cancel = CancellationToken::new();

        let handle =
            spawn_cache_marker_persister(Arc::clone(&db), cache.subscribe_marker(), cancel.clone());

        let segment = cache.alloc(100).unwrap();
        wait_for_flag(&db, true).await;

        drop(segment);
        wait_for_flag(&db, false).await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("persister should stop after cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn cancellation_writes_final_state() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        let db = Arc::new(Database::new(temp_file.path()).await.unwrap());
        db.write_cache_flag().await.unwrap();
        let cache = ArticleCache::new(1024);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let handle =
            spawn_cache_marker_persister(Arc::clone(&db), cache.subscribe_marker(), cancel.clone());
        handle.await.unwrap();

        assert!(!db.has_cache_flag().await.unwrap());
    }
}
