use crate::db::*;
use tempfile::NamedTempFile;

#[tokio::test]
async fn test_shutdown_state_initial() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    // After migration, shutdown state should be "false" (unclean)
    assert!(db.was_unclean_shutdown().await.unwrap());

    db.close().await;
}

#[tokio::test]
async fn test_shutdown_state_clean_lifecycle() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    db.set_clean_start().await.unwrap();
    assert!(
        db.was_unclean_shutdown().await.unwrap(),
        "After clean start, should still indicate unclean (not yet shut down)"
    );

    db.set_clean_shutdown().await.unwrap();
    assert!(!db.was_unclean_shutdown().await.unwrap());

    db.close().await;
}

#[tokio::test]
async fn test_shutdown_state_unclean_detection() {
    let temp_file = NamedTempFile::new().unwrap();

    // First session: start but never shut down (simulated crash)
    {
        let db = Database::new(temp_file.path()).await.unwrap();
        db.set_clean_start().await.unwrap();
        db.close().await;
    }

    let db = Database::new(temp_file.path()).await.unwrap();
    assert!(db.was_unclean_shutdown().await.unwrap());
    db.close().await;
}

#[tokio::test]
async fn test_cache_flag_lifecycle() {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();

    assert!(!db.has_cache_flag().await.unwrap());

    db.write_cache_flag().await.unwrap();
    db.write_cache_flag().await.unwrap();
    assert!(db.has_cache_flag().await.unwrap());

    db.delete_cache_flag().await.unwrap();
    assert!(!db.has_cache_flag().await.unwrap());

    // Deleting an absent flag is not an error
    db.delete_cache_flag().await.unwrap();

    db.close().await;
}

#[tokio::test]
async fn test_cache_flag_survives_restart() {
    let temp_file = NamedTempFile::new().unwrap();

    {
        let db = Database::new(temp_file.path()).await.unwrap();
        db.write_cache_flag().await.unwrap();
        db.close().await;
    }

    let db = Database::new(temp_file.path()).await.unwrap();
    assert!(db.has_cache_flag().await.unwrap());
    db.close().await;
}
