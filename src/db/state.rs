//! Runtime state tracking: shutdown detection and the article cache marker.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::Database;

const CACHE_FLAG_KEY: &str = "article_cache";

impl Database {
    /// Check if the last shutdown was unclean
    ///
    /// Returns true if the previous session did not call set_clean_shutdown(),
    /// indicating a crash or forced termination.
    pub async fn was_unclean_shutdown(&self) -> Result<bool> {
        let value: Option<String> = sqlx::query_scalar(
            r#"
            SELECT value FROM runtime_state WHERE key = 'clean_shutdown'
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to check shutdown state: {}",
                e
            )))
        })?;

        // If the value is missing or "false", it was an unclean shutdown
        Ok(value.is_none_or(|v| v != "true"))
    }

    /// Mark that the application has started cleanly
    ///
    /// If set_clean_shutdown() is not called before the next startup,
    /// was_unclean_shutdown() will return true.
    pub async fn set_clean_start(&self) -> Result<()> {
        self.set_state("clean_shutdown", "false", "set clean start")
            .await
    }

    /// Mark that the application is shutting down cleanly
    pub async fn set_clean_shutdown(&self) -> Result<()> {
        self.set_state("clean_shutdown", "true", "set clean shutdown")
            .await
    }

    /// Record that the article cache holds data
    ///
    /// Segments held only in memory are lost if the process dies while this
    /// flag is set; the next session uses it to report that.
    pub async fn write_cache_flag(&self) -> Result<()> {
        self.set_state(CACHE_FLAG_KEY, "1", "write article cache flag")
            .await
    }

    /// Clear the article cache flag
    pub async fn delete_cache_flag(&self) -> Result<()> {
        sqlx::query("DELETE FROM runtime_state WHERE key = ?")
            .bind(CACHE_FLAG_KEY)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete article cache flag: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Whether the article cache flag is set
    pub async fn has_cache_flag(&self) -> Result<bool> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM runtime_state WHERE key = ?")
                .bind(CACHE_FLAG_KEY)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to read article cache flag: {}",
                        e
                    )))
                })?;

        Ok(value.is_some())
    }

    async fn set_state(&self, key: &str, value: &str, what: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO runtime_state (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to {}: {}",
                what, e
            )))
        })?;

        Ok(())
    }
}
