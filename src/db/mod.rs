//! Database layer for usenet-writer
//!
//! SQLite persistence for the small amount of state the write path keeps
//! across sessions.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - `migrations`: Database lifecycle, schema migrations
//! - `state`: Runtime state (shutdown tracking, article cache marker)

use sqlx::sqlite::SqlitePool;

mod migrations;
mod state;

/// Database handle for usenet-writer
pub struct Database {
    pool: SqlitePool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
