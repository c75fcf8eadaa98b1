//! Operator-visible event log.
//!
//! Short title/body records of what the service did and what failed,
//! surfaced on the system-logs page. Writes are best-effort: a failing
//! event log must never take down the operation it describes.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use tracing::warn;

/// One logged event. Status 0 is success, 1 is failure.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct MiniLog {
    pub id: i64,
    pub title: String,
    pub body: String,
    pub status: i64,
    pub created_at: String,
}

/// Writer/reader for the event log.
#[derive(Debug, Clone)]
pub struct MiniLogger {
    pool: SqlitePool,
}

impl MiniLogger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a failure with a title and detail body.
    pub async fn failed(&self, title: &str, body: &str) {
        self.insert(title, body, 1).await;
    }

    /// Record a success.
    pub async fn succeeded(&self, title: &str) {
        self.insert(title, "", 0).await;
    }

    /// The newest `limit` events, newest first.
    pub async fn latest(&self, limit: i64) -> Result<Vec<MiniLog>, sqlx::Error> {
        sqlx::query_as::<_, MiniLog>(
            "SELECT id, title, body, status, created_at FROM mini_logs
             ORDER BY id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    async fn insert(&self, title: &str, body: &str, status: i64) {
        let result = sqlx::query("INSERT INTO mini_logs (title, body, status) VALUES ($1, $2, $3)")
            .bind(title)
            .bind(body)
            .bind(status)
            .execute(&self.pool)
            .await;

        if let Err(err) = result {
            warn!("failed to record event log entry '{}': {}", title, err);
        }
    }
}
