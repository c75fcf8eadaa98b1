//! Webhook registrations.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// One external build trigger, addressed by its target name.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Webhook {
    pub id: i64,
    pub target: String,
    pub secret: String,
    pub proc_name: String,
    pub version: String,
}

/// CRUD access to the webhook rows.
#[derive(Debug, Clone)]
pub struct WebhookStore {
    pool: SqlitePool,
}

impl WebhookStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<Webhook>, sqlx::Error> {
        sqlx::query_as::<_, Webhook>(
            "SELECT id, target, secret, proc_name, version FROM webhooks ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
    }

    pub async fn append(
        &self,
        target: &str,
        secret: &str,
        proc_name: &str,
        version: &str,
    ) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO webhooks (target, secret, proc_name, version) VALUES ($1, $2, $3, $4)",
        )
        .bind(target)
        .bind(secret)
        .bind(proc_name)
        .bind(version)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn update(
        &self,
        id: i64,
        target: &str,
        secret: &str,
        proc_name: &str,
        version: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE webhooks SET target = $1, secret = $2, proc_name = $3, version = $4
             WHERE id = $5",
        )
        .bind(target)
        .bind(secret)
        .bind(proc_name)
        .bind(version)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM webhooks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn get_by_target(&self, target: &str) -> Result<Option<Webhook>, sqlx::Error> {
        sqlx::query_as::<_, Webhook>(
            "SELECT id, target, secret, proc_name, version FROM webhooks
             WHERE target = $1 LIMIT 1",
        )
        .bind(target)
        .fetch_optional(&self.pool)
        .await
    }

    /// Fetch the row for `target`, inserting one with the given fields
    /// first if none exists.
    pub async fn get_by_target_or_create(
        &self,
        target: &str,
        secret: &str,
        proc_name: &str,
        version: &str,
    ) -> Result<Webhook, sqlx::Error> {
        if let Some(hook) = self.get_by_target(target).await? {
            return Ok(hook);
        }

        let id = self.append(target, secret, proc_name, version).await?;
        Ok(Webhook {
            id,
            target: target.to_owned(),
            secret: secret.to_owned(),
            proc_name: proc_name.to_owned(),
            version: version.to_owned(),
        })
    }
}
