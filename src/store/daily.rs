//! Daily build tasks and their firing schedule.

use chrono::{DateTime, Duration, Local, NaiveTime, TimeZone};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// Local wall-clock time the daily tasks fire at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crontab {
    pub hour: u32,
    pub minute: u32,
}

impl Crontab {
    /// The next instant the schedule fires, strictly after `now`.
    pub fn next_occurrence(&self, now: DateTime<Local>) -> DateTime<Local> {
        let fire_time = NaiveTime::from_hms_opt(self.hour, self.minute, 0)
            .unwrap_or(NaiveTime::MIN);

        let today = now.date_naive().and_time(fire_time);
        let candidate = Local
            .from_local_datetime(&today)
            .earliest()
            .unwrap_or(now);

        if candidate > now {
            candidate
        } else {
            candidate + Duration::days(1)
        }
    }
}

/// One package build enqueued every day.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct DailyTask {
    pub id: i64,
    pub proc_name: String,
    pub version: String,
}

/// CRUD access to the daily-task rows.
#[derive(Debug, Clone)]
pub struct DailyTaskStore {
    pool: SqlitePool,
}

impl DailyTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<DailyTask>, sqlx::Error> {
        sqlx::query_as::<_, DailyTask>(
            "SELECT id, proc_name, version FROM daily_tasks ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
    }

    pub async fn append(&self, proc_name: &str, version: &str) -> Result<i64, sqlx::Error> {
        let result = sqlx::query("INSERT INTO daily_tasks (proc_name, version) VALUES ($1, $2)")
            .bind(proc_name)
            .bind(version)
            .execute(&self.pool)
            .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn update(
        &self,
        id: i64,
        proc_name: &str,
        version: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE daily_tasks SET proc_name = $1, version = $2 WHERE id = $3")
            .bind(proc_name)
            .bind(version)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM daily_tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_pool;
    use chrono::Timelike;

    #[tokio::test]
    async fn crud_round_trip() {
        let (_dir, pool) = test_pool().await;
        let store = DailyTaskStore::new(pool);

        let id = store.append("gcc", "7.3.0").await.unwrap();
        store.append("ruby", "2.5.0").await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 2);

        store.update(id, "gcc", "8.1.0").await.unwrap();
        let tasks = store.list().await.unwrap();
        assert_eq!(tasks[0].version, "8.1.0");

        store.delete(id).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[test]
    fn next_occurrence_is_later_today_or_tomorrow() {
        let cron = Crontab { hour: 3, minute: 0 };

        let before = Local.with_ymd_and_hms(2026, 8, 1, 1, 30, 0).unwrap();
        let next = cron.next_occurrence(before);
        assert_eq!(next.date_naive(), before.date_naive());
        assert_eq!((next.hour(), next.minute()), (3, 0));

        let after = Local.with_ymd_and_hms(2026, 8, 1, 3, 0, 0).unwrap();
        let next = cron.next_occurrence(after);
        assert_eq!(next.date_naive(), after.date_naive() + Duration::days(1));
    }
}
