//! Schedule record storage (SQLite).

use crate::error::Result;
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use sqlx::{Row as _, SqlitePool};

/// A persisted interval-based restart schedule for one bot.
///
/// Removing a bot does not delete its schedule; the scheduler tolerates a
/// schedule whose bot no longer exists.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleRecord {
    pub bot_name: String,
    pub raw_interval: String,
    pub interval_minutes: u64,
    pub created_at: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
}

/// Store for schedule records, one per bot.
#[derive(Debug, Clone)]
pub struct ScheduleStore {
    pool: SqlitePool,
}

impl ScheduleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, bot_name: &str) -> Result<Option<ScheduleRecord>> {
        let row = sqlx::query(
            "SELECT bot_name, raw_interval, interval_minutes, created_at, last_run \
             FROM schedules WHERE bot_name = ?",
        )
        .bind(bot_name)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch schedule record")?;

        row.map(record_from_row).transpose()
    }

    /// Insert or replace the schedule for a bot. Last write wins.
    pub async fn upsert(&self, record: &ScheduleRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO schedules (bot_name, raw_interval, interval_minutes, created_at, last_run) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(bot_name) DO UPDATE SET \
               raw_interval = excluded.raw_interval, \
               interval_minutes = excluded.interval_minutes, \
               created_at = excluded.created_at, \
               last_run = excluded.last_run",
        )
        .bind(&record.bot_name)
        .bind(&record.raw_interval)
        .bind(record.interval_minutes as i64)
        .bind(record.created_at.to_rfc3339())
        .bind(record.last_run.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .context("failed to upsert schedule record")?;

        Ok(())
    }

    /// Delete a bot's schedule. Returns whether one existed.
    pub async fn delete(&self, bot_name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM schedules WHERE bot_name = ?")
            .bind(bot_name)
            .execute(&self.pool)
            .await
            .context("failed to delete schedule record")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list(&self) -> Result<Vec<ScheduleRecord>> {
        let rows = sqlx::query(
            "SELECT bot_name, raw_interval, interval_minutes, created_at, last_run \
             FROM schedules ORDER BY bot_name",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list schedule records")?;

        rows.into_iter().map(record_from_row).collect()
    }

    /// Record a trigger firing, atomically.
    pub async fn touch_last_run(&self, bot_name: &str, when: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE schedules SET last_run = ? WHERE bot_name = ?")
            .bind(when.to_rfc3339())
            .bind(bot_name)
            .execute(&self.pool)
            .await
            .context("failed to update schedule last_run")?;
        Ok(())
    }
}

fn record_from_row(row: sqlx::sqlite::SqliteRow) -> Result<ScheduleRecord> {
    let created_raw: String = row
        .try_get("created_at")
        .context("failed to read schedule created_at")?;
    let created_at = DateTime::parse_from_rfc3339(&created_raw)
        .with_context(|| format!("invalid created_at timestamp in database: {created_raw}"))?
        .with_timezone(&Utc);

    let last_run = row
        .try_get::<Option<String>, _>("last_run")
        .ok()
        .flatten()
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|t| t.with_timezone(&Utc))
                .with_context(|| format!("invalid last_run timestamp in database: {raw}"))
        })
        .transpose()?;

    let interval_minutes: i64 = row
        .try_get("interval_minutes")
        .context("failed to read schedule interval")?;

    Ok(ScheduleRecord {
        bot_name: row
            .try_get("bot_name")
            .context("failed to read schedule bot_name")?,
        raw_interval: row
            .try_get("raw_interval")
            .context("failed to read schedule raw_interval")?,
        interval_minutes: interval_minutes as u64,
        created_at,
        last_run,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_store() -> ScheduleStore {
        let pool = crate::db::connect_in_memory()
            .await
            .expect("in-memory database should open");
        ScheduleStore::new(pool)
    }

    fn schedule(bot: &str, raw: &str, minutes: u64) -> ScheduleRecord {
        ScheduleRecord {
            bot_name: bot.to_string(),
            raw_interval: raw.to_string(),
            interval_minutes: minutes,
            created_at: Utc::now(),
            last_run: None,
        }
    }

    #[tokio::test]
    async fn upsert_replaces_and_last_write_wins() {
        let store = setup_store().await;

        store
            .upsert(&schedule("alpha", "2h", 120))
            .await
            .expect("first upsert");
        store
            .upsert(&schedule("alpha", "30m", 30))
            .await
            .expect("second upsert");

        let all = store.list().await.expect("list");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].raw_interval, "30m");
        assert_eq!(all[0].interval_minutes, 30);
    }

    #[tokio::test]
    async fn delete_reports_existence_and_list_excludes_deleted() {
        let store = setup_store().await;
        store
            .upsert(&schedule("alpha", "1d", 1440))
            .await
            .expect("upsert");

        assert!(store.delete("alpha").await.expect("delete"));
        assert!(!store.delete("alpha").await.expect("second delete"));

        let all = store.list().await.expect("list");
        assert!(all.iter().all(|s| s.bot_name != "alpha"));
    }

    #[tokio::test]
    async fn touch_last_run_persists() {
        let store = setup_store().await;
        store
            .upsert(&schedule("beta", "2h", 120))
            .await
            .expect("upsert");

        let when = Utc::now();
        store
            .touch_last_run("beta", when)
            .await
            .expect("touch_last_run");

        let fetched = store.get("beta").await.expect("get").expect("exists");
        assert_eq!(
            fetched.last_run.map(|t| t.timestamp()),
            Some(when.timestamp())
        );
    }
}
