//! Bot record storage (SQLite).

use crate::config::BotConfig;
use crate::error::Result;
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row as _, SqlitePool};

/// Lifecycle status of a supervised bot.
///
/// "removed" is not a stored status: removing a bot deletes its row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    Stopped,
    Starting,
    Running,
    Crashed,
    Restarting,
}

impl BotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BotStatus::Stopped => "stopped",
            BotStatus::Starting => "starting",
            BotStatus::Running => "running",
            BotStatus::Crashed => "crashed",
            BotStatus::Restarting => "restarting",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stopped" => Some(BotStatus::Stopped),
            "starting" => Some(BotStatus::Starting),
            "running" => Some(BotStatus::Running),
            "crashed" => Some(BotStatus::Crashed),
            "restarting" => Some(BotStatus::Restarting),
            _ => None,
        }
    }
}

impl std::fmt::Display for BotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One supervised bot's persisted state.
#[derive(Debug, Clone, PartialEq)]
pub struct BotRecord {
    pub name: String,
    pub status: BotStatus,
    pub config: BotConfig,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub crashed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
}

impl BotRecord {
    /// A fresh record in the stopped state.
    pub fn new(name: impl Into<String>, config: BotConfig) -> Self {
        Self {
            name: name.into(),
            status: BotStatus::Stopped,
            config,
            started_at: None,
            stopped_at: None,
            crashed_at: None,
            exit_code: None,
        }
    }
}

/// Store for bot records. All operations are atomic per record.
#[derive(Debug, Clone)]
pub struct BotStore {
    pool: SqlitePool,
}

impl BotStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, name: &str) -> Result<Option<BotRecord>> {
        let row = sqlx::query(
            "SELECT name, status, config, started_at, stopped_at, crashed_at, exit_code \
             FROM bots WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch bot record")?;

        row.map(record_from_row).transpose()
    }

    /// Insert or replace the full record for a bot.
    pub async fn upsert(&self, record: &BotRecord) -> Result<()> {
        let config_json =
            serde_json::to_string(&record.config).context("failed to serialize bot config")?;

        sqlx::query(
            "INSERT INTO bots (name, status, config, started_at, stopped_at, crashed_at, exit_code) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(name) DO UPDATE SET \
               status = excluded.status, \
               config = excluded.config, \
               started_at = excluded.started_at, \
               stopped_at = excluded.stopped_at, \
               crashed_at = excluded.crashed_at, \
               exit_code = excluded.exit_code",
        )
        .bind(&record.name)
        .bind(record.status.as_str())
        .bind(&config_json)
        .bind(record.started_at.map(|t| t.to_rfc3339()))
        .bind(record.stopped_at.map(|t| t.to_rfc3339()))
        .bind(record.crashed_at.map(|t| t.to_rfc3339()))
        .bind(record.exit_code)
        .execute(&self.pool)
        .await
        .context("failed to upsert bot record")?;

        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM bots WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .context("failed to delete bot record")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list(&self) -> Result<Vec<BotRecord>> {
        let rows = sqlx::query(
            "SELECT name, status, config, started_at, stopped_at, crashed_at, exit_code \
             FROM bots ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list bot records")?;

        rows.into_iter().map(record_from_row).collect()
    }

    pub async fn list_with_status(&self, status: BotStatus) -> Result<Vec<BotRecord>> {
        let rows = sqlx::query(
            "SELECT name, status, config, started_at, stopped_at, crashed_at, exit_code \
             FROM bots WHERE status = ? ORDER BY name",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .context("failed to list bot records by status")?;

        rows.into_iter().map(record_from_row).collect()
    }

    /// Single-statement status update. Last writer wins.
    pub async fn set_status(&self, name: &str, status: BotStatus) -> Result<()> {
        sqlx::query("UPDATE bots SET status = ? WHERE name = ?")
            .bind(status.as_str())
            .bind(name)
            .execute(&self.pool)
            .await
            .context("failed to update bot status")?;
        Ok(())
    }

    /// Mark a bot crashed with the gateway-reported exit code, atomically.
    /// Clears `started_at`: only starting and running bots carry one.
    pub async fn mark_crashed(&self, name: &str, exit_code: Option<i64>) -> Result<()> {
        sqlx::query(
            "UPDATE bots SET status = 'crashed', crashed_at = ?, exit_code = ?, \
             started_at = NULL WHERE name = ?",
        )
            .bind(Utc::now().to_rfc3339())
            .bind(exit_code)
            .bind(name)
            .execute(&self.pool)
            .await
            .context("failed to mark bot crashed")?;
        Ok(())
    }
}

fn parse_timestamp(value: Option<String>, column: &str) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|t| t.with_timezone(&Utc))
                .with_context(|| format!("invalid {column} timestamp in database: {raw}"))
                .map_err(Into::into)
        })
        .transpose()
}

fn record_from_row(row: sqlx::sqlite::SqliteRow) -> Result<BotRecord> {
    let status_value: String = row.try_get("status").context("failed to read bot status")?;
    let status = BotStatus::parse(&status_value)
        .with_context(|| format!("invalid bot status in database: {status_value}"))?;

    let config_json: String = row.try_get("config").context("failed to read bot config")?;
    let config: BotConfig =
        serde_json::from_str(&config_json).context("invalid bot config in database")?;

    Ok(BotRecord {
        name: row.try_get("name").context("failed to read bot name")?,
        status,
        config,
        started_at: parse_timestamp(row.try_get("started_at").ok().flatten(), "started_at")?,
        stopped_at: parse_timestamp(row.try_get("stopped_at").ok().flatten(), "stopped_at")?,
        crashed_at: parse_timestamp(row.try_get("crashed_at").ok().flatten(), "crashed_at")?,
        exit_code: row.try_get("exit_code").ok().flatten(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_store() -> BotStore {
        let pool = crate::db::connect_in_memory()
            .await
            .expect("in-memory database should open");
        BotStore::new(pool)
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips_all_fields() {
        let store = setup_store().await;

        let mut record = BotRecord::new("alpha", BotConfig::default());
        record.status = BotStatus::Running;
        record.started_at = Some(Utc::now());
        record.exit_code = Some(137);
        store.upsert(&record).await.expect("upsert should succeed");

        let fetched = store
            .get("alpha")
            .await
            .expect("get should succeed")
            .expect("record should exist");

        assert_eq!(fetched.name, record.name);
        assert_eq!(fetched.status, record.status);
        assert_eq!(fetched.config, record.config);
        assert_eq!(
            fetched.started_at.map(|t| t.timestamp()),
            record.started_at.map(|t| t.timestamp())
        );
        assert_eq!(fetched.exit_code, record.exit_code);
    }

    #[tokio::test]
    async fn upsert_replaces_existing_record() {
        let store = setup_store().await;

        let mut record = BotRecord::new("alpha", BotConfig::default());
        store.upsert(&record).await.expect("first upsert");

        record.status = BotStatus::Running;
        record.started_at = Some(Utc::now());
        store.upsert(&record).await.expect("second upsert");

        let all = store.list().await.expect("list");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, BotStatus::Running);
    }

    #[tokio::test]
    async fn mark_crashed_sets_exit_code_and_timestamp() {
        let store = setup_store().await;

        let mut record = BotRecord::new("beta", BotConfig::default());
        record.status = BotStatus::Running;
        record.started_at = Some(Utc::now());
        store.upsert(&record).await.expect("upsert");

        store
            .mark_crashed("beta", Some(1))
            .await
            .expect("mark_crashed");

        let fetched = store.get("beta").await.expect("get").expect("exists");
        assert_eq!(fetched.status, BotStatus::Crashed);
        assert_eq!(fetched.exit_code, Some(1));
        assert!(fetched.crashed_at.is_some());
        assert!(fetched.started_at.is_none());
    }

    #[tokio::test]
    async fn delete_reports_whether_a_record_existed() {
        let store = setup_store().await;
        store
            .upsert(&BotRecord::new("gamma", BotConfig::default()))
            .await
            .expect("upsert");

        assert!(store.delete("gamma").await.expect("delete"));
        assert!(!store.delete("gamma").await.expect("second delete"));
        assert!(store.get("gamma").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn list_with_status_filters() {
        let store = setup_store().await;

        let mut running = BotRecord::new("alpha", BotConfig::default());
        running.status = BotStatus::Running;
        store.upsert(&running).await.expect("upsert alpha");
        store
            .upsert(&BotRecord::new("beta", BotConfig::default()))
            .await
            .expect("upsert beta");

        let running = store
            .list_with_status(BotStatus::Running)
            .await
            .expect("list running");
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].name, "alpha");
    }
}
