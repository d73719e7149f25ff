//! Interval scheduler: periodic restarts on a per-bot timer.
//!
//! Each scheduled bot gets its own tokio task that fires on an interval.
//! When a timer fires, the schedule's `last_run` is stamped first and the
//! restart goes through the supervisor's guarded path, so a scheduled
//! restart never piles onto a crash recovery already in flight.

use crate::error::{Error, Result, ScheduleError, SupervisorError};
use crate::store::{ScheduleRecord, ScheduleStore};
use crate::supervisor::Supervisor;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::LazyLock;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

static INTERVAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(\d+(?:\.\d+)?)\s*([mhd])$").expect("static regex compiles"));

/// Longest accepted interval: ten years, in minutes. Keeps the parsed value
/// comfortably inside what chrono durations and second conversion can hold.
const MAX_INTERVAL_MINUTES: u64 = 10 * 365 * 24 * 60;

/// Parse an interval string like `30m`, `2h`, `1d`, or `2.5h` into whole
/// minutes. Fractions truncate after unit conversion; anything that lands
/// on zero minutes, or beyond [`MAX_INTERVAL_MINUTES`], is invalid.
pub fn parse_interval(raw: &str) -> Option<u64> {
    let captures = INTERVAL_RE.captures(raw.trim())?;
    let value: f64 = captures[1].parse().ok()?;
    let minutes = match &captures[2].to_ascii_lowercase()[..] {
        "m" => value,
        "h" => value * 60.0,
        "d" => value * 60.0 * 24.0,
        _ => return None,
    };
    let minutes = minutes.trunc();
    if minutes >= 1.0 && minutes <= MAX_INTERVAL_MINUTES as f64 {
        Some(minutes as u64)
    } else {
        None
    }
}

/// Human-readable estimate of a schedule's next firing. Display only; the
/// timer task is the source of truth.
pub fn next_run_estimate(record: &ScheduleRecord, now: DateTime<Utc>) -> String {
    let Some(last_run) = record.last_run else {
        return "soon".to_string();
    };
    // A stored interval beyond what a timestamp can represent has no
    // meaningful estimate.
    let Some(next) = interval_delta(record.interval_minutes)
        .and_then(|step| last_run.checked_add_signed(step))
    else {
        return "unknown".to_string();
    };
    if next <= now {
        return "overdue".to_string();
    }
    let remaining = next - now;
    if remaining.num_days() > 0 {
        format!("in {}d", remaining.num_days())
    } else if remaining.num_hours() > 0 {
        format!("in {}h", remaining.num_hours())
    } else {
        format!("in {}m", remaining.num_minutes().max(1))
    }
}

/// One row of `schedule list` output.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleView {
    pub bot_name: String,
    pub interval: String,
    pub interval_minutes: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: String,
}

pub struct Scheduler {
    store: ScheduleStore,
    supervisor: Arc<Supervisor>,
    timers: RwLock<HashMap<String, tokio::task::JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(store: ScheduleStore, supervisor: Arc<Supervisor>) -> Self {
        Self {
            store,
            supervisor,
            timers: RwLock::new(HashMap::new()),
        }
    }

    /// Install timers for every persisted schedule. Returns how many were
    /// loaded.
    pub async fn load_all(&self) -> Result<usize> {
        let records = self.store.list().await?;
        let count = records.len();
        for record in records {
            self.install_timer(&record).await;
        }
        info!(count, "loaded persisted schedules");
        Ok(count)
    }

    /// Create or replace a bot's schedule. Last write wins; an invalid
    /// interval leaves existing state untouched.
    pub async fn add_schedule(&self, bot: &str, raw: &str) -> Result<ScheduleRecord> {
        let raw = raw.trim();
        let minutes = parse_interval(raw).ok_or_else(|| ScheduleError::InvalidInterval {
            raw: raw.to_string(),
        })?;

        let record = ScheduleRecord {
            bot_name: bot.to_string(),
            raw_interval: raw.to_string(),
            interval_minutes: minutes,
            created_at: Utc::now(),
            last_run: None,
        };
        self.store.upsert(&record).await?;
        self.install_timer(&record).await;
        info!(bot = %bot, interval = %raw, minutes, "schedule installed");
        Ok(record)
    }

    /// Delete a bot's schedule and abort its timer. Returns whether a
    /// schedule existed.
    pub async fn remove_schedule(&self, bot: &str) -> Result<bool> {
        let existed = self.store.delete(bot).await?;
        if let Some(handle) = self.timers.write().await.remove(bot) {
            handle.abort();
            debug!(bot = %bot, "schedule timer aborted");
        }
        Ok(existed)
    }

    /// Fire a bot's schedule right now. `last_run` is stamped before the
    /// restart is attempted, so a failed restart still waits a full
    /// interval.
    pub async fn force_run(&self, bot: &str) -> Result<()> {
        if self.store.get(bot).await?.is_none() {
            return Err(ScheduleError::NotFound {
                bot: bot.to_string(),
            }
            .into());
        }
        self.store.touch_last_run(bot, Utc::now()).await?;
        info!(bot = %bot, "forcing scheduled restart");
        self.supervisor.restart(bot).await
    }

    pub async fn list_schedules(&self) -> Result<Vec<ScheduleView>> {
        let now = Utc::now();
        let records = self.store.list().await?;
        Ok(records
            .into_iter()
            .map(|record| ScheduleView {
                next_run: next_run_estimate(&record, now),
                bot_name: record.bot_name,
                interval: record.raw_interval,
                interval_minutes: record.interval_minutes,
                last_run: record.last_run,
            })
            .collect())
    }

    /// Abort all timer tasks.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.timers.write().await.drain().collect();
        for (bot, handle) in handles {
            handle.abort();
            debug!(bot = %bot, "schedule timer aborted");
        }
    }

    /// Whether a timer task is installed for a bot.
    pub async fn has_timer(&self, bot: &str) -> bool {
        self.timers.read().await.contains_key(bot)
    }

    /// Start the timer task for one schedule, aborting any previous timer
    /// for the same bot first. Dropping a JoinHandle only detaches it.
    async fn install_timer(&self, record: &ScheduleRecord) {
        let bot = record.bot_name.clone();
        {
            let mut timers = self.timers.write().await;
            if let Some(old_handle) = timers.remove(&bot) {
                old_handle.abort();
                debug!(bot = %bot, "aborted existing timer before re-registering");
            }
        }

        let period = Duration::from_secs(record.interval_minutes.max(1).saturating_mul(60));
        let first_tick = Instant::now() + first_delay(record, Utc::now(), period);
        let store = self.store.clone();
        let supervisor = Arc::clone(&self.supervisor);
        let bot_for_task = bot.clone();

        let handle = tokio::spawn(async move {
            let bot = bot_for_task;
            let mut ticker = tokio::time::interval_at(first_tick, period);
            // Skip catch-up ticks if a restart overruns the interval.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                info!(bot = %bot, "scheduled restart firing");
                if let Err(error) = store.touch_last_run(&bot, Utc::now()).await {
                    warn!(bot = %bot, %error, "failed to stamp schedule last run");
                }
                match supervisor.restart(&bot).await {
                    Ok(()) => info!(bot = %bot, "scheduled restart complete"),
                    Err(Error::Supervisor(SupervisorError::RestartInFlight { .. })) => {
                        info!(bot = %bot, "restart already in flight, skipping scheduled restart");
                    }
                    Err(error) => {
                        warn!(bot = %bot, %error, "scheduled restart failed, waiting for next tick");
                    }
                }
            }
        });

        self.timers.write().await.insert(bot, handle);
    }
}

/// Delay before the first tick: resume the cadence from `last_run` when one
/// exists, otherwise wait one full interval. Overdue schedules fire almost
/// immediately rather than instantly, leaving startup a moment to settle.
fn first_delay(record: &ScheduleRecord, now: DateTime<Utc>, period: Duration) -> Duration {
    let Some(last_run) = record.last_run else {
        return period;
    };
    let Some(next) = interval_delta(record.interval_minutes)
        .and_then(|step| last_run.checked_add_signed(step))
    else {
        return period;
    };
    match (next - now).to_std() {
        Ok(remaining) => remaining.min(period),
        Err(_) => Duration::from_secs(1),
    }
}

/// A stored minute count as a chrono delta, when it fits.
fn interval_delta(minutes: u64) -> Option<chrono::Duration> {
    chrono::Duration::try_minutes(i64::try_from(minutes).ok()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::credentials::AcceptAllValidator;
    use crate::error::GatewayError;
    use crate::runtime::{Resource, ResourceStats, RunSpec, RuntimeGateway};
    use crate::store::BotStore;
    use crate::webhook::NullNotifier;
    use crate::{db, store};
    use async_trait::async_trait;

    struct NoopGateway;

    #[async_trait]
    impl RuntimeGateway for NoopGateway {
        async fn build(&self, _spec: &RunSpec) -> std::result::Result<(), GatewayError> {
            Ok(())
        }
        async fn run(&self, _spec: &RunSpec) -> std::result::Result<(), GatewayError> {
            Ok(())
        }
        async fn get(&self, container: &str) -> std::result::Result<Resource, GatewayError> {
            Err(GatewayError::NotFound {
                name: container.to_string(),
            })
        }
        async fn stop(
            &self,
            container: &str,
            _timeout_secs: i32,
        ) -> std::result::Result<(), GatewayError> {
            Err(GatewayError::NotFound {
                name: container.to_string(),
            })
        }
        async fn remove(
            &self,
            container: &str,
            _force: bool,
        ) -> std::result::Result<(), GatewayError> {
            Err(GatewayError::NotFound {
                name: container.to_string(),
            })
        }
        async fn list_managed(
            &self,
            _all: bool,
        ) -> std::result::Result<Vec<Resource>, GatewayError> {
            Ok(Vec::new())
        }
        async fn stats(
            &self,
            container: &str,
        ) -> std::result::Result<ResourceStats, GatewayError> {
            Err(GatewayError::NotFound {
                name: container.to_string(),
            })
        }
    }

    async fn scheduler() -> Scheduler {
        let pool = db::connect_in_memory().await.expect("pool");
        let config = Arc::new(Config {
            data_dir: std::env::temp_dir(),
            bots_dir: std::env::temp_dir().join("botfleet-missing-bots"),
            settle_delay_secs: 0,
            monitor: crate::config::MonitorConfig::default(),
        });
        let supervisor = Arc::new(Supervisor::new(
            config,
            BotStore::new(pool.clone()),
            Arc::new(NoopGateway),
            Arc::new(NullNotifier),
            Arc::new(AcceptAllValidator),
        ));
        Scheduler::new(store::ScheduleStore::new(pool), supervisor)
    }

    #[test]
    fn interval_parsing() {
        assert_eq!(parse_interval("2h"), Some(120));
        assert_eq!(parse_interval("30m"), Some(30));
        assert_eq!(parse_interval("1d"), Some(1440));
        assert_eq!(parse_interval("2.5h"), Some(150));
        assert_eq!(parse_interval(" 45M "), Some(45));
        assert_eq!(parse_interval("0m"), None);
        assert_eq!(parse_interval("0.5m"), None);
        assert_eq!(parse_interval("-1h"), None);
        assert_eq!(parse_interval("abc"), None);
        assert_eq!(parse_interval("2w"), None);
        assert_eq!(parse_interval(""), None);
    }

    #[test]
    fn interval_parsing_rejects_absurd_lengths() {
        assert_eq!(parse_interval("3650d"), Some(3650 * 1440));
        assert_eq!(parse_interval("999999999999999m"), None);
        assert_eq!(parse_interval("99999999d"), None);
    }

    #[test]
    fn estimate_tolerates_an_oversized_stored_interval() {
        // Rows written before the parse cap existed can hold values no
        // chrono delta represents; display must degrade, not panic.
        let record = ScheduleRecord {
            bot_name: "alpha".into(),
            raw_interval: "999999999999999m".into(),
            interval_minutes: 999_999_999_999_999,
            created_at: Utc::now(),
            last_run: Some(Utc::now()),
        };
        assert_eq!(next_run_estimate(&record, Utc::now()), "unknown");
        assert_eq!(
            first_delay(&record, Utc::now(), Duration::from_secs(60)),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn next_run_estimates() {
        let record = ScheduleRecord {
            bot_name: "alpha".into(),
            raw_interval: "1h".into(),
            interval_minutes: 60,
            created_at: Utc::now(),
            last_run: None,
        };
        let now = Utc::now();
        assert_eq!(next_run_estimate(&record, now), "soon");

        let overdue = ScheduleRecord {
            last_run: Some(now - chrono::Duration::hours(3)),
            ..record.clone()
        };
        assert_eq!(next_run_estimate(&overdue, now), "overdue");

        let in_minutes = ScheduleRecord {
            interval_minutes: 5,
            last_run: Some(now),
            ..record.clone()
        };
        assert_eq!(next_run_estimate(&in_minutes, now), "in 5m");

        let in_hours = ScheduleRecord {
            interval_minutes: 90,
            last_run: Some(now),
            ..record.clone()
        };
        assert_eq!(next_run_estimate(&in_hours, now), "in 1h");

        let in_days = ScheduleRecord {
            interval_minutes: 2880,
            last_run: Some(now),
            ..record
        };
        assert_eq!(next_run_estimate(&in_days, now), "in 2d");
    }

    #[tokio::test]
    async fn add_schedule_persists_and_installs_timer() {
        let scheduler = scheduler().await;

        let record = scheduler.add_schedule("alpha", "2h").await.expect("add");
        assert_eq!(record.interval_minutes, 120);
        assert!(scheduler.has_timer("alpha").await);

        let stored = scheduler
            .store
            .get("alpha")
            .await
            .expect("get")
            .expect("record");
        assert_eq!(stored.raw_interval, "2h");
        assert!(stored.last_run.is_none());
    }

    #[tokio::test]
    async fn invalid_interval_changes_nothing() {
        let scheduler = scheduler().await;

        let error = scheduler
            .add_schedule("alpha", "nope")
            .await
            .expect_err("must reject");
        assert!(matches!(
            error,
            Error::Schedule(ScheduleError::InvalidInterval { .. })
        ));
        assert!(scheduler.store.get("alpha").await.expect("get").is_none());
        assert!(!scheduler.has_timer("alpha").await);
    }

    #[tokio::test]
    async fn reinstalling_replaces_the_previous_schedule() {
        let scheduler = scheduler().await;

        scheduler.add_schedule("alpha", "2h").await.expect("add");
        scheduler.add_schedule("alpha", "30m").await.expect("replace");

        let stored = scheduler
            .store
            .get("alpha")
            .await
            .expect("get")
            .expect("record");
        assert_eq!(stored.interval_minutes, 30);
        assert_eq!(scheduler.timers.read().await.len(), 1);
    }

    #[tokio::test]
    async fn remove_schedule_reports_existence() {
        let scheduler = scheduler().await;
        scheduler.add_schedule("alpha", "1d").await.expect("add");

        assert!(scheduler.remove_schedule("alpha").await.expect("remove"));
        assert!(!scheduler.has_timer("alpha").await);
        assert!(!scheduler.remove_schedule("alpha").await.expect("again"));
    }

    #[tokio::test]
    async fn force_run_stamps_last_run_even_when_restart_fails() {
        let scheduler = scheduler().await;
        scheduler.add_schedule("alpha", "1h").await.expect("add");

        // No bot directory exists, so the restart itself fails.
        let result = scheduler.force_run("alpha").await;
        assert!(result.is_err());

        let stored = scheduler
            .store
            .get("alpha")
            .await
            .expect("get")
            .expect("record");
        assert!(stored.last_run.is_some());
    }

    #[tokio::test]
    async fn force_run_requires_a_schedule() {
        let scheduler = scheduler().await;
        let error = scheduler
            .force_run("ghost")
            .await
            .expect_err("must reject");
        assert!(matches!(
            error,
            Error::Schedule(ScheduleError::NotFound { .. })
        ));
    }
}
