//! Bot lifecycle supervisor.
//!
//! Owns every start, stop, and restart in the fleet. Restarts of the same
//! bot are mutually exclusive: whoever holds the per-bot lock proceeds, any
//! concurrent trigger is dropped rather than queued, so a storm of crash
//! detections and manual restarts collapses into one restart.

use crate::config::{BotConfig, Config, extract_token, load_env_file};
use crate::credentials::CredentialValidator;
use crate::error::{ConfigError, GatewayError, Result, SupervisorError};
use crate::runtime::{ResourceState, ResourceStats, RunSpec, RuntimeGateway};
use crate::store::{BotRecord, BotStatus, BotStore};
use crate::webhook::{BotEvent, Notifier};
use crate::{container_name, image_tag};
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

/// Grace period before the runtime kills a container on stop.
const STOP_TIMEOUT_SECS: i32 = 10;

/// Delay before the nth restart attempt: the configured base delay doubled
/// per failed attempt (attempt 0 waits the base delay).
pub fn backoff_delay(retry_delay_seconds: u64, attempt: u32) -> Duration {
    Duration::from_secs(retry_delay_seconds.saturating_mul(1u64 << attempt.min(32)))
}

/// One row of `list` output.
#[derive(Debug, Clone, Serialize)]
pub struct BotSummary {
    pub name: String,
    pub status: BotStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime: String,
}

/// Resource usage and state for one bot.
#[derive(Debug, Clone, Serialize)]
pub struct BotMetrics {
    pub name: String,
    pub status: BotStatus,
    pub uptime: String,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub memory_percent: f64,
}

/// Fleet-wide health roll-up.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// "healthy" while no bot sits in the crashed state, "degraded"
    /// otherwise.
    pub status: &'static str,
    pub total: usize,
    pub running: usize,
    pub crashed: usize,
}

pub struct Supervisor {
    config: Arc<Config>,
    bots: BotStore,
    gateway: Arc<dyn RuntimeGateway>,
    notifier: Arc<dyn Notifier>,
    validator: Arc<dyn CredentialValidator>,
    restart_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Supervisor {
    pub fn new(
        config: Arc<Config>,
        bots: BotStore,
        gateway: Arc<dyn RuntimeGateway>,
        notifier: Arc<dyn Notifier>,
        validator: Arc<dyn CredentialValidator>,
    ) -> Self {
        Self {
            config,
            bots,
            gateway,
            notifier,
            validator,
            restart_locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &BotStore {
        &self.bots
    }

    /// Validate, build, and run a bot.
    ///
    /// The runtime is authoritative for "already running": a stale `running`
    /// row in the store does not block a start, a live container does. On
    /// any failure past the point where the store was touched, the record
    /// rolls back to its prior state.
    pub async fn start(
        &self,
        name: &str,
        config_override: Option<&str>,
        env_override: Option<&str>,
    ) -> Result<()> {
        let bot_dir = self.config.bot_dir(name);
        if !bot_dir.is_dir() {
            return Err(ConfigError::BotDirectoryMissing {
                path: bot_dir.display().to_string(),
            }
            .into());
        }

        let config = BotConfig::load(&bot_dir, config_override)?;

        let dockerfile = bot_dir.join(&config.dockerfile);
        if !dockerfile.exists() {
            return Err(ConfigError::DockerfileMissing {
                path: dockerfile.display().to_string(),
            }
            .into());
        }

        let env_path = bot_dir.join(env_override.unwrap_or(&config.env_file));
        let env = load_env_file(&env_path)?;

        let container = container_name(name);
        match self.gateway.get(&container).await {
            Ok(resource) if resource.state == ResourceState::Running => {
                return Err(SupervisorError::AlreadyRunning { bot: name.into() }.into());
            }
            Ok(_) => {}
            Err(GatewayError::NotFound { .. }) => {}
            Err(error) => return Err(error.into()),
        }

        if let Some(token) = extract_token(&env) {
            let accepted = self
                .validator
                .validate(token)
                .await
                .with_context(|| format!("token validation failed for bot {name}"))?;
            if !accepted {
                return Err(ConfigError::InvalidToken { bot: name.into() }.into());
            }
        }

        let prior = self.bots.get(name).await?;
        let mut record = prior
            .clone()
            .unwrap_or_else(|| BotRecord::new(name, config.clone()));
        record.config = config.clone();
        record.status = BotStatus::Starting;
        record.started_at = Some(Utc::now());
        self.bots.upsert(&record).await?;

        // A leftover container with our name blocks creation; clear it.
        match self.gateway.remove(&container, true).await {
            Ok(()) | Err(GatewayError::NotFound { .. }) => {}
            Err(error) => {
                self.roll_back(name, prior).await;
                return Err(error.into());
            }
        }

        let spec = RunSpec {
            bot: name.to_string(),
            container: container.clone(),
            image: image_tag(name),
            context_dir: bot_dir,
            dockerfile: config.dockerfile.clone(),
            env,
            auto_restart: config.auto_restart,
        };

        info!(bot = %name, image = %spec.image, "building bot image");
        if let Err(error) = self.gateway.build(&spec).await {
            self.roll_back(name, prior).await;
            return Err(error.into());
        }

        info!(bot = %name, container = %container, "starting bot container");
        if let Err(error) = self.gateway.run(&spec).await {
            self.roll_back(name, prior).await;
            return Err(error.into());
        }

        record.status = BotStatus::Running;
        record.started_at = Some(Utc::now());
        record.exit_code = None;
        self.bots.upsert(&record).await?;

        info!(bot = %name, "bot started");
        self.notify(&config, BotEvent::Started { bot: name.into() })
            .await;
        Ok(())
    }

    /// Stop and remove a bot's container, converging the record to stopped.
    ///
    /// A missing container means the bot is already stopped, so repeated
    /// calls succeed. A live runtime failure propagates without touching
    /// the record, which keeps crash detection honest.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let container = container_name(name);

        let stopped = match self.gateway.stop(&container, STOP_TIMEOUT_SECS).await {
            Ok(()) => true,
            Err(GatewayError::NotFound { .. }) => {
                debug!(bot = %name, "no container to stop");
                false
            }
            Err(error) => return Err(error.into()),
        };

        let removed = match self.gateway.remove(&container, false).await {
            Ok(()) => true,
            Err(GatewayError::NotFound { .. }) => false,
            Err(error) => return Err(error.into()),
        };

        // An unknown name with no container is a no-op, not a new record.
        let record = self.bots.get(name).await?;
        let Some(mut record) = record.or_else(|| {
            (stopped || removed).then(|| BotRecord::new(name, BotConfig::default()))
        }) else {
            debug!(bot = %name, "nothing to stop");
            return Ok(());
        };
        let config = record.config.clone();
        record.status = BotStatus::Stopped;
        record.stopped_at = Some(Utc::now());
        record.started_at = None;
        self.bots.upsert(&record).await?;

        info!(bot = %name, "bot stopped");
        self.notify(&config, BotEvent::Stopped { bot: name.into() })
            .await;
        Ok(())
    }

    /// Stop then start a bot, guarded by the per-bot restart lock.
    ///
    /// Returns `RestartInFlight` when another restart of the same bot is
    /// already underway; the caller's trigger is dropped, not queued.
    pub async fn restart(&self, name: &str) -> Result<()> {
        let _guard = self.try_restart_guard(name)?;
        self.restart_locked(name).await
    }

    /// Crash-restart procedure: up to `max_retries` attempts with the base
    /// delay doubled per attempt. Holds the restart lock across the whole
    /// episode so sweeps and operators cannot pile on.
    ///
    /// A concurrent restart already holding the lock means recovery is
    /// effectively in hand, so that case returns `Ok` after dropping the
    /// trigger.
    pub async fn recover(&self, name: &str) -> Result<()> {
        let _guard = match self.try_restart_guard(name) {
            Ok(guard) => guard,
            Err(_) => {
                info!(bot = %name, "restart already in flight, dropping crash recovery trigger");
                return Ok(());
            }
        };

        let Some(record) = self.bots.get(name).await? else {
            warn!(bot = %name, "crash recovery triggered for unknown bot");
            return Ok(());
        };
        let config = record.config.clone();
        let max_retries = config.max_retries.max(1);
        self.bots.set_status(name, BotStatus::Restarting).await?;

        for attempt in 0..max_retries {
            info!(
                bot = %name,
                attempt = attempt + 1,
                max_retries,
                "attempting crash restart"
            );
            match self.restart_locked(name).await {
                Ok(()) => {
                    info!(bot = %name, attempt = attempt + 1, "bot recovered");
                    self.notify(
                        &config,
                        BotEvent::Restarted {
                            bot: name.into(),
                            attempt: attempt + 1,
                        },
                    )
                    .await;
                    return Ok(());
                }
                Err(error) => {
                    warn!(bot = %name, attempt = attempt + 1, %error, "restart attempt failed");
                }
            }
            if attempt + 1 < max_retries {
                tokio::time::sleep(backoff_delay(config.retry_delay_seconds, attempt)).await;
            }
        }

        self.bots.set_status(name, BotStatus::Crashed).await?;
        error!(
            bot = %name,
            attempts = max_retries,
            "crash recovery exhausted, bot needs operator intervention"
        );
        self.notify(
            &config,
            BotEvent::RecoveryFailed {
                bot: name.into(),
                attempts: max_retries,
            },
        )
        .await;
        Err(SupervisorError::RetriesExhausted {
            bot: name.into(),
            attempts: max_retries,
        }
        .into())
    }

    /// Stop a bot and delete its record. Schedules are left to their own
    /// store; a re-added bot picks its schedule back up.
    pub async fn remove(&self, name: &str) -> Result<()> {
        if self.bots.get(name).await?.is_none() {
            return Err(SupervisorError::BotNotFound { bot: name.into() }.into());
        }
        self.stop(name).await?;
        self.bots.delete(name).await?;
        {
            let mut locks = match self.restart_locks.lock() {
                Ok(locks) => locks,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks.remove(name);
        }
        info!(bot = %name, "bot removed");
        Ok(())
    }

    /// All known bots as display rows.
    pub async fn list(&self) -> Result<Vec<BotSummary>> {
        let now = Utc::now();
        let records = self.bots.list().await?;
        Ok(records
            .into_iter()
            .map(|record| BotSummary {
                uptime: uptime_of(&record, now),
                name: record.name,
                status: record.status,
                started_at: record.started_at,
            })
            .collect())
    }

    /// Resource usage snapshot for one bot.
    pub async fn metrics(&self, name: &str) -> Result<BotMetrics> {
        let record = self
            .bots
            .get(name)
            .await?
            .ok_or_else(|| SupervisorError::BotNotFound { bot: name.into() })?;

        let stats = if record.status == BotStatus::Running {
            match self.gateway.stats(&container_name(name)).await {
                Ok(stats) => stats,
                Err(GatewayError::NotFound { .. }) => ResourceStats::default(),
                Err(error) => return Err(error.into()),
            }
        } else {
            ResourceStats::default()
        };

        Ok(BotMetrics {
            uptime: uptime_of(&record, Utc::now()),
            name: record.name,
            status: record.status,
            cpu_percent: stats.cpu_percent,
            memory_mb: stats.memory_mb,
            memory_percent: stats.memory_percent,
        })
    }

    /// Fleet-wide status counts.
    pub async fn health_snapshot(&self) -> Result<HealthSnapshot> {
        let records = self.bots.list().await?;
        let crashed = records
            .iter()
            .filter(|r| r.status == BotStatus::Crashed)
            .count();
        Ok(HealthSnapshot {
            status: if crashed == 0 { "healthy" } else { "degraded" },
            total: records.len(),
            running: records
                .iter()
                .filter(|r| r.status == BotStatus::Running)
                .count(),
            crashed,
        })
    }

    /// Send an event to the bot's webhook, if one is configured. Delivery
    /// failures are the notifier's problem; lifecycle operations never fail
    /// on notification.
    pub async fn notify(&self, config: &BotConfig, event: BotEvent) {
        if let Some(endpoint) = &config.webhook_url {
            self.notifier.notify(endpoint, &event).await;
        }
    }

    /// Restart without taking the per-bot lock. Callers must hold the guard.
    async fn restart_locked(&self, name: &str) -> Result<()> {
        if let Err(error) = self.stop(name).await {
            warn!(bot = %name, %error, "stop failed during restart, starting anyway");
        }
        tokio::time::sleep(Duration::from_secs(self.config.settle_delay_secs)).await;
        self.start(name, None, None).await
    }

    fn try_restart_guard(&self, name: &str) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = match self.restart_locks.lock() {
                Ok(locks) => locks,
                Err(poisoned) => poisoned.into_inner(),
            };
            Arc::clone(
                locks
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        lock.try_lock_owned()
            .map_err(|_| SupervisorError::RestartInFlight { bot: name.into() }.into())
    }

    async fn roll_back(&self, name: &str, prior: Option<BotRecord>) {
        let result = match prior {
            Some(record) => self.bots.upsert(&record).await,
            None => self.bots.delete(name).await.map(|_| ()),
        };
        if let Err(error) = result {
            warn!(bot = %name, %error, "failed to roll back bot record");
        }
    }
}

fn uptime_of(record: &BotRecord, now: DateTime<Utc>) -> String {
    if record.status != BotStatus::Running {
        return "n/a".to_string();
    }
    match record.started_at {
        Some(started_at) => format_uptime(now.signed_duration_since(started_at)),
        None => "n/a".to_string(),
    }
}

fn format_uptime(elapsed: chrono::Duration) -> String {
    let minutes = elapsed.num_minutes().max(0);
    if minutes >= 60 {
        format!("{}h {}m", minutes / 60, minutes % 60)
    } else {
        format!("{minutes}m")
    }
}
