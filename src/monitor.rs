//! Background sweeps: health reconciliation, crash detection, and cleanup
//! of exited containers.
//!
//! Each sweep runs on its own task and observes a shared cancellation
//! token. The `*_sweep_once` methods do the actual work and return the
//! bots that need crash recovery; the loops spawn `supervisor.recover`
//! per bot so one bot's backoff never stalls a sweep.

use crate::config::MonitorConfig;
use crate::error::{GatewayError, Result};
use crate::runtime::{ResourceState, RuntimeGateway};
use crate::store::BotStatus;
use crate::supervisor::Supervisor;
use crate::webhook::BotEvent;
use crate::{bot_from_container, container_name};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Monitor {
    supervisor: Arc<Supervisor>,
    gateway: Arc<dyn RuntimeGateway>,
    config: MonitorConfig,
}

impl Monitor {
    pub fn new(
        supervisor: Arc<Supervisor>,
        gateway: Arc<dyn RuntimeGateway>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            supervisor,
            gateway,
            config,
        }
    }

    /// Launch the three sweep loops. Returned handles finish once the
    /// token is cancelled.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(&self).health_loop(shutdown.clone())),
            tokio::spawn(Arc::clone(&self).crash_loop(shutdown.clone())),
            tokio::spawn(self.cleanup_loop(shutdown)),
        ]
    }

    /// Health sweep with backoff: after a gateway error the next sweep
    /// waits the longer backoff period instead of the regular one.
    async fn health_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let regular = Duration::from_secs(self.config.health_secs);
        let backoff = Duration::from_secs(self.config.health_backoff_secs);
        let mut period = regular;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
            match self.health_sweep_once().await {
                Ok(recoveries) => {
                    period = regular;
                    self.spawn_recoveries(recoveries);
                }
                Err(error) => {
                    warn!(%error, "health sweep failed, backing off");
                    period = backoff;
                }
            }
        }
        debug!("health sweep stopped");
    }

    async fn crash_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.crash_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.crash_sweep_once().await {
                Ok(recoveries) => self.spawn_recoveries(recoveries),
                Err(error) => warn!(%error, "crash sweep failed"),
            }
        }
        debug!("crash sweep stopped");
    }

    async fn cleanup_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.cleanup_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.cleanup_sweep_once().await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "cleaned up exited containers"),
                Err(error) => warn!(%error, "cleanup sweep failed"),
            }
        }
        debug!("cleanup sweep stopped");
    }

    /// Reconcile bots the store believes are running against the runtime.
    ///
    /// A missing or defunct container, or one that no longer answers a
    /// stats probe, counts as a crash: the record is marked crashed first,
    /// then the bot is queued for recovery when configured. A gateway
    /// failure aborts the sweep so the loop can back off.
    pub async fn health_sweep_once(&self) -> Result<Vec<String>> {
        let store = self.supervisor.store();
        let mut recoveries = Vec::new();

        for record in store.list_with_status(BotStatus::Running).await? {
            let container = container_name(&record.name);
            let (healthy, exit_code) = match self.gateway.get(&container).await {
                Ok(resource) if resource.state == ResourceState::Running => {
                    match self.gateway.stats(&container).await {
                        Ok(_) => (true, None),
                        Err(error) => {
                            warn!(bot = %record.name, %error, "stats probe failed");
                            (false, None)
                        }
                    }
                }
                Ok(resource) => (false, resource.exit_code),
                Err(GatewayError::NotFound { .. }) => (false, None),
                Err(error) => return Err(error.into()),
            };
            if healthy {
                continue;
            }

            warn!(bot = %record.name, ?exit_code, "running bot is unhealthy, marking crashed");
            store.mark_crashed(&record.name, exit_code).await?;
            self.supervisor
                .notify(
                    &record.config,
                    BotEvent::Crashed {
                        bot: record.name.clone(),
                        exit_code,
                    },
                )
                .await;
            if record.config.restart_on_crash {
                recoveries.push(record.name);
            }
        }
        Ok(recoveries)
    }

    /// Scan managed containers for unexpected exits.
    ///
    /// Only acts when the bot's record still says running; anything the
    /// supervisor stopped on purpose is already stopped in the store. The
    /// record is marked crashed before recovery is queued, so an exhausted
    /// recovery still leaves an accurate crash record behind.
    pub async fn crash_sweep_once(&self) -> Result<Vec<String>> {
        let store = self.supervisor.store();
        let mut recoveries = Vec::new();

        for resource in self.gateway.list_managed(true).await? {
            if !resource.state.is_defunct() {
                continue;
            }
            let Some(bot) = bot_from_container(&resource.name) else {
                continue;
            };
            let Some(record) = store.get(bot).await? else {
                continue;
            };
            if record.status != BotStatus::Running {
                continue;
            }

            // Listing omits exit codes, inspect the container for one.
            let exit_code = match resource.exit_code {
                Some(code) => Some(code),
                None => self
                    .gateway
                    .get(&resource.name)
                    .await
                    .ok()
                    .and_then(|r| r.exit_code),
            };

            warn!(bot = %bot, ?exit_code, "managed container exited unexpectedly");
            store.mark_crashed(bot, exit_code).await?;
            self.supervisor
                .notify(
                    &record.config,
                    BotEvent::Crashed {
                        bot: bot.to_string(),
                        exit_code,
                    },
                )
                .await;
            if record.config.restart_on_crash {
                recoveries.push(bot.to_string());
            }
        }
        Ok(recoveries)
    }

    /// Remove exited managed containers so their names free up.
    ///
    /// Containers whose record still says running are left for the crash
    /// sweep; this sweep never writes to the store.
    pub async fn cleanup_sweep_once(&self) -> Result<usize> {
        let store = self.supervisor.store();
        let mut removed = 0;

        for resource in self.gateway.list_managed(true).await? {
            if !resource.state.is_defunct() {
                continue;
            }
            if let Some(bot) = bot_from_container(&resource.name)
                && let Some(record) = store.get(bot).await?
                && record.status == BotStatus::Running
            {
                continue;
            }
            match self.gateway.remove(&resource.name, false).await {
                Ok(()) => {
                    debug!(container = %resource.name, "removed exited container");
                    removed += 1;
                }
                Err(GatewayError::NotFound { .. }) => {}
                Err(error) => {
                    warn!(container = %resource.name, %error, "failed to remove exited container");
                }
            }
        }
        Ok(removed)
    }

    fn spawn_recoveries(&self, bots: Vec<String>) {
        for bot in bots {
            let supervisor = Arc::clone(&self.supervisor);
            tokio::spawn(async move {
                if let Err(error) = supervisor.recover(&bot).await {
                    warn!(bot = %bot, %error, "crash recovery failed");
                }
            });
        }
    }
}
