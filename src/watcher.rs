//! Git auto-pull watcher.
//!
//! Watches the `.git` directory of every bot that opted into
//! `git_auto_pull`. Debounced changes trigger `git pull origin main`; when
//! the pull brings new commits, the bot is restarted through the
//! supervisor's guarded path and the update is announced.

use crate::error::Result;
use crate::supervisor::Supervisor;
use crate::webhook::BotEvent;
use anyhow::Context as _;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEBOUNCE: Duration = Duration::from_secs(2);

pub struct GitWatcher {
    supervisor: Arc<Supervisor>,
    bots_dir: PathBuf,
}

impl GitWatcher {
    pub fn new(supervisor: Arc<Supervisor>, bots_dir: PathBuf) -> Self {
        Self {
            supervisor,
            bots_dir,
        }
    }

    /// Start watching. Returns once the filesystem watches are installed;
    /// the returned handle finishes when the token is cancelled.
    pub async fn spawn(self, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
        let watched = self.watched_bots().await?;
        if watched.is_empty() {
            info!("no bots with git auto-pull enabled");
        }

        let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<PathBuf>>(64);
        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<Event, notify::Error>| {
                if let Ok(event) = result
                    && should_process(&event)
                {
                    // The callback runs on the watcher's own thread.
                    let _ = tx.blocking_send(event.paths);
                }
            },
            notify::Config::default(),
        )
        .context("failed to create filesystem watcher")?;

        for bot in &watched {
            let git_dir = self.bots_dir.join(bot).join(".git");
            watcher
                .watch(&git_dir, RecursiveMode::NonRecursive)
                .with_context(|| format!("failed to watch {}", git_dir.display()))?;
            info!(bot = %bot, "watching for git updates");
        }

        let handle = tokio::spawn(async move {
            // Keep the watcher alive for the lifetime of the task.
            let _watcher = watcher;
            let mut pending: HashSet<String> = HashSet::new();

            'outer: loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break 'outer,
                    event = rx.recv() => {
                        let Some(paths) = event else { break 'outer };
                        self.collect(&mut pending, paths);

                        // Debounce: swallow the burst before acting.
                        loop {
                            tokio::select! {
                                _ = shutdown.cancelled() => break 'outer,
                                _ = tokio::time::sleep(DEBOUNCE) => break,
                                more = rx.recv() => {
                                    let Some(paths) = more else { break 'outer };
                                    self.collect(&mut pending, paths);
                                }
                            }
                        }

                        for bot in std::mem::take(&mut pending) {
                            self.handle_update(&bot).await;
                        }
                    }
                }
            }
            debug!("git watcher stopped");
        });

        Ok(handle)
    }

    async fn watched_bots(&self) -> Result<Vec<String>> {
        let records = self.supervisor.store().list().await?;
        Ok(records
            .into_iter()
            .filter(|record| record.config.git_auto_pull)
            .filter(|record| self.bots_dir.join(&record.name).join(".git").is_dir())
            .map(|record| record.name)
            .collect())
    }

    fn collect(&self, pending: &mut HashSet<String>, paths: Vec<PathBuf>) {
        for path in paths {
            if let Some(bot) = bot_for_path(&self.bots_dir, &path) {
                pending.insert(bot);
            }
        }
    }

    async fn handle_update(&self, bot: &str) {
        info!(bot = %bot, "git change detected, pulling");
        match self.pull(bot).await {
            // Our own pull writes into .git and re-triggers the watch;
            // that second round resolves as already up to date.
            Ok(false) => debug!(bot = %bot, "repository already up to date"),
            Ok(true) => self.restart_updated(bot).await,
            Err(error) => warn!(bot = %bot, %error, "git pull failed"),
        }
    }

    async fn restart_updated(&self, bot: &str) {
        match self.supervisor.restart(bot).await {
            Ok(()) => {
                info!(bot = %bot, "bot restarted after git update");
                match self.supervisor.store().get(bot).await {
                    Ok(Some(record)) => {
                        self.supervisor
                            .notify(
                                &record.config,
                                BotEvent::Updated {
                                    bot: bot.to_string(),
                                },
                            )
                            .await;
                    }
                    Ok(None) => {}
                    Err(error) => warn!(bot = %bot, %error, "failed to load bot record"),
                }
            }
            Err(error) => warn!(bot = %bot, %error, "restart after git update failed"),
        }
    }

    /// Run `git pull origin main` in the bot directory. Returns whether the
    /// pull brought new commits.
    async fn pull(&self, bot: &str) -> anyhow::Result<bool> {
        let output = tokio::process::Command::new("git")
            .args(["pull", "origin", "main"])
            .current_dir(self.bots_dir.join(bot))
            .output()
            .await
            .context("failed to run git pull")?;

        if !output.status.success() {
            anyhow::bail!(
                "git pull exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(!stdout.contains("Already up to date"))
    }
}

fn should_process(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Resolve which bot a filesystem event path belongs to.
fn bot_for_path(bots_dir: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(bots_dir).ok()?;
    let first = relative.components().next()?;
    Some(first.as_os_str().to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BotConfig, Config};
    use crate::credentials::AcceptAllValidator;
    use crate::db;
    use crate::error::GatewayError;
    use crate::runtime::{Resource, ResourceStats, RunSpec, RuntimeGateway};
    use crate::store::{BotRecord, BotStore};
    use crate::webhook::NullNotifier;
    use async_trait::async_trait;

    #[test]
    fn event_paths_resolve_to_bot_names() {
        let bots_dir = Path::new("/srv/bots");
        assert_eq!(
            bot_for_path(bots_dir, Path::new("/srv/bots/alpha/.git/HEAD")),
            Some("alpha".to_string())
        );
        assert_eq!(
            bot_for_path(bots_dir, Path::new("/srv/bots/beta/.git/refs/heads/main")),
            Some("beta".to_string())
        );
        assert_eq!(bot_for_path(bots_dir, Path::new("/etc/passwd")), None);
    }

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

    #[tokio::test]
    async fn only_opted_in_bots_with_a_repo_are_watched() {
        let bots_dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(bots_dir.path().join("alpha/.git")).expect("alpha repo");
        std::fs::create_dir_all(bots_dir.path().join("beta")).expect("beta dir, no repo");
        std::fs::create_dir_all(bots_dir.path().join("gamma/.git")).expect("gamma repo");

        let pool = db::connect_in_memory().await.expect("pool");
        let store = BotStore::new(pool);
        for (name, git_auto_pull) in [("alpha", true), ("beta", true), ("gamma", false)] {
            let record = BotRecord::new(
                name,
                BotConfig {
                    git_auto_pull,
                    ..BotConfig::default()
                },
            );
            store.upsert(&record).await.expect("seed");
        }

        let config = Arc::new(Config {
            data_dir: bots_dir.path().to_path_buf(),
            bots_dir: bots_dir.path().to_path_buf(),
            settle_delay_secs: 0,
            monitor: crate::config::MonitorConfig::default(),
        });
        let supervisor = Arc::new(Supervisor::new(
            config,
            store,
            Arc::new(NoopGateway),
            Arc::new(NullNotifier),
            Arc::new(AcceptAllValidator),
        ));
        let watcher = GitWatcher::new(supervisor, bots_dir.path().to_path_buf());

        let watched = watcher.watched_bots().await.expect("watched");
        assert_eq!(watched, vec!["alpha".to_string()]);
    }
}
