//! Botfleet CLI entry point.

use anyhow::Context as _;
use botfleet::config::Config;
use botfleet::credentials::DiscordTokenValidator;
use botfleet::monitor::Monitor;
use botfleet::runtime::{DockerGateway, RuntimeGateway};
use botfleet::scheduler::Scheduler;
use botfleet::store::{BotStore, ScheduleStore};
use botfleet::supervisor::Supervisor;
use botfleet::watcher::GitWatcher;
use botfleet::webhook::WebhookNotifier;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "botfleet")]
#[command(about = "Lifecycle supervisor for a fleet of containerized bots")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build and start a bot from its directory
    Start {
        name: String,
        /// Alternate config file name inside the bot directory
        #[arg(long)]
        config: Option<String>,
        /// Alternate env file name inside the bot directory
        #[arg(long)]
        env: Option<String>,
    },
    /// Stop a bot and remove its container
    Stop { name: String },
    /// Restart a bot
    Restart { name: String },
    /// List all bots and their status
    List,
    /// Stop a bot and delete it from the fleet
    Remove { name: String },
    /// Show resource usage for one bot
    Stats { name: String },
    /// Fleet-wide health summary
    Health,
    /// Manage periodic restart schedules
    #[command(subcommand)]
    Schedule(ScheduleCommand),
    /// Run the monitor, scheduler, and git watcher in the foreground
    Monitor,
}

#[derive(Subcommand)]
enum ScheduleCommand {
    /// Add or replace a bot's restart schedule (e.g. 30m, 2h, 1d)
    Add { name: String, interval: String },
    /// Remove a bot's schedule
    Remove { name: String },
    /// List all schedules
    List,
    /// Fire a bot's schedule immediately
    Run { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Arc::new(Config::load().context("failed to load configuration")?);
    let pool = botfleet::db::connect(&config.sqlite_path())
        .await
        .context("failed to open the bot database")?;

    let gateway: Arc<dyn RuntimeGateway> =
        Arc::new(DockerGateway::connect().context("failed to connect to the container runtime")?);
    let supervisor = Arc::new(Supervisor::new(
        Arc::clone(&config),
        BotStore::new(pool.clone()),
        Arc::clone(&gateway),
        Arc::new(WebhookNotifier::new()),
        Arc::new(DiscordTokenValidator::new()),
    ));
    let scheduler = Scheduler::new(ScheduleStore::new(pool), Arc::clone(&supervisor));

    match cli.command {
        Command::Start { name, config, env } => {
            supervisor
                .start(&name, config.as_deref(), env.as_deref())
                .await?;
            println!("bot {name} started");
        }
        Command::Stop { name } => {
            supervisor.stop(&name).await?;
            println!("bot {name} stopped");
        }
        Command::Restart { name } => {
            supervisor.restart(&name).await?;
            println!("bot {name} restarted");
        }
        Command::List => {
            let bots = supervisor.list().await?;
            if bots.is_empty() {
                println!("no bots registered");
            } else {
                println!("{:<24} {:<12} {:<12}", "NAME", "STATUS", "UPTIME");
                for bot in bots {
                    println!("{:<24} {:<12} {:<12}", bot.name, bot.status, bot.uptime);
                }
            }
        }
        Command::Remove { name } => {
            supervisor.remove(&name).await?;
            println!("bot {name} removed");
        }
        Command::Stats { name } => {
            let metrics = supervisor.metrics(&name).await?;
            println!("bot:     {}", metrics.name);
            println!("status:  {}", metrics.status);
            println!("uptime:  {}", metrics.uptime);
            println!("cpu:     {:.1}%", metrics.cpu_percent);
            println!(
                "memory:  {:.1} MB ({:.1}%)",
                metrics.memory_mb, metrics.memory_percent
            );
        }
        Command::Health => {
            let snapshot = supervisor.health_snapshot().await?;
            println!(
                "{}: {} bots, {} running, {} crashed",
                snapshot.status, snapshot.total, snapshot.running, snapshot.crashed
            );
        }
        Command::Schedule(command) => match command {
            ScheduleCommand::Add { name, interval } => {
                let record = scheduler.add_schedule(&name, &interval).await?;
                println!(
                    "schedule for {name}: every {} ({} minutes)",
                    record.raw_interval, record.interval_minutes
                );
            }
            ScheduleCommand::Remove { name } => {
                if scheduler.remove_schedule(&name).await? {
                    println!("schedule for {name} removed");
                } else {
                    println!("no schedule for {name}");
                }
            }
            ScheduleCommand::List => {
                let schedules = scheduler.list_schedules().await?;
                if schedules.is_empty() {
                    println!("no schedules");
                } else {
                    println!("{:<24} {:<10} {:<10}", "NAME", "INTERVAL", "NEXT RUN");
                    for schedule in schedules {
                        println!(
                            "{:<24} {:<10} {:<10}",
                            schedule.bot_name, schedule.interval, schedule.next_run
                        );
                    }
                }
            }
            ScheduleCommand::Run { name } => {
                scheduler.force_run(&name).await?;
                println!("schedule for {name} fired");
            }
        },
        Command::Monitor => {
            run_monitor(config, supervisor, gateway, scheduler).await?;
        }
    }

    Ok(())
}

/// Foreground mode: sweeps, schedule timers, and the git watcher run until
/// ctrl-c.
async fn run_monitor(
    config: Arc<Config>,
    supervisor: Arc<Supervisor>,
    gateway: Arc<dyn RuntimeGateway>,
    scheduler: Scheduler,
) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();

    let monitor = Arc::new(Monitor::new(
        Arc::clone(&supervisor),
        gateway,
        config.monitor,
    ));
    let mut handles = monitor.spawn(shutdown.clone());

    scheduler.load_all().await?;

    let watcher = GitWatcher::new(Arc::clone(&supervisor), config.bots_dir.clone());
    handles.push(watcher.spawn(shutdown.clone()).await?);

    tracing::info!("botfleet monitor running, press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for the shutdown signal")?;
    tracing::info!("shutdown signal received");

    shutdown.cancel();
    scheduler.shutdown().await;
    for handle in handles {
        let _ = handle.await;
    }

    tracing::info!("botfleet monitor stopped");
    Ok(())
}
