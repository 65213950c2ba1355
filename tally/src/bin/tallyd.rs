use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use tally::persistence::PgStore;
use tally::runtime::{
    spawn_claim_purge, spawn_heartbeat, spawn_seeker_purge, spawn_worker_purge,
    DrainSignal, WorkerLoop,
};
use tally::{
    EndDateRetry, LoggingPublisher, PersistenceConfig, UsageConfig,
    WorkerRegistry,
};

#[derive(Debug, Parser)]
#[command(name = "tallyd", version, about = "CPU-hour usage accounting worker")]
struct Cli {
    /// Database connection string. Falls back to DATABASE_URL.
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Port recorded for the external HTTP layer that fronts this service.
    #[arg(long, default_value_t = 60000)]
    listen_port: u16,

    /// Broker queue name for the inbound job-updates consumer.
    #[arg(long, default_value = "tally")]
    queue: String,

    /// One of trace, debug, info, warn, or error.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Seconds a worker registration lasts without a heartbeat.
    #[arg(long, default_value_t = 3600)]
    worker_lifetime: i64,

    /// Seconds a work claim lasts.
    #[arg(long, default_value_t = 120)]
    claim_lifetime: i64,

    /// Seconds a worker may spend looking for work.
    #[arg(long, default_value_t = 120)]
    seeking_lifetime: i64,

    /// Seconds between worker registration refreshes.
    #[arg(long, default_value_t = 300)]
    refresh_interval: u64,

    /// Seconds between expired-worker purges.
    #[arg(long, default_value_t = 360)]
    purge_workers_interval: u64,

    /// Seconds between expired-seeker purges.
    #[arg(long, default_value_t = 300)]
    purge_seekers_interval: u64,

    /// Seconds between expired-claim purges.
    #[arg(long, default_value_t = 360)]
    purge_claims_interval: u64,

    /// Days a new user's total row stays effective.
    #[arg(long, default_value_t = 365)]
    new_user_total_interval: i64,

    /// Subject prefix for outbound usage updates.
    #[arg(long, default_value = "qms")]
    usage_subject_prefix: String,

    /// Maximum connections in the database pool.
    #[arg(long, default_value_t = 10)]
    max_db_connections: u32,
}

impl Cli {
    fn usage_config(&self) -> UsageConfig {
        UsageConfig {
            worker_lifetime_secs: self.worker_lifetime,
            claim_lifetime_secs: self.claim_lifetime,
            seeking_lifetime_secs: self.seeking_lifetime,
            refresh_interval_secs: self.refresh_interval,
            purge_workers_interval_secs: self.purge_workers_interval,
            purge_seekers_interval_secs: self.purge_seekers_interval,
            purge_claims_interval_secs: self.purge_claims_interval,
            new_user_total_days: self.new_user_total_interval,
            usage_subject_prefix: self.usage_subject_prefix.clone(),
            end_date_retry: EndDateRetry::default(),
            ..UsageConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    let config = cli.usage_config();
    config.validate()?;

    info!(queue = %cli.queue, listen_port = cli.listen_port, "starting tallyd");

    let persistence = PersistenceConfig {
        max_connections: cli.max_db_connections,
        ..PersistenceConfig::new(cli.database_url.clone())
    };
    let store = Arc::new(PgStore::connect(&persistence).await?);
    info!("connected to the database");
    let publisher = Arc::new(LoggingPublisher);
    let drain = DrainSignal::new();

    let worker_name = uuid::Uuid::now_v7().simple().to_string();
    let worker_id = store
        .register(
            &worker_name,
            chrono::Utc::now() + config.worker_lifetime(),
        )
        .await?;
    info!(worker = %worker_id, name = %worker_name, "registered worker");

    let tasks = vec![
        spawn_heartbeat(
            Arc::clone(&store),
            worker_id,
            std::time::Duration::from_secs(config.refresh_interval_secs),
            config.worker_lifetime(),
            drain.clone(),
        ),
        spawn_worker_purge(
            Arc::clone(&store),
            std::time::Duration::from_secs(config.purge_workers_interval_secs),
            drain.clone(),
        ),
        spawn_seeker_purge(
            Arc::clone(&store),
            std::time::Duration::from_secs(config.purge_seekers_interval_secs),
            drain.clone(),
        ),
        spawn_claim_purge(
            Arc::clone(&store),
            std::time::Duration::from_secs(config.purge_claims_interval_secs),
            drain.clone(),
        ),
    ];

    let worker_loop = WorkerLoop::new(
        Arc::clone(&store),
        publisher,
        config,
        worker_id,
        worker_name,
        drain.clone(),
    );

    let loop_handle = tokio::spawn(async move { worker_loop.run().await });

    signal::ctrl_c().await?;
    info!("shutdown requested, draining");
    drain.drain();

    let _ = loop_handle.await;
    for task in tasks {
        let _ = task.await;
    }

    if let Err(err) = store.deactivate(worker_id).await {
        tracing::warn!(worker = %worker_id, %err, "could not deactivate worker");
    }

    info!("tallyd stopped");
    Ok(())
}
