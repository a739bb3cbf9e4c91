//! `sokovan-manager` — thin process bootstrap for the scheduler core.
//!
//! Wires a `SchedulerContext` to a Postgres pool, a Redis connection, and a
//! pooled agent RPC client resolver, then runs one `Scheduler::tick()` loop
//! per configured scaling group alongside the `Reconciler`. All scheduling
//! and reconciliation logic lives in the library; this binary only
//! assembles dependencies and owns the process lifetime.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sokovan_core::agent_rpc::PooledAgentClientResolver;
use sokovan_core::clock::SystemClock;
use sokovan_core::events::InMemoryEventBus;
use sokovan_core::lock::PgAdvisoryLock;
use sokovan_core::reconciler::Reconciler;
use sokovan_core::registry::{PostgresRegistry, RedisConcurrencyCounter};
use sokovan_core::scheduler::{log_tick_report, Scheduler, SchedulerContext};
use sokovan_core::types::ScalingGroupName;
use sokovan_core::Config;

/// Overrides for the handful of settings worth surfacing on the command
/// line; everything else comes from `Config::default()`.
#[derive(Parser, Debug)]
#[command(name = "sokovan-manager")]
struct CliArgs {
    #[arg(long, env = "SOKOVAN_DATABASE_URL")]
    database_url: Option<String>,

    #[arg(long, env = "SOKOVAN_REDIS_URL")]
    redis_url: Option<String>,

    #[arg(long, env = "SOKOVAN_SCALING_GROUPS", value_delimiter = ',')]
    scaling_groups: Option<Vec<String>>,
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    sokovan_core::observability::init_tracing();

    let args = CliArgs::parse();
    let mut config = Config::default();
    if let Some(url) = args.database_url {
        config.database.url = url;
    }
    if let Some(url) = args.redis_url {
        config.redis.url = url;
    }
    if let Some(groups) = args.scaling_groups {
        config.scheduler.scaling_groups = groups;
    }

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(config.database.connect_timeout)
        .connect(&config.database.url)
        .await?;

    let registry = Arc::new(PostgresRegistry::new(pool.clone()));
    let concurrency_counter = Arc::new(RedisConcurrencyCounter::new(
        &config.redis.url,
        config.redis.namespace.clone(),
    )?);
    let agent_clients = Arc::new(PooledAgentClientResolver::new(
        registry.clone(),
        config.agent_rpc.call_timeout,
    ));
    let event_bus = Arc::new(InMemoryEventBus::new(1024));
    let lock = Arc::new(PgAdvisoryLock::new(pool));
    let clock = Arc::new(SystemClock);

    let scaling_groups: Vec<ScalingGroupName> = config
        .scheduler
        .scaling_groups
        .iter()
        .cloned()
        .map(ScalingGroupName::from_string)
        .collect::<std::result::Result<_, _>>()
        .map_err(|e: &str| e.to_string())?;

    let ctx = SchedulerContext {
        registry: registry.clone(),
        concurrency_counter: concurrency_counter.clone(),
        agent_clients,
        event_bus,
        lock,
        clock: clock.clone(),
        concurrency_limit: config.scheduler.concurrency_limit,
        num_retries_to_skip: config.scheduler.num_retries_to_skip,
        scheduler_strategy: config.scheduler.strategy.clone(),
        agent_selection_strategy: config.scheduler.agent_selection_strategy.clone(),
        zombie_grace_period: chrono::Duration::from_std(config.reconciler.zombie_grace_period)
            .unwrap_or_else(|_| chrono::Duration::seconds(60)),
    };

    tracing::info!(scaling_groups = ?scaling_groups, "sokovan-manager starting");

    let scheduler = Arc::new(Scheduler::new(ctx));
    let tick_interval = config.scheduler.tick_interval;
    for scaling_group in scaling_groups.clone() {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            loop {
                ticker.tick().await;
                match scheduler.tick(&scaling_group).await {
                    Ok(Some(report)) => log_tick_report(&scaling_group, &report),
                    Ok(None) => {}
                    Err(err) => tracing::error!(%scaling_group, error = %err, "scheduler tick failed"),
                }
            }
        });
    }

    let reconciler = Arc::new(Reconciler::new(
        registry,
        concurrency_counter,
        clock,
        scaling_groups,
        config.reconciler.sweep_interval,
        chrono::Duration::from_std(config.reconciler.terminal_retention)
            .unwrap_or_else(|_| chrono::Duration::hours(1)),
    ));
    let reconciler_handle = reconciler.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    reconciler.shutdown();
    let _ = reconciler_handle.await;

    Ok(())
}
