mod admin;
mod auth;
mod cron;
mod engine;
mod escalation;
mod notify;
mod problem;
mod release;
mod reminder;
mod router;
mod scheduler;
mod telemetry;
#[cfg(test)]
mod test_support;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use chrono::Utc;
use holdwatch_storage::Database;
use holdwatch_util::{load_env_file, AppConfig};
use tracing::{info, warn};

const DISPATCHER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    info!(stage = "storage", "database ready");

    let (notifier, dispatcher) =
        notify::NotificationDispatcher::new(database.clone(), config.notification_queue_capacity);
    let dispatcher_handle = dispatcher.spawn();

    let policy = config.policy;
    let cron_secret: Arc<[u8]> = Arc::from(config.cron_secret.as_bytes());
    let clock: engine::Clock = Arc::new(Utc::now);
    let state =
        router::AppState::new(metrics, database.clone(), cron_secret, policy, notifier, clock);

    let scheduler_handle = config.scheduler_interval.map(|interval| {
        info!(stage = "scheduler", interval_secs = interval.as_secs(), "starting in-process scheduler");
        scheduler::Scheduler::new(state.engines().clone(), policy.reminder_window_days, interval)
            .spawn()
    });

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let served = axum::serve(listener, router::app_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if let Some(handle) = scheduler_handle {
        handle.abort();
    }
    // The router held the last queue senders; the dispatcher drains and exits.
    if tokio::time::timeout(DISPATCHER_DRAIN_TIMEOUT, dispatcher_handle)
        .await
        .is_err()
    {
        warn!(stage = "notify", "notification dispatcher did not drain before shutdown");
    }
    database.close().await;
    info!(stage = "app", "shutdown complete");

    served.map_err(|err| err.into())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(stage = "app", error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!(stage = "app", "shutdown signal received");
}
