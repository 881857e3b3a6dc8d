use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use planning_core::config::Config;
use planning_core::error::AppError;
use planning_core::services::init;
use planning_core::services::locks::purge_targets;
use planning_core::services::notifications::{run_dispatcher, ChannelNotificationSink, LogTransport};

#[derive(Parser, Debug)]
#[command(name = "planning-core", version, about = "Newsroom planning maintenance commands")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Delete spiked events and planning items that expired.
    #[command(name = "planning:delete_spiked")]
    DeleteSpiked,
    /// Delete assignments marked for deletion.
    #[command(name = "planning:delete_assignments")]
    DeleteAssignments,
    /// Clear locks older than the given age.
    #[command(name = "planning:purge_expired_locks")]
    PurgeExpiredLocks {
        /// events, planning, assignments or all
        #[arg(long, default_value = "all")]
        resource: String,
        #[arg(long)]
        expire_hours: Option<i64>,
    },
    /// Run the periodic sweeps and the notification dispatcher until interrupted.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "planning_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let pool = init::init_db(&config).await?;
    let (sink, rx) = ChannelNotificationSink::new();
    let state = Arc::new(init::build_state(
        pool,
        config,
        Arc::new(sink),
        Arc::new(LogTransport),
    ));

    let (shutdown_tx, _shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    let dispatcher = tokio::spawn(run_dispatcher(
        rx,
        state.transport.clone(),
        shutdown_tx.subscribe(),
    ));

    let result = match cli.command {
        Command::DeleteSpiked => delete_spiked(&state).await,
        Command::DeleteAssignments => delete_assignments(&state).await,
        Command::PurgeExpiredLocks {
            resource,
            expire_hours,
        } => purge_expired_locks(&state, &resource, expire_hours).await,
        Command::Serve => {
            serve(state.clone(), shutdown_tx.clone()).await;
            Ok(())
        }
    };

    // Dropping the last state handle closes the notification channel.
    drop(state);
    if tokio::time::timeout(Duration::from_secs(5), dispatcher).await.is_err() {
        tracing::warn!("Notification dispatcher did not drain in time");
    }

    if let Err(e) = result {
        tracing::error!("Command failed: {}", e);
        let body = serde_json::to_string(&e.to_body())?;
        eprintln!("{}", body);
        std::process::exit(1);
    }
    Ok(())
}

async fn delete_spiked(state: &init::SharedState) -> Result<(), AppError> {
    match state.spike_expiry.run().await? {
        Some(report) => tracing::info!("Spiked item expiry: {:?}", report),
        None => tracing::info!("Spiked item expiry did not run"),
    }
    Ok(())
}

async fn delete_assignments(state: &init::SharedState) -> Result<(), AppError> {
    match state.assignments.delete_marked().await? {
        Some(deleted) => tracing::info!("Deleted {} assignment(s) marked for deletion", deleted),
        None => tracing::info!("Marked assignment deletion did not run"),
    }
    Ok(())
}

async fn purge_expired_locks(
    state: &init::SharedState,
    resource: &str,
    expire_hours: Option<i64>,
) -> Result<(), AppError> {
    let resources = purge_targets(resource)?;
    let hours = expire_hours.unwrap_or(state.config.planning.expire_lock_hours);
    if hours < 0 {
        return Err(AppError::Validation(format!(
            "--expire-hours must not be negative, got {}",
            hours
        )));
    }

    match state
        .locks
        .purge_expired(&resources, chrono::Duration::hours(hours))
        .await?
    {
        Some(report) => tracing::info!("Purged expired locks older than {}h: {:?}", hours, report),
        None => tracing::info!("Expired lock purge did not run"),
    }
    Ok(())
}

async fn serve(state: init::SharedState, shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    tracing::info!("Starting planning workers");
    let bg_handles = init::spawn_background_workers(state, shutdown_tx.clone());

    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = term.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!("Failed to bind SIGTERM: {}", e);
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }

    tracing::info!("Shutdown signal received, notifying background workers");
    let _ = shutdown_tx.send(());

    let shutdown_wait = Duration::from_secs(15);
    tracing::info!(
        "Waiting up to {}s for background workers to exit",
        shutdown_wait.as_secs()
    );
    let bg_wait = async {
        for h in bg_handles {
            let _ = h.await;
        }
    };
    let _ = tokio::time::timeout(shutdown_wait, bg_wait).await;

    tracing::info!("Shutdown complete");
}
