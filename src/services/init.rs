//! Initialization helpers for the application:
//! - database connection + migrations
//! - store and service wiring
//! - background worker spawn helpers

use std::{path::Path, sync::Arc};

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db::repository::*;
use crate::db::store::*;
use crate::services::assignments::AssignmentLinkCoordinator;
use crate::services::coverage_sync::PlanningCoverageSync;
use crate::services::events::EventService;
use crate::services::locks::LockManager;
use crate::services::notifications::{NotificationSink, NotificationTransport};
use crate::services::planning::PlanningService;
use crate::services::spike_expiry::SpikeExpiryCoordinator;
use crate::AppState;

/// Redact potentially sensitive information from a database URL before logging.
///
/// Attempts to parse the URL and remove userinfo (username:password) components.
/// Falls back to removing everything before '@' or returning "(redacted)".
pub fn redact_db_url(db_url: &str) -> String {
    if let Ok(url) = url::Url::parse(db_url) {
        let scheme = url.scheme();
        let host = url.host_str().unwrap_or("");
        let port_part = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
        let path = url.path();
        format!("{}://{}{}{}", scheme, host, port_part, path)
    } else {
        if let Some(at_pos) = db_url.find('@') {
            let without_creds = &db_url[at_pos + 1..];
            return format!("(redacted){}", without_creds);
        }
        "(redacted)".to_string()
    }
}

/// Initialize SQLite database connection and run migrations.
///
/// Creates the parent directory for the database file (if applicable),
/// opens a connection pool using `create_if_missing(true)` and runs migrations.
pub async fn init_db(config: &Config) -> Result<SqlitePool> {
    let db_url = &config.database.url;
    tracing::info!("Connecting to database: {}", redact_db_url(db_url));

    let db_path = db_url.strip_prefix("sqlite://").unwrap_or(db_url);
    let db_file_path = Path::new(db_path);

    if let Some(parent) = db_file_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                )
            })?;
        }
    }

    let connect_options = sqlx::sqlite::SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true);

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect_with(connect_options)
        .await?;

    tracing::info!("Running database migrations");
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Migrated in-memory database on a single long-lived connection.
pub async fn init_memory_db() -> Result<SqlitePool> {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

/// Handles to every collection, as the services consume them.
#[derive(Clone)]
pub struct Stores {
    pub events: Arc<dyn EventStore>,
    pub planning: Arc<dyn PlanningStore>,
    pub assignments: Arc<dyn AssignmentStore>,
    pub deliveries: Arc<dyn DeliveryStore>,
    pub content: Arc<dyn ContentStore>,
    pub contacts: Arc<dyn ContactStore>,
    pub autosaves: Arc<dyn AutosaveStore>,
    pub history: Arc<dyn HistoryStore>,
    pub locks: Arc<dyn LockStore>,
    pub mutex: Arc<dyn MutexLease>,
}

pub fn build_stores(pool: &SqlitePool) -> Stores {
    Stores {
        events: Arc::new(EventRepository::new(pool.clone())),
        planning: Arc::new(PlanningRepository::new(pool.clone())),
        assignments: Arc::new(AssignmentRepository::new(pool.clone())),
        deliveries: Arc::new(DeliveryRepository::new(pool.clone())),
        content: Arc::new(ContentRepository::new(pool.clone())),
        contacts: Arc::new(ContactRepository::new(pool.clone())),
        autosaves: Arc::new(AutosaveRepository::new(pool.clone())),
        history: Arc::new(HistoryRepository::new(pool.clone())),
        locks: Arc::new(LockRepository::new(pool.clone())),
        mutex: Arc::new(SqliteMutexLease::new(pool.clone())),
    }
}

pub type SharedState = Arc<AppState>;

/// Wire stores and services into the shared application state.
pub fn build_state(
    pool: SqlitePool,
    config: Config,
    notifier: Arc<dyn NotificationSink>,
    transport: Arc<dyn NotificationTransport>,
) -> AppState {
    let stores = build_stores(&pool);

    let locks = LockManager::new(&stores, &config.sweep);
    let coverage_sync = PlanningCoverageSync::new(stores.assignments.clone());
    let assignments = AssignmentLinkCoordinator::new(
        &stores,
        locks.clone(),
        notifier.clone(),
        &config.planning,
        &config.sweep,
    );
    let spike_expiry = SpikeExpiryCoordinator::new(
        &stores,
        assignments.clone(),
        notifier.clone(),
        &config.planning,
        &config.sweep,
    );
    let events = EventService::new(
        &stores,
        locks.clone(),
        assignments.clone(),
        notifier.clone(),
        &config.planning,
    );
    let planning = PlanningService::new(&stores, locks.clone(), coverage_sync, assignments.clone());

    AppState {
        db: pool,
        config,
        stores,
        locks,
        assignments,
        spike_expiry,
        events,
        planning,
        transport,
    }
}

/// Spawn background workers:
/// - periodic spiked-item expiry
/// - periodic stale lock purge for all lockable collections
///
/// Each worker listens for a shutdown notification via a
/// `tokio::sync::broadcast::Sender<()>`; the returned handles let callers await
/// their exit.
pub fn spawn_background_workers(
    state: SharedState,
    shutdown: tokio::sync::broadcast::Sender<()>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();
    let interval = std::time::Duration::from_secs(state.config.sweep.interval_seconds);

    // Spike expiry worker
    {
        let mut shutdown_rx = shutdown.subscribe();
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            loop {
                match state.spike_expiry.run().await {
                    Ok(Some(report)) => tracing::info!("Spike expiry sweep finished: {:?}", report),
                    Ok(None) => tracing::debug!("Spike expiry sweep skipped"),
                    Err(e) => tracing::warn!("Spike expiry sweep failed: {:?}", e),
                }

                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Spike expiry worker shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }));
    }

    // Lock purge worker
    {
        let mut shutdown_rx = shutdown.subscribe();
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            let older_than = chrono::Duration::hours(state.config.planning.expire_lock_hours);
            loop {
                match state
                    .locks
                    .purge_expired(&crate::db::models::LockResource::ALL, older_than)
                    .await
                {
                    Ok(Some(report)) => tracing::info!("Stale lock purge finished: {:?}", report),
                    Ok(None) => tracing::debug!("Stale lock purge skipped"),
                    Err(e) => tracing::warn!("Stale lock purge failed: {:?}", e),
                }

                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Lock purge worker shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }));
    }

    handles
}
