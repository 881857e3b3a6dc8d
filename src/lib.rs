use std::sync::Arc;

pub mod config;
pub mod db;
pub mod error;
pub mod services;

use config::Config;
use services::assignments::AssignmentLinkCoordinator;
use services::events::EventService;
use services::init::Stores;
use services::locks::LockManager;
use services::notifications::NotificationTransport;
use services::planning::PlanningService;
use services::spike_expiry::SpikeExpiryCoordinator;

pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: Config,
    pub stores: Stores,
    pub locks: LockManager,
    pub assignments: AssignmentLinkCoordinator,
    pub spike_expiry: SpikeExpiryCoordinator,
    pub events: EventService,
    pub planning: PlanningService,
    pub transport: Arc<dyn NotificationTransport>,
}
