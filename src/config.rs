use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub planning: PlanningConfig,
    pub sweep: SweepConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanningConfig {
    /// When enabled, rewrites of linked content are linked to the same coverage
    /// and unlinking any item of a rewrite chain unlinks the whole chain.
    pub link_updates_to_coverages: bool,
    /// Minutes after which spiked items become eligible for deletion. `0` disables the sweep.
    pub delete_spiked_minutes: i64,
    /// Upper bound on the number of instances materialized for one recurring series.
    pub max_recurrent_events: usize,
    /// Default age (hours) after which a lock is considered stale.
    pub expire_lock_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    /// Items fetched per page by the sweeps.
    pub page_size: i64,
    /// Maximum number of pages a single sweep processes.
    pub max_loops: usize,
    /// TTL of the mutex guarding a sweep, so a crashed runner cannot block it forever.
    pub mutex_ttl_seconds: i64,
    /// How often (seconds) the `serve` workers run the sweeps.
    pub interval_seconds: u64,
}

fn parse_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn parse_num<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(v) => v
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Config::default();

        Ok(Config {
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
                max_connections: parse_num(
                    "DATABASE_MAX_CONNECTIONS",
                    defaults.database.max_connections,
                )?,
            },
            planning: PlanningConfig {
                link_updates_to_coverages: parse_bool(
                    "PLANNING_LINK_UPDATES_TO_COVERAGES",
                    defaults.planning.link_updates_to_coverages,
                ),
                delete_spiked_minutes: parse_num(
                    "PLANNING_DELETE_SPIKED_MINUTES",
                    defaults.planning.delete_spiked_minutes,
                )?,
                max_recurrent_events: parse_num(
                    "PLANNING_MAX_RECURRENT_EVENTS",
                    defaults.planning.max_recurrent_events,
                )?,
                expire_lock_hours: parse_num(
                    "PLANNING_EXPIRE_LOCK_HOURS",
                    defaults.planning.expire_lock_hours,
                )?,
            },
            sweep: SweepConfig {
                page_size: parse_num("SWEEP_PAGE_SIZE", defaults.sweep.page_size)?,
                max_loops: parse_num("SWEEP_MAX_LOOPS", defaults.sweep.max_loops)?,
                mutex_ttl_seconds: parse_num(
                    "SWEEP_MUTEX_TTL_SECONDS",
                    defaults.sweep.mutex_ttl_seconds,
                )?,
                interval_seconds: parse_num(
                    "SWEEP_INTERVAL_SECONDS",
                    defaults.sweep.interval_seconds,
                )?,
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database: DatabaseConfig {
                url: "sqlite://data/planning.db".to_string(),
                max_connections: 5,
            },
            planning: PlanningConfig {
                link_updates_to_coverages: false,
                delete_spiked_minutes: 0,
                max_recurrent_events: 200,
                expire_lock_hours: 24,
            },
            sweep: SweepConfig {
                page_size: 100,
                max_loops: 50,
                mutex_ttl_seconds: 600,
                interval_seconds: 300,
            },
        }
    }
}
