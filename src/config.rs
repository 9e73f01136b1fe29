use std::env;

use crate::dispatch::selector::ScoreWeights;
use crate::dispatch::SchedulerOptions;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub server_address: String,
    pub fleet_api_key: String,
    pub execution_base_url: String,
    pub scheduler: SchedulerOptions,
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        let defaults = SchedulerOptions::default();
        let weight_defaults = ScoreWeights::default();
        Ok(Config {
            database_url: env::var("DATABASE_URL")?,
            redis_url: env::var("REDIS_URL").ok(),
            server_address: env::var("SERVER_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:3003".to_string()),
            fleet_api_key: env::var("FLEET_API_KEY")
                .unwrap_or_else(|_| "secret-fleet-key".to_string()),
            execution_base_url: env::var("EXECUTION_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8800".to_string()),
            scheduler: SchedulerOptions {
                global_concurrency_limit: parse_or(
                    "GLOBAL_CONCURRENCY_LIMIT",
                    defaults.global_concurrency_limit,
                ),
                processing_interval_seconds: parse_or(
                    "PROCESSING_INTERVAL_SECONDS",
                    defaults.processing_interval_seconds,
                ),
                completion_check_interval_seconds: parse_or(
                    "COMPLETION_CHECK_INTERVAL_SECONDS",
                    defaults.completion_check_interval_seconds,
                ),
                max_jobs_per_map_code_per_cycle: parse_or(
                    "MAX_JOBS_PER_MAP_CODE_PER_CYCLE",
                    defaults.max_jobs_per_map_code_per_cycle,
                ),
                max_retry_attempts: parse_or("MAX_RETRY_ATTEMPTS", defaults.max_retry_attempts),
                retry_delay_seconds: parse_or("RETRY_DELAY_SECONDS", defaults.retry_delay_seconds),
                enable_opportunistic_jobs: parse_or(
                    "ENABLE_OPPORTUNISTIC_JOBS",
                    defaults.enable_opportunistic_jobs,
                ),
                default_priority: parse_or("DEFAULT_PRIORITY", defaults.default_priority),
                min_battery_level: parse_or("MIN_BATTERY_LEVEL", defaults.min_battery_level),
                max_consecutive_jobs: parse_or(
                    "MAX_CONSECUTIVE_JOBS",
                    defaults.max_consecutive_jobs,
                ),
                opportunity_priority_window: parse_or(
                    "OPPORTUNITY_PRIORITY_WINDOW",
                    defaults.opportunity_priority_window,
                ),
                max_chain_distance: parse_or("MAX_CHAIN_DISTANCE", defaults.max_chain_distance),
                starved_item_warn_seconds: parse_or(
                    "STARVED_ITEM_WARN_SECONDS",
                    defaults.starved_item_warn_seconds,
                ),
                score_weights: ScoreWeights {
                    distance: parse_or("SCORE_WEIGHT_DISTANCE", weight_defaults.distance),
                    battery: parse_or("SCORE_WEIGHT_BATTERY", weight_defaults.battery),
                    priority: parse_or("SCORE_WEIGHT_PRIORITY", weight_defaults.priority),
                    chain_penalty: parse_or("SCORE_CHAIN_PENALTY", weight_defaults.chain_penalty),
                },
            },
        })
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
