pub mod cache;
pub mod config;
pub mod database;
pub mod dispatch;
pub mod logging;

pub use config::Config;
pub use database::{create_pool, create_redis_client};
pub use dispatch::fleet::SharedFleetState;
pub use dispatch::notifier::QueueNotifier;
pub use dispatch::store::QueueStore;
pub use dispatch::{Dispatcher, SchedulerOptions};
use axum::{
    routing::{get, post},
    Router,
};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn QueueStore>,
    pub redis: Option<ConnectionManager>,
    pub config: Config,
    pub fleet: SharedFleetState,
    pub notifier: QueueNotifier,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    // mission queue routes (called by order systems and operator consoles)
    let mission_routes = Router::new()
        .route("/missions", post(dispatch::routes::enqueue_mission))
        .route(
            "/missions/{queue_item_id}",
            get(dispatch::routes::get_mission),
        )
        .route(
            "/missions/{queue_item_id}/cancel",
            post(dispatch::routes::cancel_mission),
        )
        .route("/maps/{map_code}/queue", get(dispatch::routes::get_map_queue))
        .route(
            "/maps/{map_code}/statistics",
            get(dispatch::routes::get_map_statistics),
        )
        .route(
            "/robots/{robot_id}/current-job",
            get(dispatch::routes::get_robot_current_job),
        );

    // fleet routes (telemetry pushed by robots, snapshots read by dashboards)
    let fleet_routes = Router::new()
        .route("/fleet/positions", get(dispatch::routes::get_fleet_positions))
        .route("/fleet/state", post(dispatch::routes::update_fleet_state))
        .route("/ws/queue/events", get(dispatch::routes::queue_events_ws));

    Router::new()
        .route("/", get(root))
        .merge(mission_routes)
        .merge(fleet_routes)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn root() -> &'static str {
    "AMR Fleet Dispatch API - v0.1.0"
}
