use dotenv::dotenv;
use fleet_dispatch::dispatch::execution::ExecutionClient;
use fleet_dispatch::dispatch::store::PgQueueStore;
use fleet_dispatch::{
    create_pool, create_redis_client, create_router, AppState, Config, Dispatcher, QueueNotifier,
    QueueStore, SharedFleetState,
};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    dotenv().ok();

    // Guard must stay alive or buffered log lines are dropped on exit.
    let _guard = fleet_dispatch::logging::init();

    let config = Config::from_env().expect("DATABASE_URL must be set");

    let pool = create_pool(&config.database_url)
        .await
        .expect("Failed to connect to Postgres");
    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("Failed to run database migrations");

    // Redis only backs the position snapshot cache. The queue itself lives
    // in Postgres, so a missing cache degrades reads instead of dispatch.
    let redis = match &config.redis_url {
        Some(url) => match create_redis_client(url).await {
            Ok(conn) => Some(conn),
            Err(e) => {
                warn!(error = %e, "Redis unavailable - running without the position cache");
                None
            }
        },
        None => None,
    };

    let store: Arc<dyn QueueStore> = Arc::new(PgQueueStore::new(pool));
    let fleet = SharedFleetState::new();
    let notifier = QueueNotifier::new();
    let execution = ExecutionClient::new(config.execution_base_url.clone());

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        fleet.clone(),
        execution,
        notifier.clone(),
        config.scheduler.clone(),
    ));
    tokio::spawn(Arc::clone(&dispatcher).run_processing_loop());
    tokio::spawn(Arc::clone(&dispatcher).run_completion_loop());

    let state = Arc::new(AppState {
        store,
        redis,
        config: config.clone(),
        fleet,
        notifier,
    });
    let app = create_router(state);

    info!("starting server on {}", config.server_address);
    let listener = tokio::net::TcpListener::bind(&config.server_address)
        .await
        .expect("Failed to bind server address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("shutdown signal received");
}
