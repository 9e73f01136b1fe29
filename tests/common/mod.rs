use std::sync::Arc;

use chrono::Utc;
use fleet_dispatch::dispatch::execution::ExecutionClient;
use fleet_dispatch::dispatch::models::{
    MissionQueueItem, OccupyStatus, Point, RobotOperationalStatus, RobotPosition, SnapshotSource,
};
use fleet_dispatch::dispatch::store::MemoryQueueStore;
use fleet_dispatch::{
    create_router, AppState, Config, Dispatcher, QueueNotifier, QueueStore, SchedulerOptions,
    SharedFleetState,
};

#[allow(dead_code)]
pub struct TestApp {
    pub router: axum::Router,
    pub store: Arc<MemoryQueueStore>,
    pub state: Arc<AppState>,
}

/// Config for in-memory tests. The execution endpoint here is a dead
/// address; tests that exercise submission build a dispatcher against a
/// wiremock server instead.
#[allow(dead_code)]
pub fn test_config() -> Config {
    Config {
        database_url: "postgres://unused".to_string(),
        redis_url: None,
        server_address: "127.0.0.1:0".to_string(),
        fleet_api_key: "test-fleet-key".to_string(),
        execution_base_url: "http://127.0.0.1:9".to_string(),
        scheduler: SchedulerOptions::default(),
    }
}

/// App over the in-memory store, no Redis. The store handle is shared so
/// tests can seed and inspect queue items directly.
#[allow(dead_code)]
pub fn spawn_app() -> TestApp {
    let store = Arc::new(MemoryQueueStore::new());
    let state = Arc::new(AppState {
        store: store.clone() as Arc<dyn QueueStore>,
        redis: None,
        config: test_config(),
        fleet: SharedFleetState::new(),
        notifier: QueueNotifier::new(),
    });
    let router = create_router(state.clone());

    TestApp {
        router,
        store,
        state,
    }
}

#[allow(dead_code)]
pub struct TestDispatcher {
    pub dispatcher: Dispatcher,
    pub store: Arc<MemoryQueueStore>,
    pub fleet: SharedFleetState,
    pub notifier: QueueNotifier,
}

/// Dispatcher over the in-memory store, submitting to the given execution
/// endpoint (normally a wiremock server URI).
#[allow(dead_code)]
pub fn spawn_dispatcher(execution_url: &str, options: SchedulerOptions) -> TestDispatcher {
    let store = Arc::new(MemoryQueueStore::new());
    let fleet = SharedFleetState::new();
    let notifier = QueueNotifier::new();
    let dispatcher = Dispatcher::new(
        store.clone() as Arc<dyn QueueStore>,
        fleet.clone(),
        ExecutionClient::new(execution_url),
        notifier.clone(),
        options,
    );

    TestDispatcher {
        dispatcher,
        store,
        fleet,
        notifier,
    }
}

#[allow(dead_code)]
pub fn pending_item(
    mission_code: &str,
    map_code: &str,
    x: f64,
    y: f64,
    priority: i32,
) -> MissionQueueItem {
    MissionQueueItem::enqueue(
        mission_code.to_string(),
        map_code.to_string(),
        Point::new(x, y),
        priority,
        false,
    )
}

/// An idle, free robot with fresh telemetry.
#[allow(dead_code)]
pub fn robot_at(
    robot_id: &str,
    map_code: &str,
    x: f64,
    y: f64,
    battery_level: u8,
) -> RobotPosition {
    RobotPosition {
        robot_id: robot_id.to_string(),
        map_code: map_code.to_string(),
        x,
        y,
        orientation: None,
        battery_level,
        status: RobotOperationalStatus::Idle,
        occupy_status: OccupyStatus::Free,
        current_mission_code: None,
        updated_utc: Utc::now(),
        source: SnapshotSource::RealTime,
    }
}
