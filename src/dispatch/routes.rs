use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::cache::CacheService;
use crate::dispatch::models::{
    MapCodeStatistics, MissionQueueItem, OccupyStatus, Point, QueueStatus, RobotOperationalStatus,
    RobotPosition, SnapshotSource,
};
use crate::dispatch::store::CancelOutcome;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueMissionRequest {
    pub mission_code: String,
    pub primary_map_code: String,
    pub entry_x: f64,
    pub entry_y: f64,
    pub priority: Option<i32>,
    #[serde(default)]
    pub has_next_segment: bool,
}

pub async fn enqueue_mission(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<EnqueueMissionRequest>,
) -> Result<(StatusCode, Json<MissionQueueItem>), (StatusCode, Json<serde_json::Value>)> {
    if payload.mission_code.trim().is_empty() || payload.primary_map_code.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "missionCode and primaryMapCode are required"})),
        ));
    }

    let priority = payload
        .priority
        .unwrap_or(state.config.scheduler.default_priority);
    let item = MissionQueueItem::enqueue(
        payload.mission_code,
        payload.primary_map_code,
        Point::new(payload.entry_x, payload.entry_y),
        priority,
        payload.has_next_segment,
    );

    state.store.insert(&item).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": format!("Failed to enqueue mission: {}", e)})),
        )
    })?;

    tracing::info!(
        queue_item_code = %item.queue_item_code,
        mission_code    = %item.mission_code,
        map_code        = %item.primary_map_code,
        priority        = item.priority,
        "Mission enqueued"
    );
    state.notifier.queue_item_changed(&item);

    Ok((StatusCode::CREATED, Json(item)))
}

pub async fn get_mission(
    State(state): State<Arc<AppState>>,
    Path(queue_item_id): Path<Uuid>,
) -> Result<Json<MissionQueueItem>, (StatusCode, Json<serde_json::Value>)> {
    let item = state.store.get(queue_item_id).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": format!("Database error: {}", e)})),
        )
    })?;

    match item {
        Some(item) => Ok(Json(item)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Queue item not found"})),
        )),
    }
}

pub async fn cancel_mission(
    State(state): State<Arc<AppState>>,
    Path(queue_item_id): Path<Uuid>,
) -> Result<(StatusCode, Json<MissionQueueItem>), (StatusCode, Json<serde_json::Value>)> {
    let outcome = state.store.request_cancel(queue_item_id).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": format!("Database error: {}", e)})),
        )
    })?;

    match outcome {
        CancelOutcome::Cancelled(item) => {
            tracing::info!(queue_item_code = %item.queue_item_code, "Mission cancelled");
            state.notifier.queue_item_changed(&item);
            Ok((StatusCode::OK, Json(item)))
        }
        CancelOutcome::Flagged(item) => {
            tracing::info!(
                queue_item_code = %item.queue_item_code,
                "Cancel requested for assigned mission"
            );
            state.notifier.queue_item_changed(&item);
            Ok((StatusCode::ACCEPTED, Json(item)))
        }
        CancelOutcome::Rejected(status) => Err((
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "error": format!("Cannot cancel a mission in status {}", status)
            })),
        )),
        CancelOutcome::NotFound => Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Queue item not found"})),
        )),
    }
}

#[derive(Debug, Deserialize)]
pub struct MapQueueQuery {
    pub status: Option<String>,
}

pub async fn get_map_queue(
    State(state): State<Arc<AppState>>,
    Path(map_code): Path<String>,
    Query(query): Query<MapQueueQuery>,
) -> Result<Json<Vec<MissionQueueItem>>, (StatusCode, Json<serde_json::Value>)> {
    let items = match query.status.as_deref() {
        Some(raw) => {
            let status = parse_status(raw).ok_or_else(|| {
                (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({"error": format!("Unknown status '{}'", raw)})),
                )
            })?;
            state.store.list_by_status(Some(&map_code), status).await
        }
        None => state.store.list_for_map(&map_code).await,
    }
    .map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": format!("Database error: {}", e)})),
        )
    })?;

    Ok(Json(items))
}

// Accepts the same status tokens the JSON responses carry.
fn parse_status(raw: &str) -> Option<QueueStatus> {
    serde_json::from_value(serde_json::Value::String(raw.to_string())).ok()
}

pub async fn get_map_statistics(
    State(state): State<Arc<AppState>>,
    Path(map_code): Path<String>,
) -> Result<Json<MapCodeStatistics>, (StatusCode, Json<serde_json::Value>)> {
    let stats = state.store.statistics(&map_code).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": format!("Database error: {}", e)})),
        )
    })?;
    Ok(Json(stats))
}

pub async fn get_robot_current_job(
    State(state): State<Arc<AppState>>,
    Path(robot_id): Path<String>,
) -> Result<Json<MissionQueueItem>, (StatusCode, Json<serde_json::Value>)> {
    let job = state
        .store
        .current_job_for_robot(&robot_id)
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": format!("Database error: {}", e)})),
            )
        })?;

    match job {
        Some(item) => Ok(Json(item)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Robot has no current job"})),
        )),
    }
}

pub async fn get_fleet_positions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let positions = state.fleet.all_positions().await;
    if !positions.is_empty() {
        return Json(positions).into_response();
    }

    // Nothing in memory (fresh process); fall back to the cached snapshot.
    if let Some(redis) = &state.redis {
        let mut conn = redis.clone();
        match CacheService::get_fleet_positions(&mut conn).await {
            Ok(mut cached) => {
                for position in &mut cached {
                    position.source = SnapshotSource::Cached;
                }
                return Json(cached).into_response();
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read cached fleet positions");
            }
        }
    }

    Json(Vec::<RobotPosition>::new()).into_response()
}

/// Telemetry payload pushed by the fleet gateway for one robot.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryUpdate {
    pub robot_id: String,
    pub map_code: String,
    pub x: f64,
    pub y: f64,
    pub orientation: Option<f64>,
    pub battery_level: u8,
    pub status: RobotOperationalStatus,
    pub occupy_status: OccupyStatus,
    pub current_mission_code: Option<String>,
}

impl TelemetryUpdate {
    fn into_position(self, now: DateTime<Utc>) -> RobotPosition {
        RobotPosition {
            robot_id: self.robot_id,
            map_code: self.map_code,
            x: self.x,
            y: self.y,
            orientation: self.orientation,
            battery_level: self.battery_level,
            status: self.status,
            occupy_status: self.occupy_status,
            current_mission_code: self.current_mission_code,
            updated_utc: now,
            source: SnapshotSource::RealTime,
        }
    }
}

pub async fn update_fleet_state(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<TelemetryUpdate>,
) -> impl IntoResponse {
    let api_key = headers.get("X-Api-Key").and_then(|v| v.to_str().ok());

    if api_key != Some(&state.config.fleet_api_key) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "status": "error",
                "message": "Invalid API Key"
            })),
        )
            .into_response();
    }

    let position = payload.into_position(Utc::now());
    state.fleet.upsert_position(position.clone()).await;

    if let Some(redis) = &state.redis {
        let mut conn = redis.clone();
        if let Err(e) = CacheService::cache_robot_position(&mut conn, &position).await {
            tracing::warn!(
                robot_id = %position.robot_id,
                error    = %e,
                "Failed to cache robot position"
            );
        }
    }

    Json(serde_json::json!({
        "status": "success"
    }))
    .into_response()
}

pub async fn queue_events_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| stream_queue_events(socket, state))
}

async fn stream_queue_events(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.notifier.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(text) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    // Slow consumer skipped some events; keep streaming.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(_)) => continue,
                    _ => break,
                }
            }
        }
    }
}
