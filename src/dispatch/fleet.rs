use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::dispatch::models::RobotPosition;

/// How many seconds without telemetry before a robot's snapshot is ignored
/// by the scheduler.
pub const POSITION_STALE_TIMEOUT_SECS: i64 = 30;

/// Live fleet telemetry plus the per-robot consecutive-job counters.
/// Cloneable; every clone shares the same tables.
#[derive(Debug, Clone, Default)]
pub struct SharedFleetState {
    positions: Arc<RwLock<HashMap<String, RobotPosition>>>,
    consecutive_jobs: Arc<RwLock<HashMap<String, u32>>>,
}

impl SharedFleetState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert_position(&self, position: RobotPosition) {
        self.positions
            .write()
            .await
            .insert(position.robot_id.clone(), position);
    }

    pub async fn position_of(&self, robot_id: &str) -> Option<RobotPosition> {
        self.positions.read().await.get(robot_id).cloned()
    }

    pub async fn all_positions(&self) -> Vec<RobotPosition> {
        let mut positions: Vec<RobotPosition> =
            self.positions.read().await.values().cloned().collect();
        positions.sort_by(|a, b| a.robot_id.cmp(&b.robot_id));
        positions
    }

    /// Snapshots on one map that are fresh enough to schedule against.
    pub async fn candidates_for_map(
        &self,
        map_code: &str,
        now: DateTime<Utc>,
    ) -> Vec<RobotPosition> {
        let positions = self.positions.read().await;
        let mut candidates: Vec<RobotPosition> = positions
            .values()
            .filter(|p| {
                p.map_code == map_code
                    && (now - p.updated_utc).num_seconds() < POSITION_STALE_TIMEOUT_SECS
            })
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.robot_id.cmp(&b.robot_id));
        candidates
    }

    pub async fn consecutive_jobs(&self, robot_id: &str) -> u32 {
        self.consecutive_jobs
            .read()
            .await
            .get(robot_id)
            .copied()
            .unwrap_or(0)
    }

    pub async fn chain_counts(&self) -> HashMap<String, u32> {
        self.consecutive_jobs.read().await.clone()
    }

    /// Robot chained into another job without returning to idle.
    pub async fn record_chain(&self, robot_id: &str) {
        let mut counts = self.consecutive_jobs.write().await;
        *counts.entry(robot_id.to_string()).or_insert(0) += 1;
    }

    /// Robot went back to idle; its chain is over.
    pub async fn reset_chain(&self, robot_id: &str) {
        self.consecutive_jobs.write().await.remove(robot_id);
    }
}
