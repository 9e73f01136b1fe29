use std::collections::HashMap;

use chrono::Utc;

use crate::dispatch::models::{
    MissionQueueItem, OccupyStatus, RobotAssignment, RobotDistanceScore, RobotPosition,
};

/// Tunable weights of the assignment score. The score must stay
/// monotonically decreasing in distance and increasing in battery and
/// priority, so keep every weight non-negative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub distance: f64,
    pub battery: f64,
    pub priority: f64,
    pub chain_penalty: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            distance: 0.5,
            battery: 0.3,
            priority: 0.2,
            chain_penalty: 0.05,
        }
    }
}

/// Distance and score of one robot for one item, without any eligibility
/// filtering. Also used to audit chained assignments where the robot is
/// already chosen.
pub fn score_position(
    robot: &RobotPosition,
    item: &MissionQueueItem,
    consecutive_jobs: u32,
    weights: &ScoreWeights,
) -> (f64, f64) {
    let distance = robot.point().distance_to(item.entry_point());
    let score = weights.distance * (1.0 / (1.0 + distance))
        + weights.battery * (f64::from(robot.battery_level) / 100.0)
        + weights.priority * (f64::from(item.priority) / 10.0)
        - weights.chain_penalty * f64::from(consecutive_jobs);
    (distance, score)
}

/// Scores every eligible candidate for one item, best first. Ties on score
/// fall back to robot id ascending so the result is reproducible for the
/// same snapshot.
pub fn score_candidates(
    candidates: &[RobotPosition],
    item: &MissionQueueItem,
    consecutive_jobs: &HashMap<String, u32>,
    weights: &ScoreWeights,
    min_battery_level: u8,
) -> Vec<RobotDistanceScore> {
    let mut scored: Vec<RobotDistanceScore> = candidates
        .iter()
        .filter(|robot| {
            robot.map_code == item.primary_map_code
                && robot.occupy_status == OccupyStatus::Free
                && robot.status.is_available()
                && robot.battery_level >= min_battery_level
        })
        .map(|robot| {
            let chained = consecutive_jobs.get(&robot.robot_id).copied().unwrap_or(0);
            let (distance, score) = score_position(robot, item, chained, weights);
            RobotDistanceScore {
                robot_id: robot.robot_id.clone(),
                distance,
                battery_level: robot.battery_level,
                priority: item.priority,
                score,
                position: robot.clone(),
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.robot_id.cmp(&b.robot_id))
    });
    scored
}

/// Picks the robot for one queue item, or `None` when no candidate passes
/// the filters. `None` is not an error; the item simply stays
/// `ReadyToAssign` for the next tick.
pub fn select_robot(
    candidates: &[RobotPosition],
    item: &MissionQueueItem,
    consecutive_jobs: &HashMap<String, u32>,
    weights: &ScoreWeights,
    min_battery_level: u8,
) -> Option<RobotAssignment> {
    let scored = score_candidates(candidates, item, consecutive_jobs, weights, min_battery_level);
    scored.into_iter().next().map(|best| RobotAssignment {
        robot_id: best.robot_id,
        queue_item_id: item.queue_item_id,
        distance: best.distance,
        score: best.score,
        assigned_utc: Utc::now(),
        position: best.position,
    })
}
