use crate::dispatch::models::{
    MissionQueueItem, OpportunityDecision, OpportunityEvaluation, RobotPosition,
};

#[derive(Debug, Clone, Copy)]
pub struct OpportunityOptions {
    pub min_battery_level: u8,
    pub max_consecutive_jobs: u32,
    /// A pending item qualifies only if its priority is within this window
    /// of the highest pending priority on the map, so a robot does not grab
    /// low-priority work while something urgent sits unaddressed.
    pub priority_window: i32,
    pub max_chain_distance: f64,
}

/// Decides whether a robot that just finished a mission should chain
/// straight into a nearby queued job instead of returning to idle.
///
/// Pure: no I/O, no state transitions. The dispatcher owns the follow-up.
pub fn evaluate(
    robot: &RobotPosition,
    just_completed: &MissionQueueItem,
    pending_on_map: &[MissionQueueItem],
    consecutive_job_count: u32,
    options: &OpportunityOptions,
) -> OpportunityEvaluation {
    if pending_on_map.is_empty() {
        return OpportunityEvaluation {
            decision: OpportunityDecision::NoOpportunity,
            reason: format!(
                "no pending items on map {}",
                just_completed.primary_map_code
            ),
            consecutive_job_count,
        };
    }

    if robot.battery_level < options.min_battery_level {
        return OpportunityEvaluation {
            decision: OpportunityDecision::NoOpportunity,
            reason: format!(
                "battery {}% below operating threshold {}%",
                robot.battery_level, options.min_battery_level
            ),
            consecutive_job_count,
        };
    }

    if consecutive_job_count >= options.max_consecutive_jobs {
        return OpportunityEvaluation {
            decision: OpportunityDecision::ReturnToIdle,
            reason: format!(
                "consecutive job cap reached ({} of {})",
                consecutive_job_count, options.max_consecutive_jobs
            ),
            consecutive_job_count,
        };
    }

    let priority_floor = pending_on_map
        .iter()
        .map(|item| item.priority)
        .max()
        .unwrap_or(i32::MIN)
        - options.priority_window;

    let nearest = pending_on_map
        .iter()
        .filter(|item| item.priority >= priority_floor)
        .map(|item| (item, robot.point().distance_to(item.entry_point())))
        .filter(|(_, distance)| *distance <= options.max_chain_distance)
        .min_by(|(a, da), (b, db)| {
            da.partial_cmp(db)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.queue_item_id.cmp(&b.queue_item_id))
        });

    match nearest {
        Some((job, distance)) => OpportunityEvaluation {
            decision: OpportunityDecision::Chain {
                selected_job: Box::new(job.clone()),
                distance_to_job: distance,
            },
            reason: format!(
                "chaining into {} at distance {:.1}",
                job.queue_item_code, distance
            ),
            consecutive_job_count,
        },
        None => OpportunityEvaluation {
            decision: OpportunityDecision::ReturnToIdle,
            reason: format!(
                "no qualifying pending item within {:.1} map units",
                options.max_chain_distance
            ),
            consecutive_job_count,
        },
    }
}
