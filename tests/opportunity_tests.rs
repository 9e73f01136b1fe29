use fleet_dispatch::dispatch::models::{OpportunityDecision, QueueStatus};
use fleet_dispatch::dispatch::opportunity::{evaluate, OpportunityOptions};

mod common;

fn options() -> OpportunityOptions {
    OpportunityOptions {
        min_battery_level: 30,
        max_consecutive_jobs: 3,
        priority_window: 2,
        max_chain_distance: 50.0,
    }
}

fn completed_job(map_code: &str) -> fleet_dispatch::dispatch::models::MissionQueueItem {
    let mut item = common::pending_item("M-DONE", map_code, 5.0, 5.0, 5);
    item.status = QueueStatus::Completed;
    item
}

// ---------------------------------------------------------------------------
// 1. Nothing queued on the map
// ---------------------------------------------------------------------------
#[test]
fn test_empty_queue_is_no_opportunity() {
    let robot = common::robot_at("R1", "MAP-A", 5.0, 5.0, 80);
    let evaluation = evaluate(&robot, &completed_job("MAP-A"), &[], 0, &options());

    assert!(matches!(
        evaluation.decision,
        OpportunityDecision::NoOpportunity
    ));
    assert!(evaluation.reason.contains("no pending items"));
}

// ---------------------------------------------------------------------------
// 2. Battery below threshold blocks chaining even with work queued
// ---------------------------------------------------------------------------
#[test]
fn test_low_battery_is_no_opportunity() {
    let robot = common::robot_at("R1", "MAP-A", 5.0, 5.0, 25);
    let pending = vec![common::pending_item("M-2", "MAP-A", 6.0, 6.0, 5)];
    let evaluation = evaluate(&robot, &completed_job("MAP-A"), &pending, 0, &options());

    assert!(matches!(
        evaluation.decision,
        OpportunityDecision::NoOpportunity
    ));
    assert!(evaluation.reason.contains("battery"));
}

// ---------------------------------------------------------------------------
// 3. Consecutive job cap sends the robot back to idle
// ---------------------------------------------------------------------------
#[test]
fn test_consecutive_cap_returns_to_idle() {
    let robot = common::robot_at("R1", "MAP-A", 5.0, 5.0, 80);
    let pending = vec![common::pending_item("M-2", "MAP-A", 6.0, 6.0, 5)];
    let evaluation = evaluate(&robot, &completed_job("MAP-A"), &pending, 3, &options());

    assert!(matches!(
        evaluation.decision,
        OpportunityDecision::ReturnToIdle
    ));
    assert!(evaluation.reason.contains("consecutive job cap"));
    assert_eq!(evaluation.consecutive_job_count, 3);
}

// ---------------------------------------------------------------------------
// 4. Chains into the nearest qualifying pending job
// ---------------------------------------------------------------------------
#[test]
fn test_chains_into_nearest_qualifying_job() {
    let robot = common::robot_at("R1", "MAP-A", 5.0, 5.0, 80);
    let near = common::pending_item("M-NEAR", "MAP-A", 8.0, 8.0, 5);
    let far = common::pending_item("M-FAR", "MAP-A", 30.0, 30.0, 5);
    let pending = vec![far, near.clone()];

    let evaluation = evaluate(&robot, &completed_job("MAP-A"), &pending, 1, &options());

    match evaluation.decision {
        OpportunityDecision::Chain {
            selected_job,
            distance_to_job,
        } => {
            assert_eq!(selected_job.queue_item_id, near.queue_item_id);
            assert!((distance_to_job - 18.0_f64.sqrt()).abs() < 1e-9);
        }
        other => panic!("Expected Chain, got: {other:?}"),
    }
    assert_eq!(evaluation.consecutive_job_count, 1);
}

// ---------------------------------------------------------------------------
// 5. Priority window: a nearby low-priority job loses to a farther urgent one
// ---------------------------------------------------------------------------
#[test]
fn test_priority_window_excludes_low_priority_jobs() {
    let robot = common::robot_at("R1", "MAP-A", 5.0, 5.0, 80);
    let near_low = common::pending_item("M-LOW", "MAP-A", 6.0, 5.0, 2);
    let far_urgent = common::pending_item("M-URGENT", "MAP-A", 20.0, 5.0, 9);
    let pending = vec![near_low, far_urgent.clone()];

    let evaluation = evaluate(&robot, &completed_job("MAP-A"), &pending, 0, &options());

    match evaluation.decision {
        OpportunityDecision::Chain { selected_job, .. } => {
            assert_eq!(selected_job.queue_item_id, far_urgent.queue_item_id);
        }
        other => panic!("Expected Chain, got: {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// 6. Everything out of range sends the robot back to idle
// ---------------------------------------------------------------------------
#[test]
fn test_all_jobs_beyond_chain_distance_return_to_idle() {
    let robot = common::robot_at("R1", "MAP-A", 5.0, 5.0, 80);
    let pending = vec![common::pending_item("M-2", "MAP-A", 100.0, 100.0, 5)];
    let evaluation = evaluate(&robot, &completed_job("MAP-A"), &pending, 0, &options());

    assert!(matches!(
        evaluation.decision,
        OpportunityDecision::ReturnToIdle
    ));
    assert!(evaluation.reason.contains("map units"));
}

// ---------------------------------------------------------------------------
// 7. Equidistant candidates resolve by queue item id
// ---------------------------------------------------------------------------
#[test]
fn test_equidistant_jobs_tie_break_by_queue_item_id() {
    let robot = common::robot_at("R1", "MAP-A", 5.0, 5.0, 80);
    let left = common::pending_item("M-L", "MAP-A", 2.0, 5.0, 5);
    let right = common::pending_item("M-R", "MAP-A", 8.0, 5.0, 5);
    let expected = if left.queue_item_id < right.queue_item_id {
        left.queue_item_id
    } else {
        right.queue_item_id
    };
    let pending = vec![left, right];

    let evaluation = evaluate(&robot, &completed_job("MAP-A"), &pending, 0, &options());

    match evaluation.decision {
        OpportunityDecision::Chain { selected_job, .. } => {
            assert_eq!(selected_job.queue_item_id, expected);
        }
        other => panic!("Expected Chain, got: {other:?}"),
    }
}
