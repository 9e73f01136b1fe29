use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of one mission-queue item. Terminal states never transition
/// again; a failed submission re-enters `ReadyToAssign`, never `Executing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueueStatus {
    Pending,
    ReadyToAssign,
    Assigned,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl QueueStatus {
    /// Stable text form used for persistence and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::ReadyToAssign => "ready_to_assign",
            QueueStatus::Assigned => "assigned",
            QueueStatus::Executing => "executing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "ready_to_assign" => Some(QueueStatus::ReadyToAssign),
            "assigned" => Some(QueueStatus::Assigned),
            "executing" => Some(QueueStatus::Executing),
            "completed" => Some(QueueStatus::Completed),
            "failed" => Some(QueueStatus::Failed),
            "cancelled" => Some(QueueStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueStatus::Completed | QueueStatus::Failed | QueueStatus::Cancelled
        )
    }

    /// Edges of the queue-item state machine. Every status write in the
    /// store is conditioned on one of these.
    pub fn can_transition_to(&self, next: QueueStatus) -> bool {
        use QueueStatus::*;
        matches!(
            (self, next),
            (Pending, ReadyToAssign)
                | (Pending, Cancelled)
                | (ReadyToAssign, Assigned)
                | (ReadyToAssign, Cancelled)
                | (Assigned, Executing)
                | (Assigned, ReadyToAssign)
                | (Assigned, Failed)
                | (Assigned, Cancelled)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Executing, Cancelled)
        )
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point on a map, in map units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// One attempt to get a mission executed by a robot. A logical mission with
/// several segments shares `mission_code` across items.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissionQueueItem {
    pub queue_item_id: Uuid,
    pub queue_item_code: String,
    pub mission_code: String,
    pub primary_map_code: String,
    pub priority: i32,
    pub is_opportunistic_job: bool,
    pub has_next_segment: bool,
    pub assigned_robot_id: Option<String>,
    pub entry_x: f64,
    pub entry_y: f64,
    pub status: QueueStatus,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub cancel_requested: bool,
    pub enqueued_utc: DateTime<Utc>,
    pub started_utc: Option<DateTime<Utc>>,
    pub completed_utc: Option<DateTime<Utc>>,
    pub cancelled_utc: Option<DateTime<Utc>>,
    pub next_eligible_utc: Option<DateTime<Utc>>,
}

impl MissionQueueItem {
    pub fn enqueue(
        mission_code: String,
        primary_map_code: String,
        entry: Point,
        priority: i32,
        has_next_segment: bool,
    ) -> Self {
        let queue_item_id = Uuid::new_v4();
        Self {
            queue_item_id,
            queue_item_code: queue_item_code_for(queue_item_id),
            mission_code,
            primary_map_code,
            priority,
            is_opportunistic_job: false,
            has_next_segment,
            assigned_robot_id: None,
            entry_x: entry.x,
            entry_y: entry.y,
            status: QueueStatus::Pending,
            error_message: None,
            retry_count: 0,
            cancel_requested: false,
            enqueued_utc: Utc::now(),
            started_utc: None,
            completed_utc: None,
            cancelled_utc: None,
            next_eligible_utc: None,
        }
    }

    /// The follow-on segment enqueued when an item with `has_next_segment`
    /// completes. Shares the mission code and entry point; flagged
    /// opportunistic so the finishing robot is the natural candidate.
    pub fn follow_on_segment(&self) -> Self {
        let mut next = Self::enqueue(
            self.mission_code.clone(),
            self.primary_map_code.clone(),
            self.entry_point(),
            self.priority,
            false,
        );
        next.is_opportunistic_job = true;
        next
    }

    pub fn entry_point(&self) -> Point {
        Point::new(self.entry_x, self.entry_y)
    }

    /// Retry cooldowns are explicit state, not sleeping tasks; an item with
    /// `next_eligible_utc` in the future is skipped by the processing tick.
    pub fn is_eligible_at(&self, now: DateTime<Utc>) -> bool {
        self.next_eligible_utc.map_or(true, |t| t <= now)
    }
}

fn queue_item_code_for(id: Uuid) -> String {
    let hex = id.simple().to_string();
    format!("Q-{}", hex[..8].to_uppercase())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RobotOperationalStatus {
    Idle,
    Working,
    Charging,
    Error,
    Offline,
}

impl RobotOperationalStatus {
    /// Available for a fresh assignment. Working robots are not, but they
    /// may still chain opportunistically right after reporting completion.
    pub fn is_available(&self) -> bool {
        matches!(self, RobotOperationalStatus::Idle)
    }

    /// Out of service for any dispatch, including chaining.
    pub fn is_out_of_service(&self) -> bool {
        matches!(
            self,
            RobotOperationalStatus::Charging
                | RobotOperationalStatus::Error
                | RobotOperationalStatus::Offline
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OccupyStatus {
    Free,
    Occupied,
}

/// Where a position snapshot came from. Freshness hint for diagnostics
/// only; scoring never looks at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SnapshotSource {
    Cached,
    RealTime,
    Auto,
}

/// Last known telemetry for one robot. Supplied by the fleet webhook,
/// read-only to the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotPosition {
    pub robot_id: String,
    pub map_code: String,
    pub x: f64,
    pub y: f64,
    pub orientation: Option<f64>,
    pub battery_level: u8,
    pub status: RobotOperationalStatus,
    pub occupy_status: OccupyStatus,
    pub current_mission_code: Option<String>,
    pub updated_utc: DateTime<Utc>,
    pub source: SnapshotSource,
}

impl RobotPosition {
    pub fn point(&self) -> Point {
        Point::new(self.x, self.y)
    }
}

/// Per-candidate scoring row for one queue item. Ephemeral.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotDistanceScore {
    pub robot_id: String,
    pub distance: f64,
    pub battery_level: u8,
    pub priority: i32,
    pub score: f64,
    pub position: RobotPosition,
}

/// Result of a successful selection, kept for audit and notification.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotAssignment {
    pub robot_id: String,
    pub queue_item_id: Uuid,
    pub distance: f64,
    pub score: f64,
    pub assigned_utc: DateTime<Utc>,
    pub position: RobotPosition,
}

/// Outcome of post-completion evaluation. The payload exists only in the
/// `Chain` case so callers cannot observe a half-filled decision.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "decision", rename_all = "camelCase")]
pub enum OpportunityDecision {
    #[serde(rename_all = "camelCase")]
    Chain {
        selected_job: Box<MissionQueueItem>,
        distance_to_job: f64,
    },
    ReturnToIdle,
    NoOpportunity,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpportunityEvaluation {
    #[serde(flatten)]
    pub decision: OpportunityDecision,
    pub reason: String,
    pub consecutive_job_count: u32,
}

/// Aggregate queue counters for one map code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapCodeStatistics {
    pub map_code: String,
    pub pending_count: i64,
    pub ready_to_assign_count: i64,
    pub assigned_count: i64,
    pub executing_count: i64,
    pub completed_count: i64,
    pub failed_count: i64,
    pub cancelled_count: i64,
}

/// Events fanned out to operator clients over the queue event feed.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum QueueEvent {
    #[serde(rename_all = "camelCase")]
    QueueItemChanged { item: MissionQueueItem },
    #[serde(rename_all = "camelCase")]
    MapStatistics { stats: MapCodeStatistics },
}
