use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::dispatch::models::{MapCodeStatistics, MissionQueueItem, QueueStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// What happened to an external cancel request. `Executing` and terminal
/// items are never cancelled through this path.
#[derive(Debug)]
pub enum CancelOutcome {
    /// Item was `Pending` or `ReadyToAssign`; now `Cancelled`.
    Cancelled(MissionQueueItem),
    /// Item was `Assigned`; flagged for the dispatcher to honor before
    /// submitting.
    Flagged(MissionQueueItem),
    /// Cancellation refused for the given status.
    Rejected(QueueStatus),
    NotFound,
}

/// Durable queue of mission items, the single source of truth for queue
/// state. Every status write is a compare-and-set on the expected previous
/// status; `false` means another tick won the race and the write was
/// discarded.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn insert(&self, item: &MissionQueueItem) -> Result<(), StoreError>;

    async fn get(&self, queue_item_id: Uuid) -> Result<Option<MissionQueueItem>, StoreError>;

    /// Items in one status, ordered by priority descending then enqueue
    /// time ascending (FIFO within a priority band).
    async fn list_by_status(
        &self,
        map_code: Option<&str>,
        status: QueueStatus,
    ) -> Result<Vec<MissionQueueItem>, StoreError>;

    /// Every item queued against one map, in scheduling order.
    async fn list_for_map(&self, map_code: &str) -> Result<Vec<MissionQueueItem>, StoreError>;

    /// Map codes with schedulable work (`Pending` or `ReadyToAssign`),
    /// sorted so ticks walk maps in a stable order.
    async fn map_codes_with_work(&self) -> Result<Vec<String>, StoreError>;

    /// Authoritative in-flight count (`Assigned` + `Executing`) across all
    /// maps, used to enforce the global concurrency limit.
    async fn count_in_flight(&self) -> Result<i64, StoreError>;

    async fn current_job_for_robot(
        &self,
        robot_id: &str,
    ) -> Result<Option<MissionQueueItem>, StoreError>;

    async fn statistics(&self, map_code: &str) -> Result<MapCodeStatistics, StoreError>;

    /// `Pending` -> `ReadyToAssign`.
    async fn mark_ready(&self, queue_item_id: Uuid) -> Result<bool, StoreError>;

    /// `ReadyToAssign` -> `Assigned`; records the robot and stamps
    /// `started_utc` on the first assignment only.
    async fn mark_assigned(&self, queue_item_id: Uuid, robot_id: &str)
        -> Result<bool, StoreError>;

    /// `Assigned` -> `Executing`.
    async fn mark_executing(&self, queue_item_id: Uuid) -> Result<bool, StoreError>;

    /// `Assigned` -> `ReadyToAssign` after a failed submission; releases
    /// the robot and records the retry bookkeeping.
    async fn mark_retry(
        &self,
        queue_item_id: Uuid,
        retry_count: i32,
        next_eligible_utc: DateTime<Utc>,
        error_message: &str,
    ) -> Result<bool, StoreError>;

    /// Terminal `Failed` from the given status; persists the final retry
    /// count alongside the error.
    async fn mark_failed(
        &self,
        queue_item_id: Uuid,
        from: QueueStatus,
        retry_count: i32,
        error_message: &str,
    ) -> Result<bool, StoreError>;

    /// `Executing` -> `Completed`.
    async fn mark_completed(&self, queue_item_id: Uuid) -> Result<bool, StoreError>;

    /// Terminal `Cancelled` from the given status.
    async fn mark_cancelled(
        &self,
        queue_item_id: Uuid,
        from: QueueStatus,
    ) -> Result<bool, StoreError>;

    /// External cancel request; see [`CancelOutcome`].
    async fn request_cancel(&self, queue_item_id: Uuid) -> Result<CancelOutcome, StoreError>;
}

impl<'r> FromRow<'r, PgRow> for MissionQueueItem {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let status = QueueStatus::parse(&status).ok_or_else(|| sqlx::Error::ColumnDecode {
            index: "status".into(),
            source: format!("unknown queue status '{status}'").into(),
        })?;
        Ok(Self {
            queue_item_id: row.try_get("queue_item_id")?,
            queue_item_code: row.try_get("queue_item_code")?,
            mission_code: row.try_get("mission_code")?,
            primary_map_code: row.try_get("primary_map_code")?,
            priority: row.try_get("priority")?,
            is_opportunistic_job: row.try_get("is_opportunistic_job")?,
            has_next_segment: row.try_get("has_next_segment")?,
            assigned_robot_id: row.try_get("assigned_robot_id")?,
            entry_x: row.try_get("entry_x")?,
            entry_y: row.try_get("entry_y")?,
            status,
            error_message: row.try_get("error_message")?,
            retry_count: row.try_get("retry_count")?,
            cancel_requested: row.try_get("cancel_requested")?,
            enqueued_utc: row.try_get("enqueued_utc")?,
            started_utc: row.try_get("started_utc")?,
            completed_utc: row.try_get("completed_utc")?,
            cancelled_utc: row.try_get("cancelled_utc")?,
            next_eligible_utc: row.try_get("next_eligible_utc")?,
        })
    }
}

/// Postgres-backed queue store. Transitions are single-statement updates
/// conditioned on the expected status, so overlapping ticks can never
/// double-assign an item.
#[derive(Clone)]
pub struct PgQueueStore {
    pool: PgPool,
}

impl PgQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn insert(&self, item: &MissionQueueItem) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO mission_queue (
                queue_item_id, queue_item_code, mission_code, primary_map_code,
                priority, is_opportunistic_job, has_next_segment, assigned_robot_id,
                entry_x, entry_y, status, error_message, retry_count,
                cancel_requested, enqueued_utc, started_utc, completed_utc,
                cancelled_utc, next_eligible_utc
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)",
        )
        .bind(item.queue_item_id)
        .bind(&item.queue_item_code)
        .bind(&item.mission_code)
        .bind(&item.primary_map_code)
        .bind(item.priority)
        .bind(item.is_opportunistic_job)
        .bind(item.has_next_segment)
        .bind(&item.assigned_robot_id)
        .bind(item.entry_x)
        .bind(item.entry_y)
        .bind(item.status.as_str())
        .bind(&item.error_message)
        .bind(item.retry_count)
        .bind(item.cancel_requested)
        .bind(item.enqueued_utc)
        .bind(item.started_utc)
        .bind(item.completed_utc)
        .bind(item.cancelled_utc)
        .bind(item.next_eligible_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, queue_item_id: Uuid) -> Result<Option<MissionQueueItem>, StoreError> {
        let item = sqlx::query_as::<_, MissionQueueItem>(
            "SELECT * FROM mission_queue WHERE queue_item_id = $1",
        )
        .bind(queue_item_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(item)
    }

    async fn list_by_status(
        &self,
        map_code: Option<&str>,
        status: QueueStatus,
    ) -> Result<Vec<MissionQueueItem>, StoreError> {
        let items = match map_code {
            Some(map) => {
                sqlx::query_as::<_, MissionQueueItem>(
                    "SELECT * FROM mission_queue
                     WHERE primary_map_code = $1 AND status = $2
                     ORDER BY priority DESC, enqueued_utc ASC",
                )
                .bind(map)
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, MissionQueueItem>(
                    "SELECT * FROM mission_queue
                     WHERE status = $1
                     ORDER BY priority DESC, enqueued_utc ASC",
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(items)
    }

    async fn list_for_map(&self, map_code: &str) -> Result<Vec<MissionQueueItem>, StoreError> {
        let items = sqlx::query_as::<_, MissionQueueItem>(
            "SELECT * FROM mission_queue
             WHERE primary_map_code = $1
             ORDER BY priority DESC, enqueued_utc ASC",
        )
        .bind(map_code)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    async fn map_codes_with_work(&self) -> Result<Vec<String>, StoreError> {
        let codes = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT primary_map_code FROM mission_queue
             WHERE status IN ('pending', 'ready_to_assign')
             ORDER BY primary_map_code",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(codes)
    }

    async fn count_in_flight(&self) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM mission_queue WHERE status IN ('assigned', 'executing')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn current_job_for_robot(
        &self,
        robot_id: &str,
    ) -> Result<Option<MissionQueueItem>, StoreError> {
        let item = sqlx::query_as::<_, MissionQueueItem>(
            "SELECT * FROM mission_queue
             WHERE assigned_robot_id = $1 AND status IN ('assigned', 'executing')
             ORDER BY started_utc DESC
             LIMIT 1",
        )
        .bind(robot_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(item)
    }

    async fn statistics(&self, map_code: &str) -> Result<MapCodeStatistics, StoreError> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) FILTER (WHERE status = 'pending')         AS pending_count,
                COUNT(*) FILTER (WHERE status = 'ready_to_assign') AS ready_to_assign_count,
                COUNT(*) FILTER (WHERE status = 'assigned')        AS assigned_count,
                COUNT(*) FILTER (WHERE status = 'executing')       AS executing_count,
                COUNT(*) FILTER (WHERE status = 'completed')       AS completed_count,
                COUNT(*) FILTER (WHERE status = 'failed')          AS failed_count,
                COUNT(*) FILTER (WHERE status = 'cancelled')       AS cancelled_count
             FROM mission_queue
             WHERE primary_map_code = $1",
        )
        .bind(map_code)
        .fetch_one(&self.pool)
        .await?;

        Ok(MapCodeStatistics {
            map_code: map_code.to_string(),
            pending_count: row.try_get("pending_count")?,
            ready_to_assign_count: row.try_get("ready_to_assign_count")?,
            assigned_count: row.try_get("assigned_count")?,
            executing_count: row.try_get("executing_count")?,
            completed_count: row.try_get("completed_count")?,
            failed_count: row.try_get("failed_count")?,
            cancelled_count: row.try_get("cancelled_count")?,
        })
    }

    async fn mark_ready(&self, queue_item_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE mission_queue SET status = 'ready_to_assign'
             WHERE queue_item_id = $1 AND status = 'pending'",
        )
        .bind(queue_item_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_assigned(
        &self,
        queue_item_id: Uuid,
        robot_id: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE mission_queue
             SET status = 'assigned',
                 assigned_robot_id = $2,
                 started_utc = COALESCE(started_utc, $3)
             WHERE queue_item_id = $1 AND status = 'ready_to_assign'",
        )
        .bind(queue_item_id)
        .bind(robot_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_executing(&self, queue_item_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE mission_queue SET status = 'executing'
             WHERE queue_item_id = $1 AND status = 'assigned'",
        )
        .bind(queue_item_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_retry(
        &self,
        queue_item_id: Uuid,
        retry_count: i32,
        next_eligible_utc: DateTime<Utc>,
        error_message: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE mission_queue
             SET status = 'ready_to_assign',
                 assigned_robot_id = NULL,
                 retry_count = $2,
                 next_eligible_utc = $3,
                 error_message = $4
             WHERE queue_item_id = $1 AND status = 'assigned'",
        )
        .bind(queue_item_id)
        .bind(retry_count)
        .bind(next_eligible_utc)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(
        &self,
        queue_item_id: Uuid,
        from: QueueStatus,
        retry_count: i32,
        error_message: &str,
    ) -> Result<bool, StoreError> {
        if !from.can_transition_to(QueueStatus::Failed) {
            return Ok(false);
        }
        let result = sqlx::query(
            "UPDATE mission_queue
             SET status = 'failed', retry_count = $3, error_message = $4, completed_utc = $5
             WHERE queue_item_id = $1 AND status = $2",
        )
        .bind(queue_item_id)
        .bind(from.as_str())
        .bind(retry_count)
        .bind(error_message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_completed(&self, queue_item_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE mission_queue SET status = 'completed', completed_utc = $2
             WHERE queue_item_id = $1 AND status = 'executing'",
        )
        .bind(queue_item_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_cancelled(
        &self,
        queue_item_id: Uuid,
        from: QueueStatus,
    ) -> Result<bool, StoreError> {
        if !from.can_transition_to(QueueStatus::Cancelled) {
            return Ok(false);
        }
        let result = sqlx::query(
            "UPDATE mission_queue SET status = 'cancelled', cancelled_utc = $3
             WHERE queue_item_id = $1 AND status = $2",
        )
        .bind(queue_item_id)
        .bind(from.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn request_cancel(&self, queue_item_id: Uuid) -> Result<CancelOutcome, StoreError> {
        // Not yet assigned: cancel outright.
        let cancelled = sqlx::query_as::<_, MissionQueueItem>(
            "UPDATE mission_queue
             SET status = 'cancelled', cancel_requested = TRUE, cancelled_utc = $2
             WHERE queue_item_id = $1 AND status IN ('pending', 'ready_to_assign')
             RETURNING *",
        )
        .bind(queue_item_id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        if let Some(item) = cancelled {
            return Ok(CancelOutcome::Cancelled(item));
        }

        // Assigned but not submitted: flag for the dispatcher.
        let flagged = sqlx::query_as::<_, MissionQueueItem>(
            "UPDATE mission_queue SET cancel_requested = TRUE
             WHERE queue_item_id = $1 AND status = 'assigned'
             RETURNING *",
        )
        .bind(queue_item_id)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(item) = flagged {
            return Ok(CancelOutcome::Flagged(item));
        }

        match self.get(queue_item_id).await? {
            Some(item) => Ok(CancelOutcome::Rejected(item.status)),
            None => Ok(CancelOutcome::NotFound),
        }
    }
}

/// In-memory queue store for tests and infrastructure-free development.
/// `insert` replaces any existing row with the same id so tests can rewind
/// timestamps and retry state.
#[derive(Default)]
pub struct MemoryQueueStore {
    items: RwLock<HashMap<Uuid, MissionQueueItem>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn transition<F>(
        &self,
        queue_item_id: Uuid,
        from: QueueStatus,
        to: QueueStatus,
        apply: F,
    ) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut MissionQueueItem),
    {
        let mut items = self.items.write().await;
        match items.get_mut(&queue_item_id) {
            Some(item) if item.status == from && from.can_transition_to(to) => {
                item.status = to;
                apply(item);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn scheduling_order(a: &MissionQueueItem, b: &MissionQueueItem) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.enqueued_utc.cmp(&b.enqueued_utc))
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn insert(&self, item: &MissionQueueItem) -> Result<(), StoreError> {
        self.items
            .write()
            .await
            .insert(item.queue_item_id, item.clone());
        Ok(())
    }

    async fn get(&self, queue_item_id: Uuid) -> Result<Option<MissionQueueItem>, StoreError> {
        Ok(self.items.read().await.get(&queue_item_id).cloned())
    }

    async fn list_by_status(
        &self,
        map_code: Option<&str>,
        status: QueueStatus,
    ) -> Result<Vec<MissionQueueItem>, StoreError> {
        let items = self.items.read().await;
        let mut matching: Vec<MissionQueueItem> = items
            .values()
            .filter(|item| {
                item.status == status
                    && map_code.map_or(true, |map| item.primary_map_code == map)
            })
            .cloned()
            .collect();
        matching.sort_by(scheduling_order);
        Ok(matching)
    }

    async fn list_for_map(&self, map_code: &str) -> Result<Vec<MissionQueueItem>, StoreError> {
        let items = self.items.read().await;
        let mut matching: Vec<MissionQueueItem> = items
            .values()
            .filter(|item| item.primary_map_code == map_code)
            .cloned()
            .collect();
        matching.sort_by(scheduling_order);
        Ok(matching)
    }

    async fn map_codes_with_work(&self) -> Result<Vec<String>, StoreError> {
        let items = self.items.read().await;
        let mut codes: Vec<String> = items
            .values()
            .filter(|item| {
                matches!(
                    item.status,
                    QueueStatus::Pending | QueueStatus::ReadyToAssign
                )
            })
            .map(|item| item.primary_map_code.clone())
            .collect();
        codes.sort();
        codes.dedup();
        Ok(codes)
    }

    async fn count_in_flight(&self) -> Result<i64, StoreError> {
        let items = self.items.read().await;
        let count = items
            .values()
            .filter(|item| {
                matches!(item.status, QueueStatus::Assigned | QueueStatus::Executing)
            })
            .count();
        Ok(count as i64)
    }

    async fn current_job_for_robot(
        &self,
        robot_id: &str,
    ) -> Result<Option<MissionQueueItem>, StoreError> {
        let items = self.items.read().await;
        let job = items
            .values()
            .filter(|item| {
                item.assigned_robot_id.as_deref() == Some(robot_id)
                    && matches!(item.status, QueueStatus::Assigned | QueueStatus::Executing)
            })
            .max_by_key(|item| item.started_utc)
            .cloned();
        Ok(job)
    }

    async fn statistics(&self, map_code: &str) -> Result<MapCodeStatistics, StoreError> {
        let items = self.items.read().await;
        let mut stats = MapCodeStatistics {
            map_code: map_code.to_string(),
            ..Default::default()
        };
        for item in items.values() {
            if item.primary_map_code != map_code {
                continue;
            }
            match item.status {
                QueueStatus::Pending => stats.pending_count += 1,
                QueueStatus::ReadyToAssign => stats.ready_to_assign_count += 1,
                QueueStatus::Assigned => stats.assigned_count += 1,
                QueueStatus::Executing => stats.executing_count += 1,
                QueueStatus::Completed => stats.completed_count += 1,
                QueueStatus::Failed => stats.failed_count += 1,
                QueueStatus::Cancelled => stats.cancelled_count += 1,
            }
        }
        Ok(stats)
    }

    async fn mark_ready(&self, queue_item_id: Uuid) -> Result<bool, StoreError> {
        self.transition(
            queue_item_id,
            QueueStatus::Pending,
            QueueStatus::ReadyToAssign,
            |_| {},
        )
        .await
    }

    async fn mark_assigned(
        &self,
        queue_item_id: Uuid,
        robot_id: &str,
    ) -> Result<bool, StoreError> {
        let robot_id = robot_id.to_string();
        self.transition(
            queue_item_id,
            QueueStatus::ReadyToAssign,
            QueueStatus::Assigned,
            |item| {
                item.assigned_robot_id = Some(robot_id);
                item.started_utc.get_or_insert_with(Utc::now);
            },
        )
        .await
    }

    async fn mark_executing(&self, queue_item_id: Uuid) -> Result<bool, StoreError> {
        self.transition(
            queue_item_id,
            QueueStatus::Assigned,
            QueueStatus::Executing,
            |_| {},
        )
        .await
    }

    async fn mark_retry(
        &self,
        queue_item_id: Uuid,
        retry_count: i32,
        next_eligible_utc: DateTime<Utc>,
        error_message: &str,
    ) -> Result<bool, StoreError> {
        let error_message = error_message.to_string();
        self.transition(
            queue_item_id,
            QueueStatus::Assigned,
            QueueStatus::ReadyToAssign,
            |item| {
                item.assigned_robot_id = None;
                item.retry_count = retry_count;
                item.next_eligible_utc = Some(next_eligible_utc);
                item.error_message = Some(error_message);
            },
        )
        .await
    }

    async fn mark_failed(
        &self,
        queue_item_id: Uuid,
        from: QueueStatus,
        retry_count: i32,
        error_message: &str,
    ) -> Result<bool, StoreError> {
        let error_message = error_message.to_string();
        self.transition(queue_item_id, from, QueueStatus::Failed, |item| {
            item.retry_count = retry_count;
            item.error_message = Some(error_message);
            item.completed_utc = Some(Utc::now());
        })
        .await
    }

    async fn mark_completed(&self, queue_item_id: Uuid) -> Result<bool, StoreError> {
        self.transition(
            queue_item_id,
            QueueStatus::Executing,
            QueueStatus::Completed,
            |item| {
                item.completed_utc = Some(Utc::now());
            },
        )
        .await
    }

    async fn mark_cancelled(
        &self,
        queue_item_id: Uuid,
        from: QueueStatus,
    ) -> Result<bool, StoreError> {
        self.transition(queue_item_id, from, QueueStatus::Cancelled, |item| {
            item.cancelled_utc = Some(Utc::now());
        })
        .await
    }

    async fn request_cancel(&self, queue_item_id: Uuid) -> Result<CancelOutcome, StoreError> {
        let mut items = self.items.write().await;
        let Some(item) = items.get_mut(&queue_item_id) else {
            return Ok(CancelOutcome::NotFound);
        };
        match item.status {
            QueueStatus::Pending | QueueStatus::ReadyToAssign => {
                item.status = QueueStatus::Cancelled;
                item.cancel_requested = true;
                item.cancelled_utc = Some(Utc::now());
                Ok(CancelOutcome::Cancelled(item.clone()))
            }
            QueueStatus::Assigned => {
                item.cancel_requested = true;
                Ok(CancelOutcome::Flagged(item.clone()))
            }
            status => Ok(CancelOutcome::Rejected(status)),
        }
    }
}
