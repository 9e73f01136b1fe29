pub mod execution;
pub mod fleet;
pub mod models;
pub mod notifier;
pub mod opportunity;
pub mod retry;
pub mod routes;
pub mod selector;
pub mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use execution::{ExecutionClient, MissionSubmission, RemoteJobStatus, RemoteOutcome};
use fleet::SharedFleetState;
use models::{MissionQueueItem, OpportunityDecision, QueueStatus, RobotPosition};
use notifier::QueueNotifier;
use opportunity::OpportunityOptions;
use retry::{RetryDecision, RetryPolicy};
use selector::ScoreWeights;
use store::{QueueStore, StoreError};

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Cap on items `Assigned` or `Executing` across all maps.
    pub global_concurrency_limit: usize,
    pub processing_interval_seconds: u64,
    pub completion_check_interval_seconds: u64,
    /// Caps both promotions and new assignments per map per tick.
    pub max_jobs_per_map_code_per_cycle: usize,
    pub max_retry_attempts: i32,
    pub retry_delay_seconds: i64,
    pub enable_opportunistic_jobs: bool,
    pub default_priority: i32,
    pub min_battery_level: u8,
    pub max_consecutive_jobs: u32,
    pub opportunity_priority_window: i32,
    pub max_chain_distance: f64,
    /// Items waiting longer than this with no eligible robot are logged at
    /// warn instead of debug.
    pub starved_item_warn_seconds: i64,
    pub score_weights: ScoreWeights,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            global_concurrency_limit: 30,
            processing_interval_seconds: 5,
            completion_check_interval_seconds: 2,
            max_jobs_per_map_code_per_cycle: 5,
            max_retry_attempts: 3,
            retry_delay_seconds: 10,
            enable_opportunistic_jobs: true,
            default_priority: 5,
            min_battery_level: 30,
            max_consecutive_jobs: 3,
            opportunity_priority_window: 2,
            max_chain_distance: 50.0,
            starved_item_warn_seconds: 60,
            score_weights: ScoreWeights::default(),
        }
    }
}

impl SchedulerOptions {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retry_attempts: self.max_retry_attempts,
            retry_delay_seconds: self.retry_delay_seconds,
        }
    }

    fn opportunity_options(&self) -> OpportunityOptions {
        OpportunityOptions {
            min_battery_level: self.min_battery_level,
            max_consecutive_jobs: self.max_consecutive_jobs,
            priority_window: self.opportunity_priority_window,
            max_chain_distance: self.max_chain_distance,
        }
    }
}

/// What one processing tick did, for logs and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub promoted: usize,
    pub assigned: usize,
    pub submitted: usize,
    pub deferred: usize,
    pub failed: usize,
}

impl TickSummary {
    pub fn is_empty(&self) -> bool {
        self.promoted == 0
            && self.assigned == 0
            && self.submitted == 0
            && self.deferred == 0
            && self.failed == 0
    }
}

enum SubmitOutcome {
    Started,
    Retrying,
    Failed,
}

/// The scheduler. Owns the two periodic activities: the processing tick
/// (promote, select, assign, submit) and the completion-check tick (poll
/// remote status, finish items, chain opportunistically). All queue writes
/// go through the store's compare-and-set transitions; a lost race is
/// dropped, never retried in place.
pub struct Dispatcher {
    store: Arc<dyn QueueStore>,
    fleet: SharedFleetState,
    execution: ExecutionClient,
    notifier: QueueNotifier,
    options: SchedulerOptions,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn QueueStore>,
        fleet: SharedFleetState,
        execution: ExecutionClient,
        notifier: QueueNotifier,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            store,
            fleet,
            execution,
            notifier,
            options,
        }
    }

    pub async fn run_processing_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.options.processing_interval_seconds.max(1),
        ));
        loop {
            ticker.tick().await;
            match self.run_processing_tick().await {
                Ok(summary) if !summary.is_empty() => {
                    tracing::debug!(
                        promoted = summary.promoted,
                        assigned = summary.assigned,
                        submitted = summary.submitted,
                        deferred = summary.deferred,
                        failed = summary.failed,
                        "Processing tick finished"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Processing tick failed"),
            }
        }
    }

    pub async fn run_completion_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.options.completion_check_interval_seconds.max(1),
        ));
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_completion_tick().await {
                tracing::error!(error = %e, "Completion check failed");
            }
        }
    }

    /// One pass over every map with schedulable work, in sorted map order.
    pub async fn run_processing_tick(&self) -> Result<TickSummary, StoreError> {
        let mut summary = TickSummary::default();
        for map_code in self.store.map_codes_with_work().await? {
            self.process_map(&map_code, &mut summary).await?;
        }
        Ok(summary)
    }

    async fn process_map(
        &self,
        map_code: &str,
        summary: &mut TickSummary,
    ) -> Result<(), StoreError> {
        let mut changed = false;

        // Promote the head of the pending queue, priority first, FIFO
        // within a band.
        let pending = self
            .store
            .list_by_status(Some(map_code), QueueStatus::Pending)
            .await?;
        for item in pending
            .iter()
            .take(self.options.max_jobs_per_map_code_per_cycle)
        {
            if self.store.mark_ready(item.queue_item_id).await? {
                summary.promoted += 1;
                changed = true;
                self.notify_item(item.queue_item_id).await?;
            }
        }

        let ready = self
            .store
            .list_by_status(Some(map_code), QueueStatus::ReadyToAssign)
            .await?;
        if ready.is_empty() {
            if changed {
                self.publish_statistics(map_code).await?;
            }
            return Ok(());
        }

        let now = Utc::now();
        let mut candidates = self.fleet.candidates_for_map(map_code, now).await;
        let chain_counts = self.fleet.chain_counts().await;
        let mut assigned_this_cycle = 0usize;

        for item in ready {
            if item.cancel_requested {
                if self
                    .store
                    .mark_cancelled(item.queue_item_id, QueueStatus::ReadyToAssign)
                    .await?
                {
                    tracing::info!(
                        queue_item_code = %item.queue_item_code,
                        "Cancelled queue item before assignment"
                    );
                    changed = true;
                    self.notify_item(item.queue_item_id).await?;
                }
                continue;
            }

            // Retry cooldown.
            if !item.is_eligible_at(now) {
                continue;
            }

            if assigned_this_cycle >= self.options.max_jobs_per_map_code_per_cycle {
                summary.deferred += 1;
                continue;
            }

            let Some(assignment) = selector::select_robot(
                &candidates,
                &item,
                &chain_counts,
                &self.options.score_weights,
                self.options.min_battery_level,
            ) else {
                self.log_starved_item(&item, now);
                continue;
            };

            let in_flight = self.store.count_in_flight().await?;
            if in_flight >= self.options.global_concurrency_limit as i64 {
                summary.deferred += 1;
                tracing::debug!(
                    queue_item_code = %item.queue_item_code,
                    in_flight,
                    "Global concurrency limit reached - deferring"
                );
                continue;
            }

            if !self
                .store
                .mark_assigned(item.queue_item_id, &assignment.robot_id)
                .await?
            {
                // Another tick moved the item; drop the lost race.
                continue;
            }
            summary.assigned += 1;
            assigned_this_cycle += 1;
            changed = true;
            candidates.retain(|c| c.robot_id != assignment.robot_id);

            tracing::info!(
                queue_item_code = %item.queue_item_code,
                robot_id        = %assignment.robot_id,
                distance        = assignment.distance,
                score           = assignment.score,
                "Assigned queue item to robot"
            );

            // A cancel may have been flagged while we were selecting.
            let Some(current) = self.store.get(item.queue_item_id).await? else {
                continue;
            };
            if current.cancel_requested {
                if self
                    .store
                    .mark_cancelled(current.queue_item_id, QueueStatus::Assigned)
                    .await?
                {
                    tracing::info!(
                        queue_item_code = %current.queue_item_code,
                        "Cancelled queue item before submission"
                    );
                    self.notify_item(current.queue_item_id).await?;
                }
                continue;
            }
            self.notifier.queue_item_changed(&current);

            match self.submit_assigned(&current, &assignment.robot_id).await? {
                SubmitOutcome::Started => summary.submitted += 1,
                SubmitOutcome::Retrying => {}
                SubmitOutcome::Failed => summary.failed += 1,
            }
        }

        if changed {
            self.publish_statistics(map_code).await?;
        }
        Ok(())
    }

    async fn submit_assigned(
        &self,
        item: &MissionQueueItem,
        robot_id: &str,
    ) -> Result<SubmitOutcome, StoreError> {
        let submission = MissionSubmission::for_item(item, robot_id);
        match self.execution.submit_mission(&submission).await {
            Ok(ack) if ack.accepted => {
                if self.store.mark_executing(item.queue_item_id).await? {
                    tracing::info!(
                        queue_item_code = %item.queue_item_code,
                        mission_code    = %item.mission_code,
                        robot_id        = %robot_id,
                        "Mission submitted to execution channel"
                    );
                    self.notify_item(item.queue_item_id).await?;
                }
                Ok(SubmitOutcome::Started)
            }
            Ok(ack) => {
                let error = ack
                    .error
                    .unwrap_or_else(|| "mission rejected by execution endpoint".to_string());
                self.handle_submission_failure(item, &error).await
            }
            Err(e) => self.handle_submission_failure(item, &e.to_string()).await,
        }
    }

    async fn handle_submission_failure(
        &self,
        item: &MissionQueueItem,
        error: &str,
    ) -> Result<SubmitOutcome, StoreError> {
        let mut attempt = item.clone();
        attempt.retry_count += 1;

        match self.options.retry_policy().decide(&attempt) {
            RetryDecision::Retry { delay } => {
                let next_eligible = Utc::now() + delay;
                if self
                    .store
                    .mark_retry(item.queue_item_id, attempt.retry_count, next_eligible, error)
                    .await?
                {
                    tracing::warn!(
                        queue_item_code = %item.queue_item_code,
                        retry_count     = attempt.retry_count,
                        error           = %error,
                        "Submission failed - will retry"
                    );
                    self.notify_item(item.queue_item_id).await?;
                }
                Ok(SubmitOutcome::Retrying)
            }
            RetryDecision::GiveUp => {
                if self
                    .store
                    .mark_failed(
                        item.queue_item_id,
                        QueueStatus::Assigned,
                        attempt.retry_count,
                        error,
                    )
                    .await?
                {
                    tracing::error!(
                        queue_item_code = %item.queue_item_code,
                        retry_count     = attempt.retry_count,
                        error           = %error,
                        "Submission failed - retries exhausted"
                    );
                    self.notify_item(item.queue_item_id).await?;
                }
                Ok(SubmitOutcome::Failed)
            }
        }
    }

    /// Polls remote job status for everything `Executing` and finishes the
    /// items whose remote state went terminal. Already-terminal items no
    /// longer match the query, so re-running this is a no-op.
    pub async fn run_completion_tick(&self) -> Result<(), StoreError> {
        let executing = self
            .store
            .list_by_status(None, QueueStatus::Executing)
            .await?;
        if executing.is_empty() {
            return Ok(());
        }

        let mut mission_codes: Vec<String> = executing
            .iter()
            .map(|item| item.mission_code.clone())
            .collect();
        mission_codes.sort();
        mission_codes.dedup();

        let statuses = match self.execution.query_status(&mission_codes).await {
            Ok(statuses) => statuses,
            Err(e) => {
                // Infrastructure hiccup, not a mission failure; poll again
                // next tick without consuming a retry.
                tracing::warn!(error = %e, "Job status poll failed");
                return Ok(());
            }
        };
        let by_code: HashMap<&str, &RemoteJobStatus> = statuses
            .iter()
            .map(|status| (status.mission_code.as_str(), status))
            .collect();

        for item in executing {
            let Some(remote) = by_code.get(item.mission_code.as_str()) else {
                continue;
            };
            match remote.outcome() {
                RemoteOutcome::Completed => {
                    if self.store.mark_completed(item.queue_item_id).await? {
                        tracing::info!(
                            queue_item_code = %item.queue_item_code,
                            mission_code    = %item.mission_code,
                            robot_id        = ?item.assigned_robot_id,
                            spend_time      = ?remote.spend_time,
                            "Mission completed"
                        );
                        self.notify_item(item.queue_item_id).await?;
                        self.publish_statistics(&item.primary_map_code).await?;
                        self.handle_completion(&item).await?;
                    }
                }
                RemoteOutcome::Cancelled => {
                    if self
                        .store
                        .mark_cancelled(item.queue_item_id, QueueStatus::Executing)
                        .await?
                    {
                        tracing::info!(
                            queue_item_code = %item.queue_item_code,
                            mission_code    = %item.mission_code,
                            "Mission cancelled by execution channel"
                        );
                        self.notify_item(item.queue_item_id).await?;
                        self.publish_statistics(&item.primary_map_code).await?;
                        if let Some(robot_id) = item.assigned_robot_id.as_deref() {
                            self.fleet.reset_chain(robot_id).await;
                        }
                    }
                }
                RemoteOutcome::Error => {
                    if self
                        .store
                        .mark_failed(
                            item.queue_item_id,
                            QueueStatus::Executing,
                            item.retry_count,
                            "execution channel reported a mission error",
                        )
                        .await?
                    {
                        tracing::error!(
                            queue_item_code = %item.queue_item_code,
                            mission_code    = %item.mission_code,
                            "Mission failed on the execution channel"
                        );
                        self.notify_item(item.queue_item_id).await?;
                        self.publish_statistics(&item.primary_map_code).await?;
                        if let Some(robot_id) = item.assigned_robot_id.as_deref() {
                            self.fleet.reset_chain(robot_id).await;
                        }
                    }
                }
                RemoteOutcome::Waiting | RemoteOutcome::Executing => {}
                RemoteOutcome::Unknown(code) => {
                    tracing::warn!(
                        mission_code  = %item.mission_code,
                        remote_status = code,
                        "Unknown remote job status - treating as still running"
                    );
                }
            }
        }
        Ok(())
    }

    /// Follow-up after an item completed: enqueue the next segment when one
    /// is flagged, then decide whether the robot chains or goes idle.
    async fn handle_completion(&self, item: &MissionQueueItem) -> Result<(), StoreError> {
        if item.has_next_segment {
            let next = item.follow_on_segment();
            self.store.insert(&next).await?;
            tracing::info!(
                mission_code    = %next.mission_code,
                queue_item_code = %next.queue_item_code,
                "Enqueued follow-on segment"
            );
            self.notifier.queue_item_changed(&next);
        }

        let Some(robot_id) = item.assigned_robot_id.clone() else {
            return Ok(());
        };

        if !self.options.enable_opportunistic_jobs {
            self.fleet.reset_chain(&robot_id).await;
            return Ok(());
        }

        let Some(robot) = self.fleet.position_of(&robot_id).await else {
            self.fleet.reset_chain(&robot_id).await;
            return Ok(());
        };
        if robot.status.is_out_of_service() {
            self.fleet.reset_chain(&robot_id).await;
            return Ok(());
        }

        let now = Utc::now();
        let mut pending = self
            .store
            .list_by_status(Some(&item.primary_map_code), QueueStatus::Pending)
            .await?;
        pending.extend(
            self.store
                .list_by_status(Some(&item.primary_map_code), QueueStatus::ReadyToAssign)
                .await?,
        );
        pending.retain(|p| {
            p.assigned_robot_id.is_none() && !p.cancel_requested && p.is_eligible_at(now)
        });

        let consecutive = self.fleet.consecutive_jobs(&robot_id).await;
        let evaluation = opportunity::evaluate(
            &robot,
            item,
            &pending,
            consecutive,
            &self.options.opportunity_options(),
        );

        match evaluation.decision {
            OpportunityDecision::Chain {
                selected_job,
                distance_to_job,
            } => {
                tracing::info!(
                    robot_id        = %robot_id,
                    queue_item_code = %selected_job.queue_item_code,
                    distance        = distance_to_job,
                    reason          = %evaluation.reason,
                    "Chaining robot into queued job"
                );
                if self.chain_robot_into(&robot, *selected_job).await? {
                    self.fleet.record_chain(&robot_id).await;
                } else {
                    self.fleet.reset_chain(&robot_id).await;
                }
            }
            OpportunityDecision::ReturnToIdle | OpportunityDecision::NoOpportunity => {
                tracing::debug!(
                    robot_id = %robot_id,
                    reason   = %evaluation.reason,
                    "Robot returns to idle"
                );
                self.fleet.reset_chain(&robot_id).await;
            }
        }
        Ok(())
    }

    /// Assigns and submits a chained job to the robot that just finished.
    /// Returns true only if the mission actually started.
    async fn chain_robot_into(
        &self,
        robot: &RobotPosition,
        job: MissionQueueItem,
    ) -> Result<bool, StoreError> {
        let in_flight = self.store.count_in_flight().await?;
        if in_flight >= self.options.global_concurrency_limit as i64 {
            tracing::debug!(
                queue_item_code = %job.queue_item_code,
                in_flight,
                "Global concurrency limit reached - not chaining"
            );
            return Ok(false);
        }

        if job.status == QueueStatus::Pending && !self.store.mark_ready(job.queue_item_id).await? {
            return Ok(false);
        }
        if !self
            .store
            .mark_assigned(job.queue_item_id, &robot.robot_id)
            .await?
        {
            return Ok(false);
        }
        self.notify_item(job.queue_item_id).await?;

        let Some(current) = self.store.get(job.queue_item_id).await? else {
            return Ok(false);
        };
        if current.cancel_requested {
            if self
                .store
                .mark_cancelled(current.queue_item_id, QueueStatus::Assigned)
                .await?
            {
                self.notify_item(current.queue_item_id).await?;
            }
            return Ok(false);
        }

        let outcome = self.submit_assigned(&current, &robot.robot_id).await?;
        self.publish_statistics(&current.primary_map_code).await?;
        Ok(matches!(outcome, SubmitOutcome::Started))
    }

    fn log_starved_item(&self, item: &MissionQueueItem, now: DateTime<Utc>) {
        let waiting_seconds = (now - item.enqueued_utc).num_seconds();
        if waiting_seconds > self.options.starved_item_warn_seconds {
            tracing::warn!(
                queue_item_code = %item.queue_item_code,
                map_code        = %item.primary_map_code,
                waiting_seconds,
                "No eligible robot for queue item"
            );
        } else {
            tracing::debug!(
                queue_item_code = %item.queue_item_code,
                map_code        = %item.primary_map_code,
                "No eligible robot for queue item"
            );
        }
    }

    async fn notify_item(&self, queue_item_id: Uuid) -> Result<(), StoreError> {
        if let Some(item) = self.store.get(queue_item_id).await? {
            self.notifier.queue_item_changed(&item);
        }
        Ok(())
    }

    async fn publish_statistics(&self, map_code: &str) -> Result<(), StoreError> {
        let stats = self.store.statistics(map_code).await?;
        self.notifier.map_statistics(&stats);
        Ok(())
    }
}
