use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::dispatch::models::MissionQueueItem;

/// Transport problems are infrastructure hiccups; endpoint rejections carry
/// the remote verdict. The dispatcher treats both as a consumed mission
/// retry when they happen during submission.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("execution endpoint unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("execution endpoint returned {status}: {body}")]
    Endpoint {
        status: reqwest::StatusCode,
        body: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissionSubmission {
    pub mission_code: String,
    pub robot_id: String,
    pub queue_item_id: Uuid,
    pub queue_item_code: String,
    pub primary_map_code: String,
    pub entry_x: f64,
    pub entry_y: f64,
    pub priority: i32,
}

impl MissionSubmission {
    pub fn for_item(item: &MissionQueueItem, robot_id: &str) -> Self {
        Self {
            mission_code: item.mission_code.clone(),
            robot_id: robot_id.to_string(),
            queue_item_id: item.queue_item_id,
            queue_item_code: item.queue_item_code.clone(),
            primary_map_code: item.primary_map_code.clone(),
            entry_x: item.entry_x,
            entry_y: item.entry_y,
            priority: item.priority,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionAck {
    pub accepted: bool,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusQuery<'a> {
    mission_codes: &'a [String],
}

// Remote job status codes of the execution endpoint.
const REMOTE_WAITING: i32 = 1;
const REMOTE_EXECUTING: i32 = 2;
const REMOTE_COMPLETED: i32 = 3;
const REMOTE_CANCELLED: i32 = 4;
const REMOTE_ERROR: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    Waiting,
    Executing,
    Completed,
    Cancelled,
    Error,
    Unknown(i32),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteJobStatus {
    pub mission_code: String,
    pub robot_id: Option<String>,
    pub status: i32,
    pub complete_time: Option<DateTime<Utc>>,
    pub spend_time: Option<i64>,
}

impl RemoteJobStatus {
    pub fn outcome(&self) -> RemoteOutcome {
        match self.status {
            REMOTE_WAITING => RemoteOutcome::Waiting,
            REMOTE_EXECUTING => RemoteOutcome::Executing,
            REMOTE_COMPLETED => RemoteOutcome::Completed,
            REMOTE_CANCELLED => RemoteOutcome::Cancelled,
            REMOTE_ERROR => RemoteOutcome::Error,
            other => RemoteOutcome::Unknown(other),
        }
    }
}

/// Client for the external AMR execution endpoint: mission submission and
/// the batched job-status poll.
#[derive(Debug, Clone)]
pub struct ExecutionClient {
    http: reqwest::Client,
    base_url: String,
}

impl ExecutionClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    pub async fn submit_mission(
        &self,
        submission: &MissionSubmission,
    ) -> Result<SubmissionAck, ExecutionError> {
        let response = self
            .http
            .post(format!("{}/api/missions/submit", self.base_url))
            .json(submission)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ExecutionError::Endpoint { status, body });
        }

        Ok(response.json::<SubmissionAck>().await?)
    }

    pub async fn query_status(
        &self,
        mission_codes: &[String],
    ) -> Result<Vec<RemoteJobStatus>, ExecutionError> {
        let response = self
            .http
            .post(format!("{}/api/missions/status", self.base_url))
            .json(&StatusQuery { mission_codes })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ExecutionError::Endpoint { status, body });
        }

        Ok(response.json::<Vec<RemoteJobStatus>>().await?)
    }
}
