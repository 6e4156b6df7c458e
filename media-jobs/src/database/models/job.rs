//! Job database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::{datetime_to_ms, ms_to_datetime};
use crate::domain::{CreateJobOptions, Job, JobMetadata, JobStatus, JobType, ProgressDetail};
use crate::{Error, Result};

/// One row of the `job` table. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: String,
    pub job_type: String,
    pub target_id: Option<String>,
    pub status: String,
    pub priority: i64,
    /// JSON-encoded [`JobMetadata`].
    pub metadata: String,
    pub progress: i64,
    /// JSON object, shallow-merged on progress updates.
    pub progress_detail: String,
    pub retry_count: i64,
    pub max_retries: i64,
    pub scheduled_at: i64,
    pub run_at: i64,
    pub retry_after: Option<i64>,
    pub locked_by: Option<String>,
    pub locked_at: Option<i64>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl JobDbModel {
    pub fn new(
        metadata: &JobMetadata,
        options: &CreateJobOptions,
        default_max_retries: u32,
        now: i64,
    ) -> Result<Self> {
        let scheduled_at = options.scheduled_at.map(datetime_to_ms).unwrap_or(now);
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_type: metadata.job_type().as_str().to_string(),
            target_id: options.target_id.clone(),
            status: JobStatus::Pending.as_str().to_string(),
            priority: i64::from(options.priority),
            metadata: serde_json::to_string(metadata)?,
            progress: 0,
            progress_detail: "{}".to_string(),
            retry_count: 0,
            max_retries: i64::from(options.max_retries.unwrap_or(default_max_retries)),
            scheduled_at,
            run_at: options.run_at.map(datetime_to_ms).unwrap_or(scheduled_at),
            retry_after: None,
            locked_by: None,
            locked_at: None,
            started_at: None,
            completed_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        })
    }
}

fn count(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

impl TryFrom<JobDbModel> for Job {
    type Error = Error;

    fn try_from(row: JobDbModel) -> Result<Self> {
        let job_type = JobType::parse(&row.job_type).ok_or_else(|| {
            Error::validation(format!("job {} has unknown type {}", row.id, row.job_type))
        })?;
        let status = JobStatus::parse(&row.status).ok_or_else(|| {
            Error::validation(format!("job {} has unknown status {}", row.id, row.status))
        })?;
        let metadata: JobMetadata = serde_json::from_str(&row.metadata)?;
        if metadata.job_type() != job_type {
            return Err(Error::validation(format!(
                "job {} metadata is {} but row type is {}",
                row.id,
                metadata.job_type(),
                job_type
            )));
        }
        let progress_detail: ProgressDetail = serde_json::from_str(&row.progress_detail)?;

        Ok(Job {
            id: row.id,
            job_type,
            target_id: row.target_id,
            status,
            priority: i32::try_from(row.priority).unwrap_or_default(),
            metadata,
            progress: u8::try_from(row.progress.clamp(0, 100)).unwrap_or(0),
            progress_detail,
            retry_count: count(row.retry_count),
            max_retries: count(row.max_retries),
            scheduled_at: ms_to_datetime(row.scheduled_at),
            run_at: ms_to_datetime(row.run_at),
            retry_after: row.retry_after.map(ms_to_datetime),
            locked_by: row.locked_by,
            locked_at: row.locked_at.map(ms_to_datetime),
            started_at: row.started_at.map(ms_to_datetime),
            completed_at: row.completed_at.map(ms_to_datetime),
            error: row.error,
            created_at: ms_to_datetime(row.created_at),
            updated_at: ms_to_datetime(row.updated_at),
        })
    }
}
