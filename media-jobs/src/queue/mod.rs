//! The job queue service.
//!
//! Wraps a [`JobRepository`] with an injected [`Clock`] and exposes the
//! queue operations the worker, the pipelines and the admin CLI use. The
//! repository is the only writer of job status.

pub mod progress;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::database::models::JobDbModel;
use crate::database::repositories::JobRepository;
use crate::database::time::Clock;
use crate::domain::{
    Checkpoint, ClassifiedFailure, CreateJobOptions, FailOutcome, Job, JobMetadata, JobStatus,
    Phase,
};
use crate::{Error, Result};

pub use progress::{
    ProgressReporter, ProgressUpdate, TransferMeter, TransferSnapshot, scale_percent,
};

/// Counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl QueueStats {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed + self.cancelled
    }
}

/// Result of startup crash recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    /// This worker's own PROCESSING jobs reset to PENDING.
    pub released: u64,
    /// Jobs with an expired lock (any worker) failed and unlocked.
    pub stale_failed: u64,
    /// Stale jobs that had no attempts left. Their artifacts are orphaned.
    pub terminal: Vec<String>,
}

pub struct JobQueue {
    repo: Arc<dyn JobRepository>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    notify: Arc<Notify>,
    progress_tx: mpsc::Sender<ProgressUpdate>,
}

impl JobQueue {
    /// Build the queue and start its progress aggregator (when called inside
    /// a Tokio runtime).
    pub fn new(repo: Arc<dyn JobRepository>, clock: Arc<dyn Clock>, config: QueueConfig) -> Self {
        let (progress_tx, progress_rx) = mpsc::channel(progress::PROGRESS_CHANNEL_CAPACITY);
        progress::spawn_progress_aggregator(repo.clone(), clock.clone(), progress_rx);
        Self {
            repo,
            clock,
            config,
            notify: Arc::new(Notify::new()),
            progress_tx,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub async fn create_job(&self, metadata: JobMetadata, options: CreateJobOptions) -> Result<Job> {
        if let Some(url) = metadata.source_url()
            && url::Url::parse(url).is_err()
        {
            return Err(Error::validation(format!("invalid source url: {url}")));
        }
        if let JobMetadata::AiDubbing(m) = &metadata
            && (m.movie_id.trim().is_empty() || m.target_language.trim().is_empty())
        {
            return Err(Error::validation(
                "dubbing jobs need a movieId and a targetLanguage",
            ));
        }

        let row = JobDbModel::new(
            &metadata,
            &options,
            self.config.default_max_retries,
            self.clock.now_ms(),
        )?;
        self.repo.create_job(&row).await?;
        info!(job_id = %row.id, job_type = %row.job_type, priority = row.priority, "job created");
        self.notify.notify_one();
        Job::try_from(row)
    }

    pub async fn get_job(&self, id: &str) -> Result<Job> {
        Job::try_from(self.repo.get_job(id).await?)
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
        let rows = self
            .repo
            .list_jobs(status.as_ref().map(JobStatus::as_str), limit)
            .await?;
        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id.clone();
            match Job::try_from(row) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(job_id = %id, error = %e, "skipping undecodable job row"),
            }
        }
        Ok(jobs)
    }

    /// Claim the best eligible job for `worker_id`, or `None`.
    ///
    /// A row that claims successfully but cannot be decoded is failed
    /// terminally so it does not get picked up again.
    pub async fn get_next_job(&self, worker_id: &str) -> Result<Option<Job>> {
        let now = self.clock.now_ms();
        let Some(row) = self
            .repo
            .claim_next_job(worker_id, now, self.config.lock_timeout)
            .await?
        else {
            return Ok(None);
        };
        let id = row.id.clone();
        match Job::try_from(row) {
            Ok(job) => {
                debug!(job_id = %job.id, worker_id, "job claimed");
                Ok(Some(job))
            }
            Err(e) => {
                warn!(job_id = %id, error = %e, "claimed job has an invalid payload");
                self.repo
                    .fail_job(
                        &id,
                        worker_id,
                        &format!("invalid job payload: {e}"),
                        false,
                        None,
                        now,
                    )
                    .await?;
                Err(e)
            }
        }
    }

    /// Resolve when a job was created by this process, or after `timeout`.
    pub async fn wait_for_job(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }

    pub fn progress_reporter(&self, job_id: &str) -> ProgressReporter {
        ProgressReporter::new(job_id, self.progress_tx.clone())
    }

    /// Set progress and shallow-merge (or replace) the detail map.
    pub async fn update_progress(
        &self,
        id: &str,
        percent: u8,
        detail: Option<Map<String, Value>>,
        merge: bool,
    ) -> Result<bool> {
        self.repo
            .update_progress(
                id,
                i64::from(percent),
                detail.as_ref(),
                merge,
                self.clock.now_ms(),
            )
            .await
    }

    /// Persist a checkpoint after a phase boundary. Awaited, never buffered.
    pub async fn update_checkpoint<P: Phase>(
        &self,
        id: &str,
        checkpoint: &Checkpoint<P>,
        percent: u8,
    ) -> Result<()> {
        let value = checkpoint
            .to_value()
            .map_err(|e| Error::Other(format!("checkpoint encode: {e}")))?;
        let mut detail = Map::new();
        detail.insert("checkpoint".into(), value);
        if let Some(phase) = checkpoint.last_phase() {
            detail.insert("phase".into(), json!(phase.to_string()));
        }
        self.update_progress(id, percent, Some(detail), true).await?;
        Ok(())
    }

    /// Drop the checkpoint from `progress_detail`, keeping other keys.
    pub async fn clear_checkpoint(&self, id: &str) -> Result<()> {
        let job = self.get_job(id).await?;
        let mut detail = Map::new();
        detail.insert("checkpoint".into(), Value::Null);
        self.update_progress(id, job.progress, Some(detail), true)
            .await?;
        Ok(())
    }

    /// Mark the job done. Ignored unless `worker_id` still holds its lock.
    pub async fn complete_job(&self, id: &str, worker_id: &str) -> Result<bool> {
        let done = self
            .repo
            .complete_job(id, worker_id, self.clock.now_ms())
            .await?;
        if done {
            info!(job_id = id, "job completed");
        } else {
            warn!(
                job_id = id,
                worker_id, "complete_job ignored, job is no longer held by this worker"
            );
        }
        Ok(done)
    }

    /// Record a failure. `custom_backoff` replaces the default schedule.
    /// Ignored unless `worker_id` still holds the job's lock.
    pub async fn fail_job(
        &self,
        id: &str,
        worker_id: &str,
        message: &str,
        should_retry: bool,
        custom_backoff: Option<Duration>,
    ) -> Result<Option<FailOutcome>> {
        let outcome = self
            .repo
            .fail_job(
                id,
                worker_id,
                message,
                should_retry,
                custom_backoff,
                self.clock.now_ms(),
            )
            .await?;
        match outcome {
            Some(FailOutcome::Retrying { retry_count, delay }) => {
                info!(job_id = id, retry_count, delay_secs = delay.as_secs(), error = message, "job failed, retry scheduled");
            }
            Some(FailOutcome::Terminal { retry_count }) => {
                warn!(job_id = id, retry_count, error = message, "job failed terminally");
            }
            None => debug!(
                job_id = id,
                worker_id, "fail_job ignored, job is no longer held by this worker"
            ),
        }
        Ok(outcome)
    }

    pub async fn fail_classified(
        &self,
        id: &str,
        worker_id: &str,
        failure: &ClassifiedFailure,
    ) -> Result<Option<FailOutcome>> {
        self.fail_job(
            id,
            worker_id,
            &failure.error_text(),
            failure.retryable,
            failure.backoff_override,
        )
        .await
    }

    /// Manual retry: back to PENDING with fresh counters.
    pub async fn retry_job(&self, id: &str) -> Result<bool> {
        let done = self.repo.retry_job(id, self.clock.now_ms()).await?;
        if done {
            info!(job_id = id, "job reset for manual retry");
            self.notify.notify_one();
        }
        Ok(done)
    }

    pub async fn cancel_job(&self, id: &str) -> Result<bool> {
        let done = self.repo.cancel_job(id, self.clock.now_ms()).await?;
        if done {
            info!(job_id = id, "job cancelled");
        }
        Ok(done)
    }

    /// True when the job was cancelled or no longer exists.
    pub async fn is_cancelled(&self, id: &str) -> Result<bool> {
        Ok(match self.repo.get_status(id).await? {
            Some(status) => status == JobStatus::Cancelled.as_str(),
            None => true,
        })
    }

    /// True while the job is PROCESSING under `worker_id`'s lock.
    pub async fn is_held_by(&self, id: &str, worker_id: &str) -> Result<bool> {
        Ok(self
            .repo
            .get_lock(id)
            .await?
            .is_some_and(|(status, owner)| {
                status == JobStatus::Processing.as_str() && owner.as_deref() == Some(worker_id)
            }))
    }

    /// Crash recovery run before a worker's first poll.
    pub async fn release_stuck_jobs(&self, worker_id: &str) -> Result<ReleaseReport> {
        let now = self.clock.now_ms();
        let released = self.repo.release_worker_jobs(worker_id, now).await?;
        let message = format!(
            "lock expired after {}s without completion; worker presumed dead",
            self.config.lock_timeout.as_secs()
        );
        let stale = self
            .repo
            .fail_stale_locks(now, self.config.lock_timeout, &message)
            .await?;
        for id in &stale.terminal {
            warn!(job_id = %id, "expired lock used the last attempt, job failed terminally");
        }
        if released > 0 || stale.failed > 0 {
            info!(worker_id, released, stale_failed = stale.failed, "released stuck jobs");
        }
        Ok(ReleaseReport {
            released,
            stale_failed: stale.failed,
            terminal: stale.terminal,
        })
    }

    /// Terminally fail jobs that have been PROCESSING longer than
    /// `max_runtime`. They need a manual retry.
    pub async fn timeout_long_running_jobs(&self, max_runtime: Duration) -> Result<Vec<String>> {
        let minutes = max_runtime.as_secs() / 60;
        let message = format!(
            "job exceeded the maximum runtime of {minutes} minutes and is presumed stuck on an external dependency; retry manually"
        );
        let ids = self
            .repo
            .timeout_long_running(self.clock.now_ms(), max_runtime, &message)
            .await?;
        for id in &ids {
            warn!(job_id = %id, minutes, "job timed out");
        }
        Ok(ids)
    }

    /// Reset every PROCESSING job to PENDING regardless of lock age.
    pub async fn force_release_all(&self) -> Result<u64> {
        let n = self.repo.force_release_all(self.clock.now_ms()).await?;
        warn!(released = n, "force-released all processing jobs");
        if n > 0 {
            self.notify.notify_waiters();
        }
        Ok(n)
    }

    /// Refresh the locks `worker_id` holds; returns the ids still held.
    pub async fn heartbeat(&self, worker_id: &str, ids: &[String]) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.repo.heartbeat(worker_id, ids, self.clock.now_ms()).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();
        for (status, count) in self.repo.count_by_status().await? {
            match JobStatus::parse(&status) {
                Some(JobStatus::Pending) => stats.pending = count,
                Some(JobStatus::Processing) => stats.processing = count,
                Some(JobStatus::Completed) => stats.completed = count,
                Some(JobStatus::Failed) => stats.failed = count,
                Some(JobStatus::Cancelled) => stats.cancelled = count,
                None => warn!(status, count, "unknown job status in table"),
            }
        }
        Ok(stats)
    }

    /// Delete all jobs in `status`. Running jobs cannot be purged.
    pub async fn delete_by_status(&self, status: JobStatus) -> Result<u64> {
        if status == JobStatus::Processing {
            return Err(Error::validation(
                "refusing to delete PROCESSING jobs; cancel or release them first",
            ));
        }
        let n = self.repo.delete_by_status(status.as_str()).await?;
        info!(status = %status, deleted = n, "purged jobs");
        Ok(n)
    }

    pub async fn cancel_all_pending(&self) -> Result<u64> {
        let n = self.repo.cancel_all_pending(self.clock.now_ms()).await?;
        info!(cancelled = n, "cancelled pending jobs");
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::SqlxJobRepository;
    use crate::database::time::ManualClock;
    use crate::database::{init_pool, run_migrations};
    use crate::domain::{Quality, VideoDownloadMetadata};

    async fn queue() -> (tempfile::TempDir, JobQueue, Arc<ManualClock>) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("q.db").display());
        let pool = init_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let q = JobQueue::new(
            Arc::new(SqlxJobRepository::new(pool)),
            clock.clone(),
            QueueConfig {
                database_url: url,
                lock_timeout: Duration::from_secs(1800),
                default_max_retries: 3,
            },
        );
        (dir, q, clock)
    }

    fn video(url: &str) -> JobMetadata {
        JobMetadata::VideoDownload(VideoDownloadMetadata {
            source_url: url.into(),
            quality: Quality::Best,
        })
    }

    #[tokio::test]
    async fn rejects_malformed_source_url() {
        let (_dir, q, _clock) = queue().await;
        let err = q
            .create_job(video("not a url"), CreateJobOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn purge_refuses_processing() {
        let (_dir, q, _clock) = queue().await;
        assert!(q.delete_by_status(JobStatus::Processing).await.is_err());
    }

    #[tokio::test]
    async fn checkpoint_survives_plain_progress() {
        use crate::pipeline::video::VideoPhase;

        let (_dir, q, _clock) = queue().await;
        let job = q
            .create_job(video("https://example.com/a.mp4"), CreateJobOptions::default())
            .await
            .unwrap();
        q.get_next_job("w1").await.unwrap().unwrap();

        let mut cp = Checkpoint::<VideoPhase>::new();
        cp.record(VideoPhase::Validate, None).unwrap();
        cp.record(VideoPhase::Download, Some("checkpoints/x/download/raw.mp4".into()))
            .unwrap();
        q.update_checkpoint(&job.id, &cp, 30).await.unwrap();

        let mut msg = Map::new();
        msg.insert("message".into(), json!("still going"));
        q.update_progress(&job.id, 35, Some(msg), true).await.unwrap();

        let job = q.get_job(&job.id).await.unwrap();
        assert_eq!(job.progress, 35);
        assert_eq!(job.progress_detail.message.as_deref(), Some("still going"));
        let restored = Checkpoint::<VideoPhase>::from_value(job.progress_detail.checkpoint.unwrap()).unwrap();
        assert_eq!(restored, cp);

        q.clear_checkpoint(&job.id).await.unwrap();
        let job = q.get_job(&job.id).await.unwrap();
        assert!(job.progress_detail.checkpoint.is_none());
        assert_eq!(job.progress_detail.message.as_deref(), Some("still going"));
    }

    #[tokio::test]
    async fn stats_count_each_status() {
        let (_dir, q, _clock) = queue().await;
        for _ in 0..3 {
            q.create_job(video("https://example.com/a.mp4"), CreateJobOptions::default())
                .await
                .unwrap();
        }
        q.get_next_job("w1").await.unwrap().unwrap();
        let stats = q.stats().await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.total(), 3);

        assert_eq!(q.cancel_all_pending().await.unwrap(), 2);
        assert_eq!(q.stats().await.unwrap().cancelled, 2);
    }
}
