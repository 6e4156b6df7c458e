//! Job repository.
//!
//! Every status transition is a conditional `UPDATE` so that concurrent
//! worker processes sharing one database cannot both win the same job.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::database::models::JobDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::duration_ms;
use crate::database::begin_immediate;
use crate::domain::FailOutcome;
use crate::{Error, Result};

/// Claim eligibility. Binds, in order: now (retry gate), now (run_at),
/// stale-lock cutoff.
const ELIGIBLE: &str = "(status = 'PENDING' \
      OR (status = 'FAILED' AND retry_after IS NOT NULL AND retry_after <= ? \
          AND retry_count < max_retries)) \
  AND run_at <= ? \
  AND (locked_by IS NULL OR locked_at IS NULL OR locked_at < ?)";

/// Candidate selections retried after losing a compare-and-set race.
const MAX_CLAIM_ATTEMPTS: usize = 8;

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create_job(&self, job: &JobDbModel) -> Result<()>;
    async fn get_job(&self, id: &str) -> Result<JobDbModel>;
    async fn list_jobs(&self, status: Option<&str>, limit: i64) -> Result<Vec<JobDbModel>>;
    async fn get_status(&self, id: &str) -> Result<Option<String>>;
    /// Status and lock holder.
    async fn get_lock(&self, id: &str) -> Result<Option<(String, Option<String>)>>;

    /// Select the best eligible job and lock it for `worker_id`.
    async fn claim_next_job(
        &self,
        worker_id: &str,
        now: i64,
        lock_timeout: Duration,
    ) -> Result<Option<JobDbModel>>;

    /// Set progress and shallow-merge (or replace) `progress_detail`.
    async fn update_progress(
        &self,
        id: &str,
        progress: i64,
        detail: Option<&Map<String, Value>>,
        merge: bool,
        now: i64,
    ) -> Result<bool>;

    /// Like [`update_progress`](Self::update_progress) with merge, but only
    /// while the job is still PROCESSING. Used for buffered progress reports
    /// that may arrive after the job finished.
    async fn report_progress(
        &self,
        id: &str,
        progress: i64,
        detail: Option<&Map<String, Value>>,
        now: i64,
    ) -> Result<bool>;

    /// Only applies while `worker_id` still holds the job's lock.
    async fn complete_job(&self, id: &str, worker_id: &str, now: i64) -> Result<bool>;

    /// Returns `None` unless the job is PROCESSING under `worker_id`'s lock.
    async fn fail_job(
        &self,
        id: &str,
        worker_id: &str,
        error: &str,
        should_retry: bool,
        custom_backoff: Option<Duration>,
        now: i64,
    ) -> Result<Option<FailOutcome>>;

    async fn retry_job(&self, id: &str, now: i64) -> Result<bool>;
    async fn cancel_job(&self, id: &str, now: i64) -> Result<bool>;

    /// Reset this worker's PROCESSING jobs to PENDING.
    async fn release_worker_jobs(&self, worker_id: &str, now: i64) -> Result<u64>;

    /// Fail and unlock PROCESSING jobs whose lock expired, whoever held it.
    async fn fail_stale_locks(
        &self,
        now: i64,
        lock_timeout: Duration,
        message: &str,
    ) -> Result<StaleLocks>;

    /// Reset every PROCESSING job to PENDING, ignoring lock age.
    async fn force_release_all(&self, now: i64) -> Result<u64>;

    /// Terminally fail PROCESSING jobs started before `now - max_runtime`.
    async fn timeout_long_running(
        &self,
        now: i64,
        max_runtime: Duration,
        message: &str,
    ) -> Result<Vec<String>>;

    /// Refresh `locked_at` for jobs still held by `worker_id`; returns the
    /// ids that were refreshed.
    async fn heartbeat(&self, worker_id: &str, ids: &[String], now: i64)
    -> Result<Vec<String>>;

    async fn count_by_status(&self) -> Result<Vec<(String, i64)>>;
    async fn delete_by_status(&self, status: &str) -> Result<u64>;
    async fn cancel_all_pending(&self, now: i64) -> Result<u64>;
}

/// Jobs failed by [`JobRepository::fail_stale_locks`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaleLocks {
    pub failed: u64,
    /// Jobs whose expired lock used up their last attempt.
    pub terminal: Vec<String>,
}

/// SQLx implementation of [`JobRepository`].
pub struct SqlxJobRepository {
    pool: SqlitePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn try_claim(
        &self,
        worker_id: &str,
        now: i64,
        stale_before: i64,
    ) -> Result<ClaimAttempt> {
        let candidate: Option<(String,)> = sqlx::query_as(&format!(
            "SELECT id FROM job WHERE {ELIGIBLE} \
             ORDER BY priority DESC, scheduled_at ASC, created_at ASC, rowid ASC LIMIT 1"
        ))
        .bind(now)
        .bind(now)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await?;

        let Some((id,)) = candidate else {
            return Ok(ClaimAttempt::Empty);
        };

        let updated = sqlx::query(&format!(
            "UPDATE job SET status = 'PROCESSING', locked_by = ?, locked_at = ?, \
                 started_at = COALESCE(started_at, ?), error = NULL, updated_at = ? \
             WHERE id = ? AND {ELIGIBLE}"
        ))
        .bind(worker_id)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(&id)
        .bind(now)
        .bind(now)
        .bind(stale_before)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Ok(ClaimAttempt::Lost(id));
        }

        let row = sqlx::query_as::<_, JobDbModel>("SELECT * FROM job WHERE id = ?")
            .bind(&id)
            .fetch_one(&self.pool)
            .await?;
        Ok(ClaimAttempt::Won(Box::new(row)))
    }

    async fn fail_job_once(
        &self,
        id: &str,
        worker_id: &str,
        error: &str,
        should_retry: bool,
        custom_backoff: Option<Duration>,
        now: i64,
    ) -> Result<Option<FailOutcome>> {
        let mut tx = begin_immediate(&self.pool).await?;

        let row: Option<(String, Option<String>, i64, i64)> = sqlx::query_as(
            "SELECT status, locked_by, retry_count, max_retries FROM job WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((status, locked_by, retry_count, max_retries)) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        if status != "PROCESSING" || locked_by.as_deref() != Some(worker_id) {
            tx.rollback().await?;
            return Ok(None);
        }

        let outcome = FailOutcome::decide(
            u32::try_from(retry_count.max(0)).unwrap_or(u32::MAX),
            u32::try_from(max_retries.max(0)).unwrap_or(u32::MAX),
            should_retry,
            custom_backoff,
        );

        let (retry_after, completed_at) = match outcome {
            FailOutcome::Retrying { delay, .. } => (Some(now + duration_ms(delay)), None),
            FailOutcome::Terminal { .. } => (None, Some(now)),
        };

        sqlx::query(
            "UPDATE job SET status = 'FAILED', retry_count = ?, retry_after = ?, error = ?, \
                 completed_at = ?, locked_by = NULL, locked_at = NULL, updated_at = ? \
             WHERE id = ?",
        )
        .bind(i64::from(outcome.retry_count()))
        .bind(retry_after)
        .bind(error)
        .bind(completed_at)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(outcome))
    }

    async fn update_progress_once(
        &self,
        id: &str,
        progress: i64,
        detail: Option<&Map<String, Value>>,
        merge: bool,
        running_only: bool,
        now: i64,
    ) -> Result<bool> {
        let progress = progress.clamp(0, 100);
        let guard = if running_only {
            " AND status = 'PROCESSING'"
        } else {
            ""
        };

        let Some(detail) = detail else {
            let done = sqlx::query(&format!(
                "UPDATE job SET progress = ?, updated_at = ? WHERE id = ?{guard}"
            ))
            .bind(progress)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            return Ok(done.rows_affected() > 0);
        };

        let mut tx = begin_immediate(&self.pool).await?;
        let current: Option<(String,)> = sqlx::query_as(&format!(
            "SELECT progress_detail FROM job WHERE id = ?{guard}"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((current,)) = current else {
            tx.rollback().await?;
            return Ok(false);
        };

        let next = if merge {
            let mut base = match serde_json::from_str::<Value>(&current) {
                Ok(Value::Object(map)) => map,
                Ok(_) | Err(_) => {
                    warn!(job_id = id, "progress_detail was not a JSON object, replacing");
                    Map::new()
                }
            };
            for (k, v) in detail {
                base.insert(k.clone(), v.clone());
            }
            base
        } else {
            detail.clone()
        };

        sqlx::query("UPDATE job SET progress = ?, progress_detail = ?, updated_at = ? WHERE id = ?")
            .bind(progress)
            .bind(serde_json::to_string(&next)?)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }
}

enum ClaimAttempt {
    Empty,
    Lost(String),
    Won(Box<JobDbModel>),
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn create_job(&self, job: &JobDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job (
                id, job_type, target_id, status, priority, metadata, progress, progress_detail,
                retry_count, max_retries, scheduled_at, run_at, retry_after, locked_by, locked_at,
                started_at, completed_at, error, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.job_type)
        .bind(&job.target_id)
        .bind(&job.status)
        .bind(job.priority)
        .bind(&job.metadata)
        .bind(job.progress)
        .bind(&job.progress_detail)
        .bind(job.retry_count)
        .bind(job.max_retries)
        .bind(job.scheduled_at)
        .bind(job.run_at)
        .bind(job.retry_after)
        .bind(&job.locked_by)
        .bind(job.locked_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(&job.error)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<JobDbModel> {
        sqlx::query_as::<_, JobDbModel>("SELECT * FROM job WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn list_jobs(&self, status: Option<&str>, limit: i64) -> Result<Vec<JobDbModel>> {
        let jobs = match status {
            Some(status) => {
                sqlx::query_as::<_, JobDbModel>(
                    "SELECT * FROM job WHERE status = ? ORDER BY created_at DESC LIMIT ?",
                )
                .bind(status)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, JobDbModel>(
                    "SELECT * FROM job ORDER BY created_at DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(jobs)
    }

    async fn get_status(&self, id: &str) -> Result<Option<String>> {
        let status: Option<(String,)> = sqlx::query_as("SELECT status FROM job WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(status.map(|(s,)| s))
    }

    async fn get_lock(&self, id: &str) -> Result<Option<(String, Option<String>)>> {
        let lock = sqlx::query_as("SELECT status, locked_by FROM job WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(lock)
    }

    async fn claim_next_job(
        &self,
        worker_id: &str,
        now: i64,
        lock_timeout: Duration,
    ) -> Result<Option<JobDbModel>> {
        let stale_before = now - duration_ms(lock_timeout);

        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let attempt = retry_on_sqlite_busy("claim_next_job", || async {
                self.try_claim(worker_id, now, stale_before).await
            })
            .await?;

            match attempt {
                ClaimAttempt::Empty => return Ok(None),
                ClaimAttempt::Won(row) => return Ok(Some(*row)),
                ClaimAttempt::Lost(id) => {
                    debug!(job_id = %id, worker_id, "lost claim race, reselecting");
                }
            }
        }

        debug!(worker_id, "giving up claim after repeated contention");
        Ok(None)
    }

    async fn update_progress(
        &self,
        id: &str,
        progress: i64,
        detail: Option<&Map<String, Value>>,
        merge: bool,
        now: i64,
    ) -> Result<bool> {
        retry_on_sqlite_busy("update_progress", || async {
            self.update_progress_once(id, progress, detail, merge, false, now)
                .await
        })
        .await
    }

    async fn report_progress(
        &self,
        id: &str,
        progress: i64,
        detail: Option<&Map<String, Value>>,
        now: i64,
    ) -> Result<bool> {
        retry_on_sqlite_busy("report_progress", || async {
            self.update_progress_once(id, progress, detail, true, true, now)
                .await
        })
        .await
    }

    async fn complete_job(&self, id: &str, worker_id: &str, now: i64) -> Result<bool> {
        retry_on_sqlite_busy("complete_job", || async {
            let done = sqlx::query(
                "UPDATE job SET status = 'COMPLETED', progress = 100, error = NULL, \
                     retry_after = NULL, locked_by = NULL, locked_at = NULL, \
                     completed_at = ?, updated_at = ? \
                 WHERE id = ? AND status = 'PROCESSING' AND locked_by = ?",
            )
            .bind(now)
            .bind(now)
            .bind(id)
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected() > 0)
        })
        .await
    }

    async fn fail_job(
        &self,
        id: &str,
        worker_id: &str,
        error: &str,
        should_retry: bool,
        custom_backoff: Option<Duration>,
        now: i64,
    ) -> Result<Option<FailOutcome>> {
        retry_on_sqlite_busy("fail_job", || async {
            self.fail_job_once(id, worker_id, error, should_retry, custom_backoff, now)
                .await
        })
        .await
    }

    async fn retry_job(&self, id: &str, now: i64) -> Result<bool> {
        retry_on_sqlite_busy("retry_job", || async {
            let done = sqlx::query(
                "UPDATE job SET status = 'PENDING', retry_count = 0, retry_after = NULL, \
                     locked_by = NULL, locked_at = NULL, started_at = NULL, completed_at = NULL, \
                     error = NULL, run_at = MIN(run_at, ?), updated_at = ? \
                 WHERE id = ? AND status IN ('FAILED', 'CANCELLED')",
            )
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected() > 0)
        })
        .await
    }

    async fn cancel_job(&self, id: &str, now: i64) -> Result<bool> {
        retry_on_sqlite_busy("cancel_job", || async {
            let done = sqlx::query(
                "UPDATE job SET status = 'CANCELLED', retry_after = NULL, \
                     locked_by = NULL, locked_at = NULL, completed_at = ?, updated_at = ? \
                 WHERE id = ? AND status IN ('PENDING', 'PROCESSING', 'FAILED')",
            )
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected() > 0)
        })
        .await
    }

    async fn release_worker_jobs(&self, worker_id: &str, now: i64) -> Result<u64> {
        retry_on_sqlite_busy("release_worker_jobs", || async {
            let done = sqlx::query(
                "UPDATE job SET status = 'PENDING', progress = 0, \
                     locked_by = NULL, locked_at = NULL, updated_at = ? \
                 WHERE status = 'PROCESSING' AND locked_by = ?",
            )
            .bind(now)
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected())
        })
        .await
    }

    async fn fail_stale_locks(
        &self,
        now: i64,
        lock_timeout: Duration,
        message: &str,
    ) -> Result<StaleLocks> {
        let stale_before = now - duration_ms(lock_timeout);
        retry_on_sqlite_busy("fail_stale_locks", || async {
            let mut tx = begin_immediate(&self.pool).await?;
            let terminal: Vec<(String,)> = sqlx::query_as(
                "SELECT id FROM job \
                 WHERE status = 'PROCESSING' AND locked_at IS NOT NULL AND locked_at < ? \
                   AND retry_count + 1 >= max_retries",
            )
            .bind(stale_before)
            .fetch_all(&mut *tx)
            .await?;

            // A lock that ran out on the last attempt ends the job like any
            // other terminal failure.
            let failed = sqlx::query(
                "UPDATE job SET status = 'FAILED', error = ?, retry_count = retry_count + 1, \
                     retry_after = CASE WHEN retry_count + 1 >= max_retries THEN NULL ELSE ? END, \
                     completed_at = CASE WHEN retry_count + 1 >= max_retries THEN ? \
                         ELSE completed_at END, \
                     locked_by = NULL, locked_at = NULL, updated_at = ? \
                 WHERE status = 'PROCESSING' AND locked_at IS NOT NULL AND locked_at < ?",
            )
            .bind(message)
            .bind(now)
            .bind(now)
            .bind(now)
            .bind(stale_before)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            tx.commit().await?;

            Ok(StaleLocks {
                failed,
                terminal: terminal.into_iter().map(|(id,)| id).collect(),
            })
        })
        .await
    }

    async fn force_release_all(&self, now: i64) -> Result<u64> {
        retry_on_sqlite_busy("force_release_all", || async {
            let done = sqlx::query(
                "UPDATE job SET status = 'PENDING', locked_by = NULL, locked_at = NULL, \
                     updated_at = ? \
                 WHERE status = 'PROCESSING'",
            )
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected())
        })
        .await
    }

    async fn timeout_long_running(
        &self,
        now: i64,
        max_runtime: Duration,
        message: &str,
    ) -> Result<Vec<String>> {
        let started_before = now - duration_ms(max_runtime);
        retry_on_sqlite_busy("timeout_long_running", || async {
            let mut tx = begin_immediate(&self.pool).await?;
            let ids: Vec<(String,)> = sqlx::query_as(
                "SELECT id FROM job \
                 WHERE status = 'PROCESSING' AND started_at IS NOT NULL AND started_at < ?",
            )
            .bind(started_before)
            .fetch_all(&mut *tx)
            .await?;

            for (id,) in &ids {
                sqlx::query(
                    "UPDATE job SET status = 'FAILED', retry_count = MAX(retry_count, max_retries), \
                         retry_after = NULL, error = ?, locked_by = NULL, locked_at = NULL, \
                         completed_at = ?, updated_at = ? \
                     WHERE id = ? AND status = 'PROCESSING'",
                )
                .bind(message)
                .bind(now)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok(ids.into_iter().map(|(id,)| id).collect())
        })
        .await
    }

    async fn heartbeat(
        &self,
        worker_id: &str,
        ids: &[String],
        now: i64,
    ) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE job SET locked_at = ?, updated_at = ? \
             WHERE status = 'PROCESSING' AND locked_by = ? AND id IN ({placeholders}) \
             RETURNING id"
        );
        retry_on_sqlite_busy("heartbeat", || async {
            let mut query = sqlx::query_as::<_, (String,)>(&sql)
                .bind(now)
                .bind(now)
                .bind(worker_id);
            for id in ids {
                query = query.bind(id);
            }
            let rows = query.fetch_all(&self.pool).await?;
            Ok(rows.into_iter().map(|(id,)| id).collect())
        })
        .await
    }

    async fn count_by_status(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM job GROUP BY status ORDER BY status")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    async fn delete_by_status(&self, status: &str) -> Result<u64> {
        retry_on_sqlite_busy("delete_by_status", || async {
            let done = sqlx::query("DELETE FROM job WHERE status = ?")
                .bind(status)
                .execute(&self.pool)
                .await?;
            Ok(done.rows_affected())
        })
        .await
    }

    async fn cancel_all_pending(&self, now: i64) -> Result<u64> {
        retry_on_sqlite_busy("cancel_all_pending", || async {
            let done = sqlx::query(
                "UPDATE job SET status = 'CANCELLED', completed_at = ?, updated_at = ? \
                 WHERE status = 'PENDING'",
            )
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected())
        })
        .await
    }
}
