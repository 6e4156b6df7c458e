//! Checkpointed pipelines.
//!
//! A pipeline is an ordered list of phases. After each phase its output is
//! uploaded under the job's checkpoint prefix and the [`Checkpoint`] is
//! persisted, so a retry (possibly on another host) skips finished phases
//! and restores only the artifacts it still needs.

pub mod classify;
pub mod dubbing;
pub mod error;
pub mod services;
pub mod tools;
pub mod video;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use classify::classify;
pub use error::PipelineError;

use crate::domain::{
    Checkpoint, CheckpointError, ClassifiedFailure, Job, Phase, checkpoint_key, checkpoint_prefix,
};
use crate::queue::{JobQueue, ProgressReporter};
use crate::storage::BlobStore;
use crate::utils::fs::{job_work_dir, remove_dir_if_exists};

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// How a pipeline run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    /// The job was cancelled or stopped being ours; nothing more was done.
    Cancelled,
}

/// Everything a pipeline needs to run one claimed job.
pub struct JobContext {
    pub job: Job,
    pub queue: Arc<JobQueue>,
    pub store: Arc<dyn BlobStore>,
    /// Per-job scratch directory, kept across retries.
    pub work_dir: PathBuf,
    pub progress: ProgressReporter,
    /// Worker whose lock this run holds.
    pub worker_id: String,
    /// Fired by the worker when the job must stop at once.
    pub stop: CancellationToken,
}

impl JobContext {
    pub fn new(
        job: Job,
        queue: Arc<JobQueue>,
        store: Arc<dyn BlobStore>,
        work_root: &Path,
        worker_id: impl Into<String>,
        stop: CancellationToken,
    ) -> Self {
        let work_dir = job_work_dir(work_root, &job.id);
        let progress = queue.progress_reporter(&job.id);
        Self {
            job,
            queue,
            store,
            work_dir,
            progress,
            worker_id: worker_id.into(),
            stop,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job.id
    }

    /// Cooperative stop point, checked between phases. A run goes on only
    /// while the job is still PROCESSING under this worker's lock; a
    /// cancellation, the runtime watchdog or a takeover after an expired
    /// lock all end it here.
    pub async fn ensure_active(&self) -> PipelineResult<()> {
        if self.stop.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if !self.queue.is_held_by(self.job_id(), &self.worker_id).await? {
            debug!(job_id = self.job_id(), worker_id = %self.worker_id, "job no longer held, stopping");
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }
}

/// A job processor for one job type.
///
/// # Cancel Safety
///
/// The worker aborts runs still going after the shutdown grace period.
/// Implementations only persist a checkpoint after the phase's artifact is
/// safely stored, so an aborted run resumes from the last finished phase.
#[async_trait]
pub trait Pipeline: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &JobContext) -> Result<PipelineOutcome, ClassifiedFailure>;
}

/// Turn a phase-level result into what the worker acts on.
pub fn conclude(
    result: PipelineResult<()>,
    source_url: Option<&str>,
) -> Result<PipelineOutcome, ClassifiedFailure> {
    match result {
        Ok(()) => Ok(PipelineOutcome::Completed),
        Err(PipelineError::Cancelled) => Ok(PipelineOutcome::Cancelled),
        Err(e) => Err(classify(&e, source_url)),
    }
}

/// Progress to persist once `phase` has finished.
fn completion_percent<P: Phase>(phase: P) -> u8 {
    P::ORDER
        .get(phase.position() + 1)
        .map(|next| next.start_percent())
        .unwrap_or(99)
}

/// Decode and verify a persisted checkpoint.
///
/// Returns `Ok(None)` when the checkpoint is corrupt: undecodable, a finished
/// artifact phase without a key, or a key whose blob is gone. Store errors
/// while checking propagate so a flaky store does not discard good progress.
pub async fn restore_checkpoint<P: Phase>(
    store: &dyn BlobStore,
    raw: Value,
) -> PipelineResult<Option<Checkpoint<P>>> {
    let checkpoint = match Checkpoint::<P>::from_value(raw) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "discarding unreadable checkpoint");
            return Ok(None);
        }
    };
    // Only cleanup is left: its artifacts may already be deleted and nothing
    // reads them again.
    if checkpoint.next_phase() == P::ORDER.last().copied() {
        return Ok(Some(checkpoint));
    }
    for (phase, key) in checkpoint.artifacts() {
        if !store.exists(key).await? {
            let gone = CheckpointError::ArtifactGone {
                phase: phase.to_string(),
                key: key.to_string(),
            };
            warn!(error = %gone, "discarding checkpoint");
            return Ok(None);
        }
    }
    Ok(Some(checkpoint))
}

/// Drives a typed checkpoint through one pipeline run.
pub struct PhaseTracker<'a, P: Phase> {
    ctx: &'a JobContext,
    checkpoint: Checkpoint<P>,
}

impl<'a, P: Phase> PhaseTracker<'a, P> {
    /// Load the job's checkpoint, starting fresh when there is none or it is
    /// corrupt.
    pub async fn load(ctx: &'a JobContext) -> PipelineResult<Self> {
        let checkpoint = match ctx.job.progress_detail.checkpoint.clone() {
            None | Some(Value::Null) => Checkpoint::new(),
            Some(raw) => match restore_checkpoint::<P>(ctx.store.as_ref(), raw).await? {
                Some(c) => {
                    info!(
                        job_id = ctx.job_id(),
                        completed = ?c.completed_phases(),
                        next = ?c.next_phase(),
                        "resuming from checkpoint"
                    );
                    c
                }
                None => Checkpoint::new(),
            },
        };
        Ok(Self { ctx, checkpoint })
    }

    pub fn checkpoint(&self) -> &Checkpoint<P> {
        &self.checkpoint
    }

    pub fn should_skip(&self, phase: P) -> bool {
        let skip = self.checkpoint.should_skip(phase);
        if skip {
            debug!(job_id = self.ctx.job_id(), %phase, "phase already completed");
        }
        skip
    }

    /// Check for cancellation and announce the phase.
    pub async fn begin(&self, phase: P, message: impl Into<String>) -> PipelineResult<()> {
        self.ctx.ensure_active().await?;
        let message = message.into();
        info!(job_id = self.ctx.job_id(), %phase, "{message}");
        self.ctx
            .progress
            .phase(&phase.to_string(), phase.start_percent(), message);
        Ok(())
    }

    /// Upload the phase's artifact (if any), then persist the checkpoint.
    /// The local file is left in place for the phases that follow.
    pub async fn complete(&mut self, phase: P, artifact: Option<&Path>) -> PipelineResult<()> {
        let key = match artifact {
            Some(path) => {
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| {
                        PipelineError::invalid(format!("artifact path {} has no file name", path.display()))
                    })?;
                let key = checkpoint_key(self.ctx.job_id(), phase, &file_name);
                let bytes = self.ctx.store.put_file(&key, path, &|_| {}).await?;
                debug!(job_id = self.ctx.job_id(), %phase, key, bytes, "checkpointed artifact");
                Some(key)
            }
            None => None,
        };
        self.record(phase, key).await
    }

    /// Finish `phase` with the artifact an earlier phase already stored.
    pub async fn complete_reusing(&mut self, phase: P, from: P) -> PipelineResult<()> {
        let key = self
            .checkpoint
            .artifact(from)
            .map(str::to_owned)
            .ok_or_else(|| CheckpointError::MissingArtifact(from.to_string()))?;
        self.record(phase, Some(key)).await
    }

    async fn record(&mut self, phase: P, key: Option<String>) -> PipelineResult<()> {
        self.checkpoint.record(phase, key)?;
        self.ctx
            .queue
            .update_checkpoint(self.ctx.job_id(), &self.checkpoint, completion_percent(phase))
            .await?;
        Ok(())
    }

    /// Local path of a finished phase's artifact, downloading it from the
    /// store when this host does not have it.
    pub async fn artifact_path(&self, phase: P) -> PipelineResult<PathBuf> {
        let key = self
            .checkpoint
            .artifact(phase)
            .ok_or_else(|| CheckpointError::MissingArtifact(phase.to_string()))?;
        let local = self.local_path(key);
        if tokio::fs::try_exists(&local).await? {
            return Ok(local);
        }
        self.restore(phase, key, &local).await?;
        Ok(local)
    }

    /// Bring every finished artifact onto this host. Returns what was
    /// fetched from the store.
    pub async fn restore_all(&self) -> PipelineResult<Vec<P>> {
        let mut restored = Vec::new();
        for (phase, key) in self.checkpoint.artifacts() {
            let local = self.local_path(key);
            if tokio::fs::try_exists(&local).await? {
                continue;
            }
            self.restore(phase, key, &local).await?;
            restored.push(phase);
        }
        Ok(restored)
    }

    async fn restore(&self, phase: P, key: &str, local: &Path) -> PipelineResult<()> {
        if !self.ctx.store.get_to_file(key, local).await? {
            return Err(CheckpointError::ArtifactGone {
                phase: phase.to_string(),
                key: key.to_string(),
            }
            .into());
        }
        info!(job_id = self.ctx.job_id(), %phase, key, "restored checkpoint artifact");
        Ok(())
    }

    fn local_path(&self, key: &str) -> PathBuf {
        let file_name = key.rsplit('/').next().unwrap_or(key);
        self.ctx.work_dir.join(file_name)
    }
}

/// Remove everything a job left behind: local scratch space and all
/// checkpoint artifacts. Used after terminal success or failure.
pub async fn purge_job_artifacts(
    store: &dyn BlobStore,
    work_dir: &Path,
    job_id: &str,
) -> crate::Result<usize> {
    remove_dir_if_exists(work_dir).await?;
    let removed = store.delete_prefix(&checkpoint_prefix(job_id)).await?;
    debug!(job_id, removed, "purged checkpoint artifacts");
    Ok(removed)
}
