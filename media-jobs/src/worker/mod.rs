//! The worker: claims jobs up to a concurrency ceiling and runs them.
//!
//! One poll loop per process. Claims are made sequentially; each claimed job
//! runs on its own task and reports back to the queue when it ends. The
//! loop also drives the runtime watchdog and the lock heartbeat; both stop a
//! local run as soon as its job is no longer held by this worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::WorkerConfig;
use crate::domain::{FailOutcome, Job, JobMetadata, JobStatus};
use crate::pipeline::{JobContext, Pipeline, PipelineOutcome, purge_job_artifacts};
use crate::queue::JobQueue;
use crate::storage::BlobStore;
use crate::utils::fs::job_work_dir;
use crate::{Error, Result};

/// One pipeline per job type.
#[derive(Clone)]
pub struct Pipelines {
    pub video: Arc<dyn Pipeline>,
    pub dubbing: Arc<dyn Pipeline>,
}

impl Pipelines {
    pub fn for_job(&self, job: &Job) -> &Arc<dyn Pipeline> {
        match job.metadata {
            JobMetadata::VideoDownload(_) => &self.video,
            JobMetadata::AiDubbing(_) => &self.dubbing,
        }
    }
}

/// In-flight job ids and the token that stops each run.
type InFlight = Arc<DashMap<String, CancellationToken>>;

/// Removes a job from the in-flight map however its task ends.
struct InFlightGuard {
    map: InFlight,
    job_id: String,
}

impl InFlightGuard {
    fn register(map: &InFlight, job_id: &str) -> (Self, CancellationToken) {
        let stop = CancellationToken::new();
        map.insert(job_id.to_string(), stop.clone());
        let guard = Self {
            map: map.clone(),
            job_id: job_id.to_string(),
        };
        (guard, stop)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.map.remove(&self.job_id);
    }
}

/// State shared between the worker handle, its poll loop and job tasks.
struct Shared {
    config: WorkerConfig,
    queue: Arc<JobQueue>,
    store: Arc<dyn BlobStore>,
    pipelines: Pipelines,
    in_flight: InFlight,
    cancellation_token: CancellationToken,
}

pub struct Worker {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        queue: Arc<JobQueue>,
        store: Arc<dyn BlobStore>,
        pipelines: Pipelines,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                queue,
                store,
                pipelines,
                in_flight: Arc::new(DashMap::new()),
                cancellation_token: CancellationToken::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.shared.config.worker_id
    }

    /// Recover from a previous crash, then start polling.
    pub async fn start(&self) -> Result<()> {
        if self.handle.lock().is_some() {
            return Err(Error::Other("worker already started".to_string()));
        }
        let report = self
            .shared
            .queue
            .release_stuck_jobs(&self.shared.config.worker_id)
            .await?;
        info!(
            worker_id = %self.shared.config.worker_id,
            max_concurrency = self.shared.config.max_concurrency,
            released = report.released,
            stale_failed = report.stale_failed,
            "starting worker"
        );
        for job_id in &report.terminal {
            self.shared.discard(job_id).await;
        }

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move { shared.run_loop().await });
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop claiming, give in-flight jobs the grace period, then abort them.
    pub async fn stop(&self) {
        info!(worker_id = %self.shared.config.worker_id, "stopping worker");
        self.shared.cancellation_token.cancel();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!(error = %e, "worker loop ended abnormally");
        }
        info!(worker_id = %self.shared.config.worker_id, "worker stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.shared.cancellation_token.is_cancelled() && self.handle.lock().is_some()
    }

    pub fn in_flight(&self) -> Vec<String> {
        self.shared
            .in_flight
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Claim one job and run it to its reported outcome on the calling task.
    /// Returns the job id, or `None` when nothing is eligible.
    pub async fn process_next(&self) -> Result<Option<String>> {
        let shared = &self.shared;
        let Some(job) = shared.queue.get_next_job(&shared.config.worker_id).await? else {
            return Ok(None);
        };
        let job_id = job.id.clone();
        let (_guard, stop) = InFlightGuard::register(&shared.in_flight, &job_id);
        let span = info_span!("job", job_id = %job.id, job_type = %job.job_type);
        shared.execute(job, stop).instrument(span).await;
        Ok(Some(job_id))
    }

    /// Run until SIGINT or SIGTERM, then shut down gracefully.
    pub async fn run_until_signal(&self) -> Result<()> {
        self.start().await?;
        shutdown_signal().await;
        info!("shutdown signal received");
        self.stop().await;
        Ok(())
    }
}

impl Shared {
    async fn run_loop(self: Arc<Self>) {
        let mut jobs: JoinSet<()> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, String> = HashMap::new();

        let mut watchdog = tokio::time::interval(self.config.watchdog_interval);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.reset();

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }
            self.fill_slots(&mut jobs, &mut running).await;

            tokio::select! {
                _ = self.cancellation_token.cancelled() => break,
                _ = watchdog.tick() => self.run_watchdog().await,
                _ = heartbeat.tick() => self.send_heartbeat().await,
                Some(joined) = jobs.join_next_with_id(), if !jobs.is_empty() => {
                    self.reap(joined, &mut running).await;
                }
                _ = self.queue.wait_for_job(self.config.poll_interval) => {}
            }
        }

        self.drain(jobs, running).await;
    }

    /// Claim sequentially until the free slots are used or nothing is
    /// eligible.
    async fn fill_slots(
        self: &Arc<Self>,
        jobs: &mut JoinSet<()>,
        running: &mut HashMap<tokio::task::Id, String>,
    ) {
        let free = self
            .config
            .max_concurrency
            .saturating_sub(self.in_flight.len());
        for _ in 0..free {
            if self.cancellation_token.is_cancelled() {
                return;
            }
            match self.queue.get_next_job(&self.config.worker_id).await {
                Ok(Some(job)) => {
                    let job_id = job.id.clone();
                    let id = self.dispatch(job, jobs);
                    running.insert(id, job_id);
                }
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "failed to claim next job");
                    return;
                }
            }
        }
    }

    fn dispatch(self: &Arc<Self>, job: Job, jobs: &mut JoinSet<()>) -> tokio::task::Id {
        let (guard, stop) = InFlightGuard::register(&self.in_flight, &job.id);
        let span = info_span!("job", job_id = %job.id, job_type = %job.job_type);
        let shared = self.clone();
        jobs.spawn(
            async move {
                let _guard = guard;
                shared.execute(job, stop).await;
            }
            .instrument(span),
        )
        .id()
    }

    async fn execute(&self, job: Job, stop: CancellationToken) {
        let pipeline = self.pipelines.for_job(&job).clone();
        let job_id = job.id.clone();
        info!(
            pipeline = pipeline.name(),
            attempt = job.retry_count + 1,
            max_retries = job.max_retries,
            "job started"
        );
        let started = Instant::now();
        let worker_id = self.config.worker_id.as_str();
        let ctx = JobContext::new(
            job,
            self.queue.clone(),
            self.store.clone(),
            &self.config.work_dir,
            worker_id,
            stop.clone(),
        );
        let result = tokio::select! {
            result = pipeline.run(&ctx) => result,
            _ = stop.cancelled() => {
                warn!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "job stopped, no longer held by this worker"
                );
                self.settle_stopped(&job_id).await;
                return;
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(PipelineOutcome::Completed) => {
                match self.queue.complete_job(&job_id, worker_id).await {
                    Ok(true) => {
                        info!(elapsed_ms, "job finished");
                        self.clear_checkpoint(&job_id).await;
                    }
                    Ok(false) => {
                        warn!(elapsed_ms, "finished run discarded, job no longer held");
                        self.settle_stopped(&job_id).await;
                    }
                    Err(e) => error!(error = %e, "failed to mark job completed"),
                }
            }
            Ok(PipelineOutcome::Cancelled) => {
                info!(elapsed_ms, "job stopped between phases");
                self.settle_stopped(&job_id).await;
            }
            Err(failure) => {
                warn!(
                    elapsed_ms,
                    category = %failure.category,
                    retryable = failure.retryable,
                    error = %failure.message,
                    "job run failed"
                );
                match self.queue.fail_classified(&job_id, worker_id, &failure).await {
                    Ok(Some(FailOutcome::Terminal { .. })) => self.discard(&job_id).await,
                    Ok(Some(_)) => {}
                    Ok(None) => self.settle_stopped(&job_id).await,
                    Err(e) => error!(error = %e, "failed to record job failure"),
                }
            }
        }
    }

    /// Clean up after a run that ended without owning the outcome. Artifacts
    /// go only once the job is finished for good; a job that was released or
    /// taken over keeps them for whoever runs it next.
    async fn settle_stopped(&self, job_id: &str) {
        match self.queue.get_job(job_id).await {
            Ok(job) if job.status == JobStatus::Cancelled || job.is_terminal() => {
                self.discard(job_id).await;
            }
            Ok(job) => debug!(
                status = %job.status,
                locked_by = ?job.locked_by,
                "leaving artifacts to the job's next run"
            ),
            Err(Error::NotFound { .. }) => {
                let work_dir = job_work_dir(&self.config.work_dir, job_id);
                if let Err(e) = purge_job_artifacts(self.store.as_ref(), &work_dir, job_id).await {
                    warn!(error = %e, "failed to purge artifacts of a deleted job");
                }
            }
            Err(e) => warn!(error = %e, "failed to read stopped job"),
        }
    }

    /// Drop local scratch space, checkpoint blobs and the checkpoint itself.
    async fn discard(&self, job_id: &str) {
        let work_dir = job_work_dir(&self.config.work_dir, job_id);
        if let Err(e) = purge_job_artifacts(self.store.as_ref(), &work_dir, job_id).await {
            warn!(error = %e, "failed to purge job artifacts");
        }
        self.clear_checkpoint(job_id).await;
    }

    async fn clear_checkpoint(&self, job_id: &str) {
        if let Err(e) = self.queue.clear_checkpoint(job_id).await {
            warn!(error = %e, "failed to clear checkpoint");
        }
    }

    async fn reap(
        &self,
        joined: std::result::Result<(tokio::task::Id, ()), JoinError>,
        running: &mut HashMap<tokio::task::Id, String>,
    ) {
        match joined {
            Ok((id, ())) => {
                running.remove(&id);
            }
            Err(e) => {
                let job_id = running.remove(&e.id());
                if e.is_cancelled() {
                    debug!(job_id = ?job_id, "job task aborted");
                    return;
                }
                error!(job_id = ?job_id, error = %e, "job task panicked");
                if let Some(job_id) = job_id
                    && let Err(e) = self
                        .queue
                        .fail_job(
                            &job_id,
                            &self.config.worker_id,
                            &format!("worker task panicked: {e}"),
                            true,
                            None,
                        )
                        .await
                {
                    error!(job_id, error = %e, "failed to record panic");
                }
            }
        }
    }

    /// Fail jobs over the runtime ceiling. Runs of ours are stopped and clean
    /// up after themselves; jobs run elsewhere have their artifacts purged
    /// here since they are now terminal.
    async fn run_watchdog(&self) {
        let ids = match self
            .queue
            .timeout_long_running_jobs(self.config.job_timeout)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "watchdog sweep failed");
                return;
            }
        };
        if ids.is_empty() {
            return;
        }
        warn!(count = ids.len(), "watchdog timed out long-running jobs");
        for job_id in &ids {
            let stop = self.in_flight.get(job_id).map(|entry| entry.value().clone());
            match stop {
                Some(stop) => stop.cancel(),
                None => self.discard(job_id).await,
            }
        }
    }

    /// Refresh our locks and stop every run whose lock is gone.
    async fn send_heartbeat(&self) {
        let ids: Vec<String> = self
            .in_flight
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        if ids.is_empty() {
            return;
        }
        let held = match self.queue.heartbeat(&self.config.worker_id, &ids).await {
            Ok(held) => held,
            Err(e) => {
                warn!(error = %e, "lock heartbeat failed");
                return;
            }
        };
        debug!(refreshed = held.len(), in_flight = ids.len(), "lock heartbeat");
        for job_id in ids.iter().filter(|id| !held.contains(id)) {
            if let Some(entry) = self.in_flight.get(job_id) {
                warn!(job_id = %job_id, "lock lost, stopping job");
                entry.value().cancel();
            }
        }
    }

    /// Wait up to the grace period for running jobs, then abort the rest.
    /// Aborted jobs keep their lock and are released by the next start of a
    /// worker with the same id, or failed once the lock expires.
    async fn drain(&self, mut jobs: JoinSet<()>, mut running: HashMap<tokio::task::Id, String>) {
        if jobs.is_empty() {
            return;
        }
        info!(
            in_flight = jobs.len(),
            grace_secs = self.config.shutdown_grace.as_secs(),
            "waiting for in-flight jobs"
        );
        let deadline = tokio::time::sleep(self.config.shutdown_grace);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!(remaining = jobs.len(), "shutdown grace period elapsed, aborting jobs");
                    jobs.abort_all();
                    break;
                }
                joined = jobs.join_next_with_id() => match joined {
                    Some(joined) => self.reap(joined, &mut running).await,
                    None => return,
                },
            }
        }
        while let Some(joined) = jobs.join_next_with_id().await {
            self.reap(joined, &mut running).await;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
