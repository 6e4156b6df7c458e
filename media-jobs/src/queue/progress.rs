//! Non-blocking progress reporting.
//!
//! Pipelines report through a [`ProgressReporter`], which never waits on the
//! database. A background aggregator coalesces reports per job and persists
//! them on a fixed tick. Checkpoint writes do not go through here; they are
//! awaited directly on the queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::database::repositories::JobRepository;
use crate::database::time::Clock;

pub(crate) const PROGRESS_CHANNEL_CAPACITY: usize = 1024;
const PROGRESS_FLUSH_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub job_id: String,
    pub percent: u8,
    /// Keys shallow-merged into `progress_detail`.
    pub detail: Map<String, Value>,
}

#[derive(Clone)]
pub struct ProgressReporter {
    job_id: String,
    tx: mpsc::Sender<ProgressUpdate>,
}

impl ProgressReporter {
    pub fn new(job_id: impl Into<String>, tx: mpsc::Sender<ProgressUpdate>) -> Self {
        Self {
            job_id: job_id.into(),
            tx,
        }
    }

    /// A reporter whose updates go nowhere.
    pub fn noop(job_id: impl Into<String>) -> Self {
        let (tx, _rx) = mpsc::channel::<ProgressUpdate>(1);
        Self::new(job_id, tx)
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Drops the update if the channel is full; a later report supersedes it.
    pub fn report(&self, percent: u8, detail: Map<String, Value>) {
        let _ = self.tx.try_send(ProgressUpdate {
            job_id: self.job_id.clone(),
            percent: percent.min(100),
            detail,
        });
    }

    pub fn phase(&self, phase: &str, percent: u8, message: impl Into<String>) {
        let mut detail = Map::new();
        detail.insert("phase".into(), json!(phase));
        detail.insert("message".into(), json!(message.into()));
        self.report(percent, detail);
    }

    /// Report a transfer inside the `[start, end]` percent band of a phase.
    pub fn transfer(&self, phase: &str, start: u8, end: u8, snapshot: &TransferSnapshot) {
        let percent = match snapshot.fraction() {
            Some(f) => scale_percent(start, end, f),
            None => start,
        };
        let mut detail = snapshot.to_detail();
        detail.insert("phase".into(), json!(phase));
        self.report(percent, detail);
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("job_id", &self.job_id)
            .finish()
    }
}

/// Map a `0.0..=1.0` fraction onto `start..=end`.
pub fn scale_percent(start: u8, end: u8, fraction: f64) -> u8 {
    let (lo, hi) = (start.min(end), start.max(end));
    let span = f64::from(hi - lo);
    let f = if fraction.is_finite() {
        fraction.clamp(0.0, 1.0)
    } else {
        0.0
    };
    lo + (span * f).floor() as u8
}

/// Persist coalesced progress until every sender is dropped, then flush
/// whatever is still pending.
pub(crate) fn spawn_progress_aggregator(
    repo: Arc<dyn JobRepository>,
    clock: Arc<dyn Clock>,
    mut rx: mpsc::Receiver<ProgressUpdate>,
) {
    if tokio::runtime::Handle::try_current().is_err() {
        // Outside a runtime progress persistence is simply disabled.
        return;
    }

    tokio::spawn(async move {
        let mut pending: HashMap<String, (u8, Map<String, Value>)> = HashMap::new();
        let mut tick = tokio::time::interval(PROGRESS_FLUSH_INTERVAL);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    flush(&*repo, &*clock, &mut pending).await;
                }
                update = rx.recv() => {
                    let Some(update) = update else {
                        flush(&*repo, &*clock, &mut pending).await;
                        break;
                    };
                    let entry = pending
                        .entry(update.job_id)
                        .or_insert_with(|| (0, Map::new()));
                    entry.0 = update.percent;
                    for (k, v) in update.detail {
                        entry.1.insert(k, v);
                    }
                }
            }
        }
        debug!("progress aggregator stopped");
    });
}

async fn flush(
    repo: &dyn JobRepository,
    clock: &dyn Clock,
    pending: &mut HashMap<String, (u8, Map<String, Value>)>,
) {
    for (job_id, (percent, detail)) in pending.drain() {
        let detail = (!detail.is_empty()).then_some(detail);
        match repo
            .report_progress(&job_id, i64::from(percent), detail.as_ref(), clock.now_ms())
            .await
        {
            Ok(true) => {}
            Ok(false) => trace!(job_id, "progress for a job that is no longer running"),
            Err(e) => debug!(job_id, error = %e, "failed to persist progress"),
        }
    }
}

/// Point-in-time view of a transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferSnapshot {
    pub transferred: u64,
    pub total: Option<u64>,
    /// Bytes per second.
    pub speed: u64,
    pub eta: Option<Duration>,
}

impl TransferSnapshot {
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(total) if total > 0 => Some(self.transferred as f64 / total as f64),
            _ => None,
        }
    }

    pub fn to_detail(&self) -> Map<String, Value> {
        let mut detail = Map::new();
        detail.insert("speed".into(), json!(self.speed));
        detail.insert("bytesTransferred".into(), json!(self.transferred));
        if let Some(total) = self.total {
            detail.insert("bytesTotal".into(), json!(total));
        }
        detail.insert(
            "eta".into(),
            self.eta.map_or(Value::Null, |eta| json!(eta.as_secs())),
        );
        detail
    }
}

/// Tracks bytes, throughput and ETA for one download or upload.
#[derive(Debug, Clone)]
pub struct TransferMeter {
    started: Instant,
    total: Option<u64>,
    transferred: u64,
    emit_every: Duration,
    last_emit: Option<Instant>,
}

impl TransferMeter {
    pub fn new(total: Option<u64>) -> Self {
        Self {
            started: Instant::now(),
            total,
            transferred: 0,
            emit_every: Duration::from_millis(500),
            last_emit: None,
        }
    }

    pub fn with_emit_interval(mut self, every: Duration) -> Self {
        self.emit_every = every;
        self
    }

    pub fn set_total(&mut self, total: Option<u64>) {
        self.total = total;
    }

    /// Record `n` more bytes; returns the running total.
    pub fn add(&mut self, n: u64) -> u64 {
        self.transferred = self.transferred.saturating_add(n);
        self.transferred
    }

    pub fn set_transferred(&mut self, n: u64) {
        self.transferred = n;
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn throughput(&self) -> u64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs <= f64::EPSILON {
            return 0;
        }
        (self.transferred as f64 / secs) as u64
    }

    pub fn eta(&self) -> Option<Duration> {
        let total = self.total?;
        let speed = self.throughput();
        if speed == 0 {
            return None;
        }
        Some(Duration::from_secs(
            total.saturating_sub(self.transferred) / speed,
        ))
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            transferred: self.transferred,
            total: self.total,
            speed: self.throughput(),
            eta: self.eta(),
        }
    }

    /// True at most once per emit interval, so callers can report progress
    /// from a hot read loop.
    pub fn should_emit(&mut self) -> bool {
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.emit_every => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}
