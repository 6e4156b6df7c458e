mod common;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::task::JoinSet;

use common::{LOCK_TIMEOUT, TestQueue};
use media_jobs::Error;
use media_jobs::domain::{
    BACKOFF_SCHEDULE_SECS, CreateJobOptions, DubbingMetadata, FailOutcome, JobMetadata, JobStatus,
    JobType, Quality, VideoDownloadMetadata,
};

fn video(n: usize) -> JobMetadata {
    JobMetadata::VideoDownload(VideoDownloadMetadata {
        source_url: format!("https://cdn.example.com/{n}.mp4"),
        quality: Quality::Best,
    })
}

fn dub(movie: &str) -> JobMetadata {
    JobMetadata::AiDubbing(
        serde_json::from_value::<DubbingMetadata>(serde_json::json!({
            "movieId": movie,
            "targetLanguage": "es",
        }))
        .unwrap(),
    )
}

fn priority(p: i32) -> CreateJobOptions {
    CreateJobOptions {
        priority: p,
        ..Default::default()
    }
}

#[tokio::test]
async fn claims_by_priority_then_schedule() {
    let t = TestQueue::new().await;
    let low = t.queue.create_job(video(1), priority(0)).await.unwrap();
    t.clock.advance(Duration::from_millis(5));
    let high = t.queue.create_job(video(2), priority(10)).await.unwrap();
    t.clock.advance(Duration::from_millis(5));
    let low_later = t.queue.create_job(dub("m1"), priority(0)).await.unwrap();

    let order: Vec<String> = [
        t.queue.get_next_job("w").await.unwrap().unwrap(),
        t.queue.get_next_job("w").await.unwrap().unwrap(),
        t.queue.get_next_job("w").await.unwrap().unwrap(),
    ]
    .into_iter()
    .map(|j| j.id)
    .collect();
    assert_eq!(order, vec![high.id, low.id, low_later.id.clone()]);
    assert!(t.queue.get_next_job("w").await.unwrap().is_none());

    let claimed = t.queue.get_job(&low_later.id).await.unwrap();
    assert_eq!(claimed.job_type, JobType::AiDubbing);
    assert_eq!(claimed.status, JobStatus::Processing);
    assert_eq!(claimed.locked_by.as_deref(), Some("w"));
    assert!(claimed.started_at.is_some());
}

#[tokio::test]
async fn delayed_jobs_wait_for_run_at() {
    let t = TestQueue::new().await;
    let run_at = chrono::DateTime::from_timestamp_millis(t.queue.now_ms() + 60_000).unwrap();
    let job = t
        .queue
        .create_job(
            video(1),
            CreateJobOptions {
                run_at: Some(run_at),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(t.queue.get_next_job("w").await.unwrap().is_none());
    t.clock.advance(Duration::from_secs(61));
    let claimed = t.queue.get_next_job("w").await.unwrap().unwrap();
    assert_eq!(claimed.id, job.id);
}

#[tokio::test]
async fn retries_follow_the_backoff_schedule_until_terminal() {
    let t = TestQueue::new().await;
    let job = t
        .queue
        .create_job(
            video(1),
            CreateJobOptions {
                max_retries: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    for attempt in 1..=2u32 {
        t.queue.get_next_job("w").await.unwrap().unwrap();
        let outcome = t
            .queue
            .fail_job(&job.id, "w", "connection reset", true, None)
            .await
            .unwrap();
        let delay = Duration::from_secs(BACKOFF_SCHEDULE_SECS[attempt as usize - 1]);
        assert_eq!(
            outcome,
            Some(FailOutcome::Retrying {
                retry_count: attempt,
                delay
            })
        );

        let failed = t.queue.get_job(&job.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.locked_by.is_none());
        assert!(!failed.is_terminal());

        // Not eligible one second before the gate opens.
        t.clock.advance(delay - Duration::from_secs(1));
        assert!(t.queue.get_next_job("w").await.unwrap().is_none());
        t.clock.advance(Duration::from_secs(1));
    }

    t.queue.get_next_job("w").await.unwrap().unwrap();
    let outcome = t
        .queue
        .fail_job(&job.id, "w", "connection reset", true, None)
        .await
        .unwrap();
    assert_eq!(outcome, Some(FailOutcome::Terminal { retry_count: 3 }));

    t.clock.advance(Duration::from_secs(3600));
    assert!(t.queue.get_next_job("w").await.unwrap().is_none());
    let dead = t.queue.get_job(&job.id).await.unwrap();
    assert!(dead.is_terminal());
    assert!(dead.completed_at.is_some());

    // A manual retry resets the counters and makes it eligible at once.
    assert!(t.queue.retry_job(&job.id).await.unwrap());
    let again = t.queue.get_next_job("w").await.unwrap().unwrap();
    assert_eq!(again.id, job.id);
    assert_eq!(again.retry_count, 0);
    assert!(again.error.is_none());
}

#[tokio::test]
async fn rate_limit_hint_replaces_the_schedule() {
    let t = TestQueue::new().await;
    let job = t.queue.create_job(video(1), priority(0)).await.unwrap();
    t.queue.get_next_job("w").await.unwrap().unwrap();
    let outcome = t
        .queue
        .fail_job(&job.id, "w", "HTTP 429", true, Some(Duration::from_secs(900)))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        Some(FailOutcome::Retrying {
            retry_count: 1,
            delay: Duration::from_secs(900)
        })
    );
    t.clock.advance(Duration::from_secs(BACKOFF_SCHEDULE_SECS[4]));
    assert!(t.queue.get_next_job("w").await.unwrap().is_none());
    t.clock.advance(Duration::from_secs(900));
    assert!(t.queue.get_next_job("w").await.unwrap().is_some());
}

#[tokio::test]
async fn non_retryable_failure_is_terminal_immediately() {
    let t = TestQueue::new().await;
    let job = t.queue.create_job(video(1), priority(0)).await.unwrap();
    t.queue.get_next_job("w").await.unwrap().unwrap();
    let outcome = t
        .queue
        .fail_job(&job.id, "w", "video is private", false, None)
        .await
        .unwrap();
    assert!(outcome.unwrap().is_terminal());
    let dead = t.queue.get_job(&job.id).await.unwrap();
    assert_eq!(dead.retry_count, dead.max_retries);
    assert_eq!(dead.error.as_deref(), Some("video is private"));
}

#[tokio::test]
async fn completion_is_idempotent_and_final() {
    let t = TestQueue::new().await;
    let job = t.queue.create_job(video(1), priority(0)).await.unwrap();
    t.queue.get_next_job("w").await.unwrap().unwrap();
    assert!(t.queue.complete_job(&job.id, "w").await.unwrap());
    assert!(!t.queue.complete_job(&job.id, "w").await.unwrap());

    let done = t.queue.get_job(&job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 100);
    assert!(done.locked_by.is_none());

    // Failing a finished job is ignored.
    assert_eq!(
        t.queue
            .fail_job(&job.id, "w", "late", true, None)
            .await
            .unwrap(),
        None
    );
    assert_eq!(
        t.queue.get_job(&job.id).await.unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn cancellation_is_seen_by_running_jobs() {
    let t = TestQueue::new().await;
    let pending = t.queue.create_job(video(1), priority(0)).await.unwrap();
    let running = t.queue.create_job(video(2), priority(5)).await.unwrap();
    t.queue.get_next_job("w").await.unwrap().unwrap();

    assert!(t.queue.cancel_job(&running.id).await.unwrap());
    assert!(t.queue.is_cancelled(&running.id).await.unwrap());
    assert!(!t.queue.is_cancelled(&pending.id).await.unwrap());
    assert!(t.queue.is_cancelled("no-such-job").await.unwrap());

    // A cancelled job cannot be completed by a late worker.
    assert!(!t.queue.complete_job(&running.id, "w").await.unwrap());
    assert!(!t.queue.cancel_job(&running.id).await.unwrap());

    assert_eq!(t.queue.cancel_all_pending().await.unwrap(), 1);
    let stats = t.queue.stats().await.unwrap();
    assert_eq!(stats.cancelled, 2);
    assert_eq!(stats.total(), 2);

    assert_eq!(t.queue.delete_by_status(JobStatus::Cancelled).await.unwrap(), 2);
    assert!(matches!(
        t.queue.get_job(&pending.id).await,
        Err(Error::NotFound { .. })
    ));
}

#[tokio::test]
async fn startup_recovery_resets_own_jobs_and_fails_stale_locks() {
    let t = TestQueue::new().await;
    let mine = t.queue.create_job(video(1), priority(5)).await.unwrap();
    let theirs = t.queue.create_job(video(2), priority(0)).await.unwrap();
    t.queue.get_next_job("me").await.unwrap().unwrap();
    t.queue.get_next_job("dead-host").await.unwrap().unwrap();
    t.queue
        .update_progress(&mine.id, 40, None, true)
        .await
        .unwrap();

    // Fresh lock elsewhere: only our own job is released.
    let report = t.queue.release_stuck_jobs("me").await.unwrap();
    assert_eq!((report.released, report.stale_failed), (1, 0));
    let reset = t.queue.get_job(&mine.id).await.unwrap();
    assert_eq!(reset.status, JobStatus::Pending);
    assert_eq!(reset.progress, 0);
    assert!(reset.locked_by.is_none());

    t.clock.advance(LOCK_TIMEOUT + Duration::from_secs(1));
    let report = t.queue.release_stuck_jobs("me").await.unwrap();
    assert_eq!((report.released, report.stale_failed), (0, 1));
    assert!(report.terminal.is_empty());
    let stale = t.queue.get_job(&theirs.id).await.unwrap();
    assert_eq!(stale.status, JobStatus::Failed);
    assert_eq!(stale.retry_count, 1);
    assert!(stale.locked_by.is_none());
    assert!(stale.error.unwrap().contains("lock expired"));

    // Normal retry logic takes over.
    let reclaimed: Vec<String> = [
        t.queue.get_next_job("me").await.unwrap().unwrap().id,
        t.queue.get_next_job("me").await.unwrap().unwrap().id,
    ]
    .into();
    assert!(reclaimed.contains(&theirs.id));
}

#[tokio::test]
async fn stale_lock_on_the_last_attempt_finishes_the_job() {
    let t = TestQueue::new().await;
    let job = t
        .queue
        .create_job(
            video(1),
            CreateJobOptions {
                max_retries: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    t.queue.get_next_job("dead-host").await.unwrap().unwrap();

    t.clock.advance(LOCK_TIMEOUT + Duration::from_secs(1));
    let report = t.queue.release_stuck_jobs("me").await.unwrap();
    assert_eq!(report.stale_failed, 1);
    assert_eq!(report.terminal, vec![job.id.clone()]);

    let dead = t.queue.get_job(&job.id).await.unwrap();
    assert!(dead.is_terminal());
    assert!(dead.retry_after.is_none());
    assert!(dead.completed_at.is_some());

    t.clock.advance(Duration::from_secs(3600));
    assert!(t.queue.get_next_job("me").await.unwrap().is_none());
}

#[tokio::test]
async fn a_worker_that_lost_its_lock_cannot_finish_the_job() {
    let t = TestQueue::new().await;
    let job = t.queue.create_job(video(1), priority(0)).await.unwrap();
    t.queue.get_next_job("worker-a").await.unwrap().unwrap();

    // worker-a stalls past its lock; worker-b recovers and retakes the job.
    t.clock.advance(LOCK_TIMEOUT + Duration::from_secs(1));
    let report = t.queue.release_stuck_jobs("worker-b").await.unwrap();
    assert_eq!(report.stale_failed, 1);
    let taken = t.queue.get_next_job("worker-b").await.unwrap().unwrap();
    assert_eq!(taken.id, job.id);
    assert!(!t.queue.is_held_by(&job.id, "worker-a").await.unwrap());

    // worker-a wakes up and reports a result it no longer owns.
    assert!(!t.queue.complete_job(&job.id, "worker-a").await.unwrap());
    assert_eq!(
        t.queue
            .fail_job(&job.id, "worker-a", "late failure", false, None)
            .await
            .unwrap(),
        None
    );
    let still = t.queue.get_job(&job.id).await.unwrap();
    assert_eq!(still.status, JobStatus::Processing);
    assert_eq!(still.locked_by.as_deref(), Some("worker-b"));
    assert_eq!(still.retry_count, 1);
    assert!(still.error.is_none());

    assert!(t.queue.is_held_by(&job.id, "worker-b").await.unwrap());
    assert!(t.queue.complete_job(&job.id, "worker-b").await.unwrap());
}

#[tokio::test]
async fn heartbeat_keeps_long_jobs_from_looking_stale() {
    let t = TestQueue::new().await;
    let job = t.queue.create_job(video(1), priority(0)).await.unwrap();
    t.queue.get_next_job("busy").await.unwrap().unwrap();

    for _ in 0..3 {
        t.clock.advance(LOCK_TIMEOUT / 2);
        assert_eq!(
            t.queue
                .heartbeat("busy", std::slice::from_ref(&job.id))
                .await
                .unwrap(),
            vec![job.id.clone()]
        );
    }
    // Another worker's heartbeat does not refresh this lock.
    assert_eq!(
        t.queue
            .heartbeat("other", std::slice::from_ref(&job.id))
            .await
            .unwrap()
            .len(),
        0
    );

    let report = t.queue.release_stuck_jobs("other").await.unwrap();
    assert_eq!(report.stale_failed, 0);
    assert!(t.queue.get_next_job("other").await.unwrap().is_none());
    assert_eq!(
        t.queue.get_job(&job.id).await.unwrap().status,
        JobStatus::Processing
    );
}

#[tokio::test]
async fn watchdog_fails_overlong_jobs_for_manual_recovery() {
    let t = TestQueue::new().await;
    let slow = t.queue.create_job(video(1), priority(5)).await.unwrap();
    t.queue.get_next_job("w").await.unwrap().unwrap();
    t.clock.advance(Duration::from_secs(90 * 60));
    let fresh = t.queue.create_job(video(2), priority(0)).await.unwrap();
    t.queue.get_next_job("w").await.unwrap().unwrap();
    t.clock.advance(Duration::from_secs(31 * 60));

    let timed_out = t
        .queue
        .timeout_long_running_jobs(Duration::from_secs(120 * 60))
        .await
        .unwrap();
    assert_eq!(timed_out, vec![slow.id.clone()]);

    let dead = t.queue.get_job(&slow.id).await.unwrap();
    assert_eq!(dead.status, JobStatus::Failed);
    assert!(dead.is_terminal());
    assert!(dead.error.unwrap().contains("120 minutes"));
    assert_eq!(
        t.queue.get_job(&fresh.id).await.unwrap().status,
        JobStatus::Processing
    );
}

#[tokio::test]
async fn force_release_returns_every_running_job() {
    let t = TestQueue::new().await;
    for n in 0..3 {
        t.queue.create_job(video(n), priority(0)).await.unwrap();
    }
    t.queue.get_next_job("a").await.unwrap().unwrap();
    t.queue.get_next_job("b").await.unwrap().unwrap();
    assert_eq!(t.queue.force_release_all().await.unwrap(), 2);
    assert_eq!(t.queue.stats().await.unwrap().pending, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_claims_never_hand_out_a_job_twice() {
    const JOBS: usize = 60;
    const WORKERS: usize = 8;

    let t = TestQueue::new().await;
    for n in 0..JOBS {
        t.queue
            .create_job(video(n), priority((n % 4) as i32))
            .await
            .unwrap();
    }

    let seen = Arc::new(DashSet::new());
    let mut tasks = JoinSet::new();
    for w in 0..WORKERS {
        let queue = t.queue.clone();
        let seen = seen.clone();
        tasks.spawn(async move {
            let worker = format!("worker-{w}");
            let mut claimed = 0;
            while let Some(job) = queue.get_next_job(&worker).await.unwrap() {
                assert!(seen.insert(job.id.clone()), "job {} claimed twice", job.id);
                assert!(queue.complete_job(&job.id, &worker).await.unwrap());
                claimed += 1;
            }
            claimed
        });
    }

    let mut total = 0;
    while let Some(joined) = tasks.join_next().await {
        total += joined.unwrap();
    }
    assert_eq!(total, JOBS);
    assert_eq!(seen.len(), JOBS);
    assert_eq!(t.queue.stats().await.unwrap().completed, JOBS as i64);
}

#[tokio::test]
async fn dubbing_jobs_need_a_movie_and_language() {
    let t = TestQueue::new().await;
    let err = t
        .queue
        .create_job(dub("  "), CreateJobOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}
