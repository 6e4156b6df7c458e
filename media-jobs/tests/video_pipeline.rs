mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use platforms_parser::{ExtractorError, ExtractorRegistry, Extraction, PlatformExtractor};
use url::Url;

use common::{CallLog, FakeToolkit, FlakyStrategy, LOCK_TIMEOUT, TestQueue, h264_probe};
use media_jobs::config::{DownloadConfig, WorkerConfig};
use media_jobs::database::repositories::{AssetCatalog, SqlxAssetCatalog};
use media_jobs::domain::{CreateJobOptions, JobMetadata, JobStatus, Quality, VideoDownloadMetadata};
use media_jobs::download::{DownloadChain, DownloadStrategy};
use media_jobs::pipeline::Pipeline;
use media_jobs::pipeline::video::{SourceResolver, VideoPipeline, asset_key};
use media_jobs::storage::{BlobStore, ObjectBlobStore};
use media_jobs::worker::{Pipelines, Worker};

const PAYLOAD: &[u8] = b"not really an mp4 but long enough to count";

/// Reports every watch page as private.
struct PrivateVideos;

#[async_trait]
impl PlatformExtractor for PrivateVideos {
    fn name(&self) -> &'static str {
        "private-videos"
    }

    fn matches(&self, url: &Url) -> bool {
        url.host_str() == Some("videos.example.com")
    }

    async fn extract(&self, _url: &Url) -> Result<Extraction, ExtractorError> {
        Err(ExtractorError::Private("uploader restricted this video".into()))
    }
}

struct Harness {
    t: TestQueue,
    store: Arc<ObjectBlobStore>,
    catalog: Arc<SqlxAssetCatalog>,
    log: CallLog,
    worker: Worker,
}

async fn harness(failures: usize) -> Harness {
    let t = TestQueue::new().await;
    let log = CallLog::default();
    let store = Arc::new(ObjectBlobStore::in_memory());
    let catalog = Arc::new(SqlxAssetCatalog::new(t.pool.clone()));

    let registry = ExtractorRegistry::new(Duration::from_secs(60));
    registry.register(Arc::new(PrivateVideos));
    let resolver = SourceResolver::new(Arc::new(registry), DownloadConfig::default());
    let strategy: Arc<dyn DownloadStrategy> =
        Arc::new(FlakyStrategy::new(failures, PAYLOAD, log.clone()));
    let pipeline: Arc<dyn Pipeline> = Arc::new(VideoPipeline::new(
        resolver,
        Arc::new(DownloadChain::new(vec![strategy])),
        Arc::new(FakeToolkit::new(h264_probe(1080), log.clone())),
        catalog.clone(),
    ));

    let worker = Worker::new(
        WorkerConfig {
            worker_id: "video-test".into(),
            work_dir: t.work_root(),
            ..WorkerConfig::default()
        },
        t.queue.clone(),
        store.clone(),
        Pipelines {
            video: pipeline.clone(),
            dubbing: pipeline,
        },
    );
    Harness {
        t,
        store,
        catalog,
        log,
        worker,
    }
}

fn video_job(url: &str, quality: Quality) -> JobMetadata {
    JobMetadata::VideoDownload(VideoDownloadMetadata {
        source_url: url.into(),
        quality,
    })
}

#[tokio::test]
async fn network_failure_is_retried_and_resumes_after_validation() {
    let h = harness(1).await;
    let job = h
        .t
        .queue
        .create_job(
            video_job("https://cdn.example.com/clip.mp4", Quality::P720),
            CreateJobOptions::default(),
        )
        .await
        .unwrap();

    // First attempt: the download hits a 503.
    assert_eq!(h.worker.process_next().await.unwrap(), Some(job.id.clone()));
    let failed = h.t.queue.get_job(&job.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.retry_count, 1);
    assert!(failed.error.as_deref().unwrap().contains("503"));
    let checkpoint = failed.progress_detail.checkpoint.clone().unwrap();
    assert_eq!(checkpoint["completedPhases"], serde_json::json!(["validate"]));

    // Backoff holds the job back until the first schedule step passes.
    assert_eq!(h.worker.process_next().await.unwrap(), None);
    h.t.clock.advance(Duration::from_secs(30));
    assert_eq!(h.worker.process_next().await.unwrap(), Some(job.id.clone()));

    let done = h.t.queue.get_job(&job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 100);
    assert!(done.progress_detail.checkpoint.is_none());

    // 1080p source with a 720p cap is transcoded once, on the second run.
    assert_eq!(h.log.count("fetch "), 2);
    assert_eq!(h.log.count("transcode raw.mp4 Some(720)"), 1);

    let asset = h.catalog.media_asset_for_job(&job.id).await.unwrap().unwrap();
    assert_eq!(asset.storage_key, asset_key(&job.id));
    assert_eq!(asset.height, Some(1080));
    assert_eq!(asset.content_type, "video/mp4");
    assert_eq!(
        h.store.get(&asset.storage_key).await.unwrap().unwrap().to_vec(),
        b"transcoded".to_vec()
    );

    let leftovers = h
        .store
        .list(&format!("checkpoints/{}/", job.id))
        .await
        .unwrap();
    assert!(leftovers.is_empty(), "checkpoint blobs left: {leftovers:?}");
    assert!(!h.t.work_root().join(&job.id).exists());
}

#[tokio::test]
async fn playable_sources_are_uploaded_untouched() {
    let h = harness(0).await;
    let job = h
        .t
        .queue
        .create_job(
            video_job("https://cdn.example.com/clip.mp4", Quality::Best),
            CreateJobOptions::default(),
        )
        .await
        .unwrap();

    h.worker.process_next().await.unwrap();
    assert_eq!(
        h.t.queue.get_job(&job.id).await.unwrap().status,
        JobStatus::Completed
    );
    assert_eq!(h.log.count("transcode"), 0);
    assert_eq!(
        h.store.get(&asset_key(&job.id)).await.unwrap().unwrap().to_vec(),
        PAYLOAD.to_vec()
    );
}

#[tokio::test]
async fn private_videos_fail_without_retry() {
    let h = harness(0).await;
    let job = h
        .t
        .queue
        .create_job(
            video_job("https://videos.example.com/watch/42", Quality::Best),
            CreateJobOptions::default(),
        )
        .await
        .unwrap();

    h.worker.process_next().await.unwrap();
    let dead = h.t.queue.get_job(&job.id).await.unwrap();
    assert_eq!(dead.status, JobStatus::Failed);
    assert!(dead.is_terminal());
    assert!(dead.error.unwrap().to_lowercase().contains("private"));
    assert_eq!(h.log.count("fetch "), 0);
    assert!(h.catalog.media_asset_for_job(&job.id).await.unwrap().is_none());

    h.t.clock.advance(Duration::from_secs(3600));
    assert_eq!(h.worker.process_next().await.unwrap(), None);
}

#[tokio::test]
async fn cancelled_before_start_does_no_work() {
    let h = harness(0).await;
    let job = h
        .t
        .queue
        .create_job(
            video_job("https://cdn.example.com/clip.mp4", Quality::Best),
            CreateJobOptions::default(),
        )
        .await
        .unwrap();
    h.t.queue.cancel_job(&job.id).await.unwrap();

    assert_eq!(h.worker.process_next().await.unwrap(), None);
    assert!(h.log.calls().is_empty());
}

#[tokio::test]
async fn startup_purges_jobs_whose_expired_lock_was_the_last_attempt() {
    let h = harness(0).await;
    let job = h
        .t
        .queue
        .create_job(
            video_job("https://cdn.example.com/clip.mp4", Quality::Best),
            CreateJobOptions {
                max_retries: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    // A host died mid-run, leaving a checkpoint blob and scratch files.
    h.t.queue.get_next_job("dead-host").await.unwrap().unwrap();
    let blob = format!("checkpoints/{}/download/raw.mp4", job.id);
    h.store.put(&blob, Bytes::from_static(PAYLOAD)).await.unwrap();
    let scratch = h.t.work_root().join(&job.id);
    std::fs::create_dir_all(&scratch).unwrap();
    std::fs::write(scratch.join("raw.mp4"), PAYLOAD).unwrap();

    h.t.clock.advance(LOCK_TIMEOUT + Duration::from_secs(1));
    h.worker.start().await.unwrap();
    h.worker.stop().await;

    let dead = h.t.queue.get_job(&job.id).await.unwrap();
    assert_eq!(dead.status, JobStatus::Failed);
    assert!(dead.is_terminal());
    assert!(dead.completed_at.is_some());
    assert!(
        h.store
            .list(&format!("checkpoints/{}/", job.id))
            .await
            .unwrap()
            .is_empty()
    );
    assert!(!scratch.exists());
    assert!(h.log.calls().is_empty());
}
