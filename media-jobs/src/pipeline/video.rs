//! Video acquisition: page URL in, browser-playable hosted MP4 out.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use platforms_parser::{ExtractorError, ExtractorErrorKind, ExtractorRegistry, Extraction, Platform};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use super::tools::MediaToolkit;
use super::{
    JobContext, PhaseTracker, Pipeline, PipelineError, PipelineOutcome, PipelineResult, conclude,
    purge_job_artifacts,
};
use crate::config::DownloadConfig;
use crate::database::models::MediaAssetDbModel;
use crate::database::repositories::AssetCatalog;
use crate::domain::{ClassifiedFailure, JobMetadata, Phase, VideoDownloadMetadata};
use crate::download::{DownloadChain, FetchRequest, SizeLimit};
use crate::queue::{ProgressReporter, TransferMeter};
use crate::utils::fs::file_size;

const RAW_FILE: &str = "raw.mp4";
const PROCESSED_FILE: &str = "processed.mp4";
const VIDEO_CONTENT_TYPE: &str = "video/mp4";

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum VideoPhase {
    Validate,
    Download,
    Process,
    Upload,
    Finalize,
    Cleanup,
}

impl Phase for VideoPhase {
    const ORDER: &'static [Self] = &[
        VideoPhase::Validate,
        VideoPhase::Download,
        VideoPhase::Process,
        VideoPhase::Upload,
        VideoPhase::Finalize,
        VideoPhase::Cleanup,
    ];

    fn produces_artifact(self) -> bool {
        matches!(self, VideoPhase::Download | VideoPhase::Process)
    }

    fn start_percent(self) -> u8 {
        match self {
            VideoPhase::Validate => 0,
            VideoPhase::Download => 5,
            VideoPhase::Process => 60,
            VideoPhase::Upload => 80,
            VideoPhase::Finalize => 95,
            VideoPhase::Cleanup => 98,
        }
    }
}

/// Where the download phase should fetch from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoSource {
    /// A media file URL, fetched by any strategy.
    Direct { url: Url, declared: Option<u64> },
    /// A platform page only the page-capable fetcher can handle.
    Page { url: Url },
}

impl VideoSource {
    pub fn url(&self) -> &Url {
        match self {
            VideoSource::Direct { url, .. } | VideoSource::Page { url } => url,
        }
    }
}

/// Final location of a job's hosted video.
pub fn asset_key(job_id: &str) -> String {
    format!("assets/videos/{job_id}.mp4")
}

/// Turns a job's source URL into something the download chain can fetch.
pub struct SourceResolver {
    registry: Arc<ExtractorRegistry>,
    download: DownloadConfig,
}

impl SourceResolver {
    pub fn new(registry: Arc<ExtractorRegistry>, download: DownloadConfig) -> Self {
        Self { registry, download }
    }

    /// Resolve a page URL through the extractor registry.
    ///
    /// Content-state and rate-limit errors fail the job. Structural, timeout
    /// and server errors fall back to the page-capable fetcher, which may
    /// still succeed where the extractor's heuristics did not.
    pub async fn resolve(&self, source_url: &str) -> PipelineResult<VideoSource> {
        let page = Url::parse(source_url)
            .map_err(|e| PipelineError::invalid(format!("source url {source_url:?}: {e}")))?;
        let platform = Platform::detect(&page);

        let resolved = match self.registry.resolve(&page).await {
            Ok(resolved) => resolved,
            Err(e) if falls_back(&e) => {
                warn!(%platform, error = %e, "extractor failed, handing page to generic fetcher");
                return Ok(VideoSource::Page { url: page });
            }
            Err(e) => {
                return Err(PipelineError::Extraction {
                    platform: platform.to_string(),
                    source: e,
                });
            }
        };

        let Some(resolved) = resolved else {
            return Ok(VideoSource::Direct {
                url: page,
                declared: None,
            });
        };

        match resolved.extraction {
            Extraction::Direct {
                url,
                content_length,
                height,
            } => {
                let direct = Url::parse(&url).map_err(|e| PipelineError::Extraction {
                    platform: platform.to_string(),
                    source: ExtractorError::structure(format!("unusable media url: {e}")),
                })?;
                SizeLimit::for_url(&direct, &self.download).check_declared(content_length)?;
                info!(
                    extractor = resolved.extractor,
                    cached = resolved.cached,
                    ?height,
                    "resolved direct media url"
                );
                Ok(VideoSource::Direct {
                    url: direct,
                    declared: content_length,
                })
            }
            Extraction::Delegate { reason } => {
                info!(extractor = resolved.extractor, reason, "delegating page to generic fetcher");
                Ok(VideoSource::Page { url: page })
            }
        }
    }

    /// Build the chain request for `source`, reporting transfer progress in
    /// the `[start, end]` band of `phase`.
    pub fn request(
        &self,
        source: &VideoSource,
        max_height: Option<u32>,
        progress: &ProgressReporter,
        phase: &'static str,
        (start, end): (u8, u8),
    ) -> FetchRequest {
        let reporter = progress.clone();
        let request = FetchRequest::new(
            source.url().clone(),
            SizeLimit::for_url(source.url(), &self.download),
        )
        .with_max_height(max_height)
        .with_progress(Arc::new(move |snapshot| {
            reporter.transfer(phase, start, end, &snapshot);
        }));
        match source {
            VideoSource::Page { .. } => request.page(),
            VideoSource::Direct { .. } => request,
        }
    }
}

pub struct VideoPipeline {
    resolver: SourceResolver,
    chain: Arc<DownloadChain>,
    toolkit: Arc<dyn MediaToolkit>,
    catalog: Arc<dyn AssetCatalog>,
}

impl VideoPipeline {
    pub fn new(
        resolver: SourceResolver,
        chain: Arc<DownloadChain>,
        toolkit: Arc<dyn MediaToolkit>,
        catalog: Arc<dyn AssetCatalog>,
    ) -> Self {
        Self {
            resolver,
            chain,
            toolkit,
            catalog,
        }
    }

    async fn download(
        &self,
        ctx: &JobContext,
        meta: &VideoDownloadMetadata,
        source: &VideoSource,
    ) -> PipelineResult<PathBuf> {
        let dest = ctx.work_dir.join(RAW_FILE);
        let request = self.resolver.request(
            source,
            meta.quality.max_height(),
            &ctx.progress,
            "download",
            (
                VideoPhase::Download.start_percent(),
                VideoPhase::Process.start_percent(),
            ),
        );
        let outcome = self.chain.download(&request, &dest).await?;
        info!(
            job_id = ctx.job_id(),
            strategy = outcome.strategy,
            bytes = outcome.bytes,
            trusted = request.limit.trusted,
            "download finished"
        );
        Ok(dest)
    }

    async fn upload(&self, ctx: &JobContext, input: &Path) -> PipelineResult<u64> {
        let total = file_size(input).await?;
        let meter = Mutex::new(TransferMeter::new(total));
        let reporter = ctx.progress.clone();
        let (start, end) = (
            VideoPhase::Upload.start_percent(),
            VideoPhase::Finalize.start_percent(),
        );
        let on_progress = |sent: u64| {
            let mut meter = meter.lock();
            meter.set_transferred(sent);
            if meter.should_emit() {
                reporter.transfer("upload", start, end, &meter.snapshot());
            }
        };
        let key = asset_key(ctx.job_id());
        let bytes = ctx.store.put_file(&key, input, &on_progress).await?;
        info!(job_id = ctx.job_id(), key, bytes, "uploaded video asset");
        Ok(bytes)
    }

    async fn finalize(
        &self,
        ctx: &JobContext,
        meta: &VideoDownloadMetadata,
        input: &Path,
    ) -> PipelineResult<()> {
        let probe = self.toolkit.probe(input).await?;
        let size = file_size(input).await?.unwrap_or(0);
        let asset = MediaAssetDbModel {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: ctx.job_id().to_string(),
            source_url: meta.source_url.clone(),
            storage_key: asset_key(ctx.job_id()),
            content_type: VIDEO_CONTENT_TYPE.to_string(),
            size_bytes: i64::try_from(size).unwrap_or(i64::MAX),
            width: probe.width.map(i64::from),
            height: probe.height.map(i64::from),
            duration_ms: probe.duration_ms.and_then(|d| i64::try_from(d).ok()),
            video_codec: probe.video_codec,
            created_at: ctx.queue.now_ms(),
        };
        self.catalog.record_media_asset(&asset).await?;
        Ok(())
    }

    async fn execute(&self, ctx: &JobContext, meta: &VideoDownloadMetadata) -> PipelineResult<()> {
        tokio::fs::create_dir_all(&ctx.work_dir).await?;
        let mut tracker = PhaseTracker::<VideoPhase>::load(ctx).await?;
        let mut source = None;

        if !tracker.should_skip(VideoPhase::Validate) {
            tracker.begin(VideoPhase::Validate, "resolving source").await?;
            source = Some(self.resolver.resolve(&meta.source_url).await?);
            tracker.complete(VideoPhase::Validate, None).await?;
        }

        if !tracker.should_skip(VideoPhase::Download) {
            tracker.begin(VideoPhase::Download, "downloading").await?;
            // Validate ran in an earlier attempt; the cached extraction makes
            // this cheap.
            let source = match source.take() {
                Some(s) => s,
                None => self.resolver.resolve(&meta.source_url).await?,
            };
            let raw = self.download(ctx, meta, &source).await?;
            tracker.complete(VideoPhase::Download, Some(&raw)).await?;
        }

        if !tracker.should_skip(VideoPhase::Process) {
            tracker.begin(VideoPhase::Process, "checking codecs").await?;
            let raw = tracker.artifact_path(VideoPhase::Download).await?;
            let max_height = meta.quality.max_height();
            let probe = self.toolkit.probe(&raw).await?;
            if probe.needs_transcode(max_height) {
                info!(
                    job_id = ctx.job_id(),
                    codec = ?probe.video_codec,
                    height = ?probe.height,
                    "transcoding for browser playback"
                );
                let processed = ctx.work_dir.join(PROCESSED_FILE);
                self.toolkit
                    .transcode_for_web(&raw, &processed, max_height)
                    .await?;
                tracker.complete(VideoPhase::Process, Some(&processed)).await?;
            } else {
                tracker
                    .complete_reusing(VideoPhase::Process, VideoPhase::Download)
                    .await?;
            }
        }

        if !tracker.should_skip(VideoPhase::Upload) {
            tracker.begin(VideoPhase::Upload, "uploading").await?;
            let processed = tracker.artifact_path(VideoPhase::Process).await?;
            self.upload(ctx, &processed).await?;
            tracker.complete(VideoPhase::Upload, None).await?;
        }

        if !tracker.should_skip(VideoPhase::Finalize) {
            tracker.begin(VideoPhase::Finalize, "recording asset").await?;
            let processed = tracker.artifact_path(VideoPhase::Process).await?;
            self.finalize(ctx, meta, &processed).await?;
            tracker.complete(VideoPhase::Finalize, None).await?;
        }

        tracker.begin(VideoPhase::Cleanup, "cleaning up").await?;
        purge_job_artifacts(ctx.store.as_ref(), &ctx.work_dir, ctx.job_id()).await?;
        Ok(())
    }
}

fn falls_back(e: &ExtractorError) -> bool {
    !matches!(e, ExtractorError::RateLimited { .. })
        && matches!(
            e.kind(),
            ExtractorErrorKind::StructureChanged
                | ExtractorErrorKind::Timeout
                | ExtractorErrorKind::ServerError
        )
}

#[async_trait]
impl Pipeline for VideoPipeline {
    fn name(&self) -> &'static str {
        "video_download"
    }

    async fn run(&self, ctx: &JobContext) -> Result<PipelineOutcome, ClassifiedFailure> {
        let JobMetadata::VideoDownload(meta) = &ctx.job.metadata else {
            return conclude(
                Err(PipelineError::invalid("not a video download job")),
                None,
            );
        };
        conclude(self.execute(ctx, meta).await, Some(&meta.source_url))
    }
}
