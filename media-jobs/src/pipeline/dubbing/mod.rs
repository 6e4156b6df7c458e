//! AI dubbing: source video in, translated voice track out.
//!
//! Each phase leaves a file in the job's scratch directory and checkpoints
//! it. Transcript and translation are stored as JSON [`Transcript`]s, audio
//! as WAV until the final encode.

pub mod diarize;
pub mod voices;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use diarize::{Diarizer, GapDiarizer};

use super::services::{SpeechEngine, Transcriber, Transcript, Translator};
use super::tools::{MediaToolkit, TimedClip};
use super::video::SourceResolver;
use super::{
    JobContext, PhaseTracker, Pipeline, PipelineError, PipelineOutcome, PipelineResult, conclude,
    purge_job_artifacts,
};
use crate::database::models::DubTrackDbModel;
use crate::database::repositories::AssetCatalog;
use crate::domain::{
    ClassifiedFailure, DubbingMetadata, JobMetadata, Phase, SpeakerMode, VoiceQuality,
};
use crate::download::DownloadChain;
use crate::queue::{TransferMeter, scale_percent};
use crate::utils::fs::file_size;

const SOURCE_VIDEO: &str = "source_video";
const SOURCE_AUDIO: &str = "source_audio.wav";
const TRANSCRIPT: &str = "transcript.json";
const TRANSLATION: &str = "translation.json";
const SPEECH: &str = "speech.wav";
const MIXED: &str = "mixed.wav";
const CLIPS_DIR: &str = "clips";

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
pub enum DubbingPhase {
    Download,
    Transcribe,
    Translate,
    Synthesize,
    Mix,
    Upload,
    Cleanup,
}

impl Phase for DubbingPhase {
    const ORDER: &'static [Self] = &[
        DubbingPhase::Download,
        DubbingPhase::Transcribe,
        DubbingPhase::Translate,
        DubbingPhase::Synthesize,
        DubbingPhase::Mix,
        DubbingPhase::Upload,
        DubbingPhase::Cleanup,
    ];

    fn produces_artifact(self) -> bool {
        !matches!(self, DubbingPhase::Upload | DubbingPhase::Cleanup)
    }

    fn start_percent(self) -> u8 {
        match self {
            DubbingPhase::Download => 0,
            DubbingPhase::Transcribe => 15,
            DubbingPhase::Translate => 35,
            DubbingPhase::Synthesize => 45,
            DubbingPhase::Mix => 80,
            DubbingPhase::Upload => 90,
            DubbingPhase::Cleanup => 98,
        }
    }
}

fn band(phase: DubbingPhase) -> (u8, u8) {
    let next = DubbingPhase::ORDER
        .get(phase.position() + 1)
        .map_or(99, |p| p.start_percent());
    (phase.start_percent(), next)
}

/// Where a movie's dub track is hosted.
pub fn dub_key(meta: &DubbingMetadata) -> String {
    format!(
        "assets/dubs/{}/{}.{}",
        meta.movie_id,
        meta.target_language,
        meta.output_format.extension()
    )
}

/// The collaborators that turn audio into translated speech.
pub struct DubbingServices {
    pub transcriber: Arc<dyn Transcriber>,
    pub translator: Arc<dyn Translator>,
    pub diarizer: Arc<dyn Diarizer>,
    pub baseline_voice: Arc<dyn SpeechEngine>,
    /// Present only when a premium endpoint is configured.
    pub premium_voice: Option<Arc<dyn SpeechEngine>>,
}

pub struct DubbingPipeline {
    services: DubbingServices,
    resolver: SourceResolver,
    chain: Arc<DownloadChain>,
    toolkit: Arc<dyn MediaToolkit>,
    catalog: Arc<dyn AssetCatalog>,
}

async fn read_transcript(path: &Path) -> PipelineResult<Transcript> {
    let raw = tokio::fs::read(path).await?;
    serde_json::from_slice(&raw)
        .map_err(|e| PipelineError::invalid(format!("unreadable {}: {e}", path.display())))
}

async fn write_transcript(path: &Path, transcript: &Transcript) -> PipelineResult<()> {
    let raw = serde_json::to_vec_pretty(transcript).map_err(crate::Error::from)?;
    tokio::fs::write(path, raw).await?;
    Ok(())
}

impl DubbingPipeline {
    pub fn new(
        services: DubbingServices,
        resolver: SourceResolver,
        chain: Arc<DownloadChain>,
        toolkit: Arc<dyn MediaToolkit>,
        catalog: Arc<dyn AssetCatalog>,
    ) -> Self {
        Self {
            services,
            resolver,
            chain,
            toolkit,
            catalog,
        }
    }

    /// Premium only when both requested and configured.
    fn speech_engine(&self, meta: &DubbingMetadata) -> &Arc<dyn SpeechEngine> {
        match (meta.voice_quality, &self.services.premium_voice) {
            (VoiceQuality::Premium, Some(premium)) => premium,
            (VoiceQuality::Premium, None) => {
                warn!(
                    movie_id = meta.movie_id,
                    "premium voice requested but not configured, using baseline engine"
                );
                &self.services.baseline_voice
            }
            (VoiceQuality::Standard, _) => &self.services.baseline_voice,
        }
    }

    /// Fetch the source video: a remote URL through the download chain, or
    /// the catalog's hosted copy of the movie.
    async fn fetch_source(&self, ctx: &JobContext, meta: &DubbingMetadata) -> PipelineResult<PathBuf> {
        let dest = ctx.work_dir.join(SOURCE_VIDEO);
        match &meta.source_url {
            Some(url) => {
                let source = self.resolver.resolve(url).await?;
                let request = self.resolver.request(
                    &source,
                    None,
                    &ctx.progress,
                    "download",
                    band(DubbingPhase::Download),
                );
                let outcome = self.chain.download(&request, &dest).await?;
                info!(
                    job_id = ctx.job_id(),
                    strategy = outcome.strategy,
                    bytes = outcome.bytes,
                    "source downloaded"
                );
            }
            None => {
                let asset = self
                    .catalog
                    .find_media_asset(&meta.movie_id)
                    .await?
                    .ok_or_else(|| {
                        PipelineError::invalid(format!("movie {} has no hosted video", meta.movie_id))
                    })?;
                if !ctx.store.get_to_file(&asset.storage_key, &dest).await? {
                    return Err(PipelineError::invalid(format!(
                        "hosted video {} is missing from storage",
                        asset.storage_key
                    )));
                }
            }
        }
        Ok(dest)
    }

    async fn download(&self, ctx: &JobContext, meta: &DubbingMetadata) -> PipelineResult<PathBuf> {
        let video = self.fetch_source(ctx, meta).await?;
        let audio = ctx.work_dir.join(SOURCE_AUDIO);
        self.toolkit.extract_audio(&video, &audio).await?;
        // Only the audio track is checkpointed.
        crate::utils::fs::remove_file_if_exists(&video).await?;
        Ok(audio)
    }

    async fn transcribe(
        &self,
        ctx: &JobContext,
        meta: &DubbingMetadata,
        audio: &Path,
    ) -> PipelineResult<PathBuf> {
        let transcript = self
            .services
            .transcriber
            .transcribe(audio, &meta.source_language)
            .await?;
        if transcript.segments.is_empty() {
            return Err(PipelineError::invalid("no speech found in the source audio"));
        }
        info!(
            job_id = ctx.job_id(),
            segments = transcript.segments.len(),
            language = transcript.language,
            "transcribed"
        );
        let path = ctx.work_dir.join(TRANSCRIPT);
        write_transcript(&path, &transcript).await?;
        Ok(path)
    }

    async fn translate(
        &self,
        ctx: &JobContext,
        meta: &DubbingMetadata,
        transcript_path: &Path,
        audio: &Path,
    ) -> PipelineResult<PathBuf> {
        let mut transcript = read_transcript(transcript_path).await?;
        if meta.speaker_mode == SpeakerMode::Smart {
            self.services
                .diarizer
                .diarize(audio, &mut transcript.segments)
                .await?;
            voices::tag_genders(meta, &mut transcript.segments);
        }

        let texts: Vec<String> = transcript.segments.iter().map(|s| s.text.clone()).collect();
        let translated = self
            .services
            .translator
            .translate(&texts, &transcript.language, &meta.target_language)
            .await?;
        if translated.len() != transcript.segments.len() {
            return Err(PipelineError::service(
                "translate",
                None,
                "translation count does not match segment count",
            ));
        }
        for (segment, text) in transcript.segments.iter_mut().zip(translated) {
            segment.text = text;
        }
        transcript.language = meta.target_language.clone();

        let path = ctx.work_dir.join(TRANSLATION);
        write_transcript(&path, &transcript).await?;
        Ok(path)
    }

    async fn synthesize(
        &self,
        ctx: &JobContext,
        meta: &DubbingMetadata,
        translation_path: &Path,
        audio: &Path,
    ) -> PipelineResult<PathBuf> {
        let translation = read_transcript(translation_path).await?;
        let voices = voices::assign_voices(meta, &translation.segments);
        let engine = self.speech_engine(meta);
        let clips_dir = ctx.work_dir.join(CLIPS_DIR);
        tokio::fs::create_dir_all(&clips_dir).await?;

        let (start, end) = band(DubbingPhase::Synthesize);
        let total = translation.segments.len();
        let mut clips = Vec::with_capacity(total);
        for (i, (segment, voice)) in translation.segments.iter().zip(&voices).enumerate() {
            let clip = clips_dir.join(format!("{i:05}.wav"));
            // Clips from an interrupted attempt are reused.
            if file_size(&clip).await?.is_none_or(|len| len == 0) {
                engine
                    .synthesize(&segment.text, voice, &meta.target_language, &clip)
                    .await?;
            }
            clips.push(TimedClip {
                path: clip,
                start_ms: segment.start_ms,
            });
            ctx.progress.phase(
                "synthesize",
                scale_percent(start, end, (i + 1) as f64 / total as f64),
                format!("synthesized {} of {total} segments", i + 1),
            );
        }

        let source_ms = self.toolkit.probe(audio).await?.duration_ms.unwrap_or(0);
        let total_ms = source_ms.max(translation.end_ms());
        let speech = ctx.work_dir.join(SPEECH);
        self.toolkit
            .assemble_speech(&clips, total_ms, &speech)
            .await?;
        crate::utils::fs::remove_dir_if_exists(&clips_dir).await?;
        Ok(speech)
    }

    async fn mix(
        &self,
        ctx: &JobContext,
        meta: &DubbingMetadata,
        speech: &Path,
        background: Option<&Path>,
    ) -> PipelineResult<PathBuf> {
        let mixed = ctx.work_dir.join(MIXED);
        if !meta.keep_background {
            info!(job_id = ctx.job_id(), "replacing original audio entirely");
        }
        self.toolkit.mix(speech, background, &mixed).await?;
        Ok(mixed)
    }

    async fn upload(
        &self,
        ctx: &JobContext,
        meta: &DubbingMetadata,
        mixed: &Path,
    ) -> PipelineResult<()> {
        let encoded = ctx
            .work_dir
            .join(format!("dub.{}", meta.output_format.extension()));
        self.toolkit
            .encode_audio(mixed, &encoded, meta.output_format)
            .await?;

        let meter = Mutex::new(TransferMeter::new(file_size(&encoded).await?));
        let reporter = ctx.progress.clone();
        let (start, end) = band(DubbingPhase::Upload);
        let on_progress = |sent: u64| {
            let mut meter = meter.lock();
            meter.set_transferred(sent);
            if meter.should_emit() {
                reporter.transfer("upload", start, end, &meter.snapshot());
            }
        };
        let key = dub_key(meta);
        ctx.store.put_file(&key, &encoded, &on_progress).await?;

        let duration_ms = self.toolkit.probe(&encoded).await?.duration_ms;
        let track = DubTrackDbModel {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: ctx.job_id().to_string(),
            movie_id: meta.movie_id.clone(),
            language: meta.target_language.clone(),
            storage_key: key.clone(),
            format: meta.output_format.to_string(),
            duration_ms: duration_ms.and_then(|d| i64::try_from(d).ok()),
            voice_model: self.speech_engine(meta).model_id(),
            created_at: ctx.queue.now_ms(),
        };
        self.catalog.record_dub_track(&track).await?;
        info!(job_id = ctx.job_id(), key, voice_model = track.voice_model, "dub track stored");
        Ok(())
    }

    async fn execute(&self, ctx: &JobContext, meta: &DubbingMetadata) -> PipelineResult<()> {
        tokio::fs::create_dir_all(&ctx.work_dir).await?;
        let mut tracker = PhaseTracker::<DubbingPhase>::load(ctx).await?;
        if !tracker.checkpoint().is_empty() {
            let restored = tracker.restore_all().await?;
            if !restored.is_empty() {
                info!(job_id = ctx.job_id(), ?restored, "restored checkpoint artifacts");
            }
        }

        if !tracker.should_skip(DubbingPhase::Download) {
            tracker.begin(DubbingPhase::Download, "fetching source audio").await?;
            let audio = self.download(ctx, meta).await?;
            tracker.complete(DubbingPhase::Download, Some(&audio)).await?;
        }

        if !tracker.should_skip(DubbingPhase::Transcribe) {
            tracker.begin(DubbingPhase::Transcribe, "transcribing").await?;
            let audio = tracker.artifact_path(DubbingPhase::Download).await?;
            let transcript = self.transcribe(ctx, meta, &audio).await?;
            tracker.complete(DubbingPhase::Transcribe, Some(&transcript)).await?;
        }

        if !tracker.should_skip(DubbingPhase::Translate) {
            let message = if meta.speaker_mode == SpeakerMode::Smart {
                "identifying speakers and translating"
            } else {
                "translating"
            };
            tracker.begin(DubbingPhase::Translate, message).await?;
            let transcript = tracker.artifact_path(DubbingPhase::Transcribe).await?;
            let audio = tracker.artifact_path(DubbingPhase::Download).await?;
            let translation = self.translate(ctx, meta, &transcript, &audio).await?;
            tracker.complete(DubbingPhase::Translate, Some(&translation)).await?;
        }

        if !tracker.should_skip(DubbingPhase::Synthesize) {
            tracker.begin(DubbingPhase::Synthesize, "synthesizing speech").await?;
            let translation = tracker.artifact_path(DubbingPhase::Translate).await?;
            let audio = tracker.artifact_path(DubbingPhase::Download).await?;
            let speech = self.synthesize(ctx, meta, &translation, &audio).await?;
            tracker.complete(DubbingPhase::Synthesize, Some(&speech)).await?;
        }

        if !tracker.should_skip(DubbingPhase::Mix) {
            tracker.begin(DubbingPhase::Mix, "mixing").await?;
            let speech = tracker.artifact_path(DubbingPhase::Synthesize).await?;
            let background = if meta.keep_background {
                Some(tracker.artifact_path(DubbingPhase::Download).await?)
            } else {
                None
            };
            let mixed = self
                .mix(ctx, meta, &speech, background.as_deref())
                .await?;
            tracker.complete(DubbingPhase::Mix, Some(&mixed)).await?;
        }

        if !tracker.should_skip(DubbingPhase::Upload) {
            tracker.begin(DubbingPhase::Upload, "uploading dub track").await?;
            let mixed = tracker.artifact_path(DubbingPhase::Mix).await?;
            self.upload(ctx, meta, &mixed).await?;
            tracker.complete(DubbingPhase::Upload, None).await?;
        }

        tracker.begin(DubbingPhase::Cleanup, "cleaning up").await?;
        purge_job_artifacts(ctx.store.as_ref(), &ctx.work_dir, ctx.job_id()).await?;
        Ok(())
    }
}

#[async_trait]
impl Pipeline for DubbingPipeline {
    fn name(&self) -> &'static str {
        "ai_dubbing"
    }

    async fn run(&self, ctx: &JobContext) -> Result<PipelineOutcome, ClassifiedFailure> {
        let JobMetadata::AiDubbing(meta) = &ctx.job.metadata else {
            return conclude(Err(PipelineError::invalid("not a dubbing job")), None);
        };
        conclude(self.execute(ctx, meta).await, meta.source_url.as_deref())
    }
}
