//! Command-line interface: the worker process and queue administration.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use platforms_parser::default_registry;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::database::repositories::{AssetCatalog, SqlxAssetCatalog, SqlxJobRepository};
use crate::database::time::SystemClock;
use crate::database::{DbPool, init_pool, run_migrations};
use crate::domain::{
    CreateJobOptions, DubbingMetadata, Job, JobMetadata, JobStatus, OutputFormat, Quality,
    SpeakerMode, SpeakerSpec, VideoDownloadMetadata, VoiceGender, VoiceQuality,
};
use crate::download::DownloadChain;
use crate::pipeline::{Pipeline, purge_job_artifacts};
use crate::pipeline::dubbing::diarize::GapDiarizer;
use crate::pipeline::dubbing::{DubbingPipeline, DubbingServices};
use crate::pipeline::services::{
    EspeakEngine, HttpSpeechEngine, HttpTranslator, SpeechEngine, Translator,
    UnconfiguredTranslator, WhisperCliTranscriber,
};
use crate::pipeline::tools::{FfmpegToolkit, MediaToolkit};
use crate::pipeline::video::{SourceResolver, VideoPipeline};
use crate::queue::JobQueue;
use crate::storage::{BlobStore, ObjectBlobStore};
use crate::utils::fs::job_work_dir;
use crate::utils::http_client::{build_api_client, build_download_client};
use crate::worker::{Pipelines, Worker};
use crate::{Error, Result};

#[derive(Parser, Debug)]
#[command(author, version, about = "Durable background jobs for media pipelines", long_about = None)]
pub struct Cli {
    /// Output format for command results
    #[arg(long, value_enum, default_value_t = Format::Text, global = true)]
    pub format: Format,
    /// Tracing filter directive, overriding RUST_LOG
    #[arg(long, global = true)]
    pub log_filter: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Format {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a worker until interrupted
    Worker,
    /// Queue a video download
    EnqueueVideo(EnqueueVideoArgs),
    /// Queue a dubbing job for a stored movie
    EnqueueDub(EnqueueDubArgs),
    /// Show one job, or list jobs
    Status(StatusArgs),
    /// Reset a failed or cancelled job for another run
    Retry { id: String },
    /// Cancel a pending or running job
    Cancel { id: String },
    /// Job counts per status
    Stats,
    /// Delete every job in a status
    Purge {
        #[arg(long, value_parser = parse_status)]
        status: JobStatus,
    },
    /// Cancel every pending job
    CancelPending,
    /// Release jobs left processing by a crashed worker
    ReleaseStuck {
        /// Reset every processing job, whoever holds it
        #[arg(long)]
        force: bool,
    },
    /// Fail jobs processing for longer than the given runtime
    TimeoutStuck {
        #[arg(long, default_value_t = 120)]
        minutes: u64,
    },
}

#[derive(Args, Debug, Default)]
pub struct JobOptionArgs {
    /// Higher runs first
    #[arg(long, default_value_t = 0)]
    pub priority: i32,
    #[arg(long)]
    pub max_retries: Option<u32>,
    /// Earliest start, in seconds from now
    #[arg(long)]
    pub delay_secs: Option<u64>,
    /// Entity this job produces output for
    #[arg(long)]
    pub target_id: Option<String>,
}

impl JobOptionArgs {
    fn to_options(&self) -> CreateJobOptions {
        CreateJobOptions {
            priority: self.priority,
            run_at: self
                .delay_secs
                .and_then(|s| chrono::Duration::try_seconds(s as i64))
                .map(|d| Utc::now() + d),
            max_retries: self.max_retries,
            target_id: self.target_id.clone(),
            ..Default::default()
        }
    }
}

#[derive(Args, Debug)]
pub struct EnqueueVideoArgs {
    pub url: String,
    /// best, 720p or 480p
    #[arg(long, value_parser = parse_serde::<Quality>, default_value = "best")]
    pub quality: Quality,
    #[command(flatten)]
    pub options: JobOptionArgs,
}

#[derive(Args, Debug)]
pub struct EnqueueDubArgs {
    pub movie_id: String,
    #[arg(long)]
    pub target_language: String,
    #[arg(long, default_value = "auto")]
    pub source_language: String,
    #[arg(long, value_parser = parse_serde::<VoiceGender>, default_value = "female")]
    pub voice_gender: VoiceGender,
    /// single, alternating, multi or smart
    #[arg(long, value_parser = parse_serde::<SpeakerMode>, default_value = "single")]
    pub speaker_mode: SpeakerMode,
    /// GENDER[:VOICE[:NAME]], repeatable, in speaking order
    #[arg(long = "speaker", value_parser = parse_speaker)]
    pub speakers: Vec<SpeakerSpec>,
    /// Replace the original audio instead of mixing over it
    #[arg(long)]
    pub drop_background: bool,
    #[arg(long, value_parser = parse_serde::<OutputFormat>, default_value = "aac")]
    pub output_format: OutputFormat,
    #[arg(long)]
    pub premium: bool,
    /// Fetch this URL instead of the stored asset
    #[arg(long)]
    pub source_url: Option<String>,
    #[command(flatten)]
    pub options: JobOptionArgs,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    pub id: Option<String>,
    #[arg(long, value_parser = parse_status)]
    pub status: Option<JobStatus>,
    #[arg(long, default_value_t = 20)]
    pub limit: i64,
}

fn parse_serde<T: DeserializeOwned>(raw: &str) -> std::result::Result<T, String> {
    serde_json::from_value(serde_json::Value::String(raw.to_ascii_lowercase()))
        .map_err(|e| e.to_string())
}

fn parse_status(raw: &str) -> std::result::Result<JobStatus, String> {
    raw.to_ascii_uppercase()
        .parse()
        .map_err(|_| format!("unknown status {raw}"))
}

fn parse_speaker(raw: &str) -> std::result::Result<SpeakerSpec, String> {
    let mut parts = raw.splitn(3, ':');
    let gender = parse_serde::<VoiceGender>(parts.next().unwrap_or_default())?;
    let non_empty = |p: Option<&str>| p.filter(|s| !s.is_empty()).map(str::to_string);
    let voice = non_empty(parts.next());
    let name = non_empty(parts.next());
    Ok(SpeakerSpec {
        name,
        gender,
        voice,
    })
}

impl EnqueueDubArgs {
    fn to_metadata(&self) -> JobMetadata {
        JobMetadata::AiDubbing(DubbingMetadata {
            movie_id: self.movie_id.clone(),
            target_language: self.target_language.clone(),
            source_language: self.source_language.clone(),
            voice_gender: self.voice_gender,
            speaker_mode: self.speaker_mode,
            speakers: self.speakers.clone(),
            keep_background: !self.drop_background,
            output_format: self.output_format,
            voice_quality: if self.premium {
                VoiceQuality::Premium
            } else {
                VoiceQuality::Standard
            },
            source_url: self.source_url.clone(),
        })
    }
}

async fn open_database(config: &AppConfig) -> Result<DbPool> {
    let pool = init_pool(&config.queue.database_url).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

fn open_queue(config: &AppConfig, pool: &DbPool) -> Arc<JobQueue> {
    Arc::new(JobQueue::new(
        Arc::new(SqlxJobRepository::new(pool.clone())),
        Arc::new(SystemClock),
        config.queue.clone(),
    ))
}

/// Build both pipelines and their collaborators from configuration.
pub fn build_pipelines(config: &AppConfig, catalog: Arc<dyn AssetCatalog>) -> Result<Pipelines> {
    let download_client = build_download_client(&config.download)
        .map_err(|e| Error::config(format!("download client: {e}")))?;
    let api_client = build_api_client(&config.download)
        .map_err(|e| Error::config(format!("api client: {e}")))?;

    let registry = Arc::new(default_registry(api_client.clone(), config.extractor.cache_ttl));
    let chain = Arc::new(DownloadChain::standard(
        download_client,
        &config.download,
        &config.tools,
    ));
    let toolkit: Arc<dyn MediaToolkit> = Arc::new(FfmpegToolkit::new(&config.tools));

    let translator: Arc<dyn Translator> = match &config.dubbing.translate_url {
        Some(url) => Arc::new(HttpTranslator::new(
            api_client.clone(),
            url,
            config.dubbing.translate_api_key.clone(),
        )),
        None => {
            warn!("TRANSLATE_URL is not set, dubbing jobs will fail");
            Arc::new(UnconfiguredTranslator)
        }
    };
    let premium_voice = config.dubbing.premium_tts_url.as_ref().map(|url| {
        Arc::new(HttpSpeechEngine::new(
            api_client.clone(),
            url.clone(),
            config.dubbing.premium_tts_api_key.clone(),
        )) as Arc<dyn SpeechEngine>
    });
    let services = DubbingServices {
        transcriber: Arc::new(WhisperCliTranscriber::new(&config.tools)),
        translator,
        diarizer: Arc::new(GapDiarizer::default()),
        baseline_voice: Arc::new(EspeakEngine::new(
            config.tools.espeak.clone(),
            config.tools.tool_timeout,
        )),
        premium_voice,
    };

    let video: Arc<dyn Pipeline> = Arc::new(VideoPipeline::new(
        SourceResolver::new(registry.clone(), config.download.clone()),
        chain.clone(),
        toolkit.clone(),
        catalog.clone(),
    ));
    let dubbing: Arc<dyn Pipeline> = Arc::new(DubbingPipeline::new(
        services,
        SourceResolver::new(registry, config.download.clone()),
        chain,
        toolkit,
        catalog,
    ));
    Ok(Pipelines { video, dubbing })
}

async fn run_worker(config: &AppConfig, pool: &DbPool, queue: Arc<JobQueue>) -> Result<()> {
    let store: Arc<dyn BlobStore> = Arc::new(ObjectBlobStore::from_config(&config.storage).await?);
    let catalog: Arc<dyn AssetCatalog> = Arc::new(SqlxAssetCatalog::new(pool.clone()));
    let pipelines = build_pipelines(config, catalog)?;
    tokio::fs::create_dir_all(&config.worker.work_dir).await?;

    let worker = Worker::new(config.worker.clone(), queue, store, pipelines);
    worker.run_until_signal().await
}

/// Drop the artifacts of jobs an admin command just failed for good.
async fn purge_finished(config: &AppConfig, ids: &[String]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let store = ObjectBlobStore::from_config(&config.storage).await?;
    for id in ids {
        let work_dir = job_work_dir(&config.worker.work_dir, id);
        if let Err(e) = purge_job_artifacts(&store, &work_dir, id).await {
            warn!(job_id = %id, error = %e, "failed to purge job artifacts");
        }
    }
    Ok(())
}

fn render<T: Serialize>(value: &T, format: Format, text: impl FnOnce(&T) -> String) -> Result<()> {
    match format {
        Format::Text => println!("{}", text(value)),
        Format::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

fn job_line(job: &Job) -> String {
    let phase = job.progress_detail.phase.as_deref().unwrap_or("-");
    let mut line = format!(
        "{}  {:<16} {:<10} {:>3}%  {:<10} retries {}/{}",
        job.id,
        job.job_type.as_str(),
        job.status.as_str(),
        job.progress,
        phase,
        job.retry_count,
        job.max_retries
    );
    if let Some(error) = &job.error {
        line.push_str("  error: ");
        line.push_str(error);
    }
    line
}

/// Refuse a state change the queue ignored, naming the current status.
async fn ensure_transition(queue: &JobQueue, id: &str, done: bool, to: JobStatus) -> Result<()> {
    if done {
        return Ok(());
    }
    let job = queue.get_job(id).await?;
    Err(Error::InvalidStateTransition {
        from: job.status.to_string(),
        to: to.to_string(),
    })
}

pub async fn run(cli: Cli, config: AppConfig) -> Result<()> {
    let pool = open_database(&config).await?;
    let queue = open_queue(&config, &pool);
    let format = cli.format;

    match cli.command {
        Command::Worker => run_worker(&config, &pool, queue).await?,
        Command::EnqueueVideo(args) => {
            let metadata = JobMetadata::VideoDownload(VideoDownloadMetadata {
                source_url: args.url.clone(),
                quality: args.quality,
            });
            let job = queue.create_job(metadata, args.options.to_options()).await?;
            render(&job, format, |j| format!("queued {}", j.id))?;
        }
        Command::EnqueueDub(args) => {
            let job = queue
                .create_job(args.to_metadata(), args.options.to_options())
                .await?;
            render(&job, format, |j| format!("queued {}", j.id))?;
        }
        Command::Status(args) => match args.id {
            Some(id) => {
                let job = queue.get_job(&id).await?;
                render(&job, format, job_line)?;
            }
            None => {
                let jobs = queue.list_jobs(args.status, args.limit).await?;
                render(&jobs, format, |jobs| {
                    jobs.iter().map(job_line).collect::<Vec<_>>().join("\n")
                })?;
            }
        },
        Command::Retry { id } => {
            let done = queue.retry_job(&id).await?;
            ensure_transition(&queue, &id, done, JobStatus::Pending).await?;
            info!(job_id = %id, "job queued for retry");
        }
        Command::Cancel { id } => {
            let done = queue.cancel_job(&id).await?;
            ensure_transition(&queue, &id, done, JobStatus::Cancelled).await?;
        }
        Command::Stats => {
            let stats = queue.stats().await?;
            render(&stats, format, |s| {
                format!(
                    "pending {}  processing {}  completed {}  failed {}  cancelled {}  total {}",
                    s.pending,
                    s.processing,
                    s.completed,
                    s.failed,
                    s.cancelled,
                    s.total()
                )
            })?;
        }
        Command::Purge { status } => {
            let n = queue.delete_by_status(status).await?;
            render(&n, format, |n| format!("deleted {n} {status} jobs"))?;
        }
        Command::CancelPending => {
            let n = queue.cancel_all_pending().await?;
            render(&n, format, |n| format!("cancelled {n} pending jobs"))?;
        }
        Command::ReleaseStuck { force } => {
            if force {
                let n = queue.force_release_all().await?;
                render(&n, format, |n| format!("released {n} jobs"))?;
            } else {
                let report = queue.release_stuck_jobs(&config.worker.worker_id).await?;
                purge_finished(&config, &report.terminal).await?;
                render(
                    &(report.released, report.stale_failed),
                    format,
                    |(released, failed)| {
                        format!("released {released} jobs, failed {failed} with expired locks")
                    },
                )?;
            }
        }
        Command::TimeoutStuck { minutes } => {
            let ids = queue
                .timeout_long_running_jobs(Duration::from_secs(minutes * 60))
                .await?;
            purge_finished(&config, &ids).await?;
            render(&ids, format, |ids| format!("timed out {} jobs", ids.len()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_enqueue_dub_flags() {
        let cli = Cli::try_parse_from([
            "media-jobs",
            "enqueue-dub",
            "movie-7",
            "--target-language",
            "es",
            "--speaker-mode",
            "multi",
            "--speaker",
            "female:es+f2:Ann",
            "--speaker",
            "male",
            "--drop-background",
            "--output-format",
            "mp3",
        ])
        .unwrap();
        let Command::EnqueueDub(args) = cli.command else {
            panic!("wrong subcommand");
        };
        let JobMetadata::AiDubbing(meta) = args.to_metadata() else {
            panic!("wrong metadata");
        };
        assert_eq!(meta.speaker_mode, SpeakerMode::Multi);
        assert_eq!(meta.speakers.len(), 2);
        assert_eq!(meta.speakers[0].voice.as_deref(), Some("es+f2"));
        assert_eq!(meta.speakers[0].name.as_deref(), Some("Ann"));
        assert_eq!(meta.speakers[1].gender, VoiceGender::Male);
        assert!(!meta.keep_background);
        assert_eq!(meta.output_format, OutputFormat::Mp3);
        assert_eq!(meta.voice_quality, VoiceQuality::Standard);
    }

    #[test]
    fn parses_video_quality_and_status() {
        let cli = Cli::try_parse_from([
            "media-jobs",
            "--format",
            "json",
            "enqueue-video",
            "https://example.com/v.mp4",
            "--quality",
            "720p",
            "--priority",
            "5",
        ])
        .unwrap();
        let Command::EnqueueVideo(args) = cli.command else {
            panic!("wrong subcommand");
        };
        assert_eq!(args.quality, Quality::P720);
        assert_eq!(args.options.to_options().priority, 5);

        assert_eq!(parse_status("failed"), Ok(JobStatus::Failed));
        assert!(parse_status("bogus").is_err());
        assert!(Cli::try_parse_from(["media-jobs", "purge"]).is_err());
    }

    #[test]
    fn speaker_needs_a_known_gender() {
        assert!(parse_speaker("robot").is_err());
        let spec = parse_speaker("neutral::").unwrap();
        assert_eq!(spec.gender, VoiceGender::Neutral);
        assert!(spec.voice.is_none() && spec.name.is_none());
    }
}
