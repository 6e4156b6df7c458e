//! Job domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kinds of work the engine knows how to run.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    VideoDownload,
    AiDubbing,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VideoDownload => "VIDEO_DOWNLOAD",
            Self::AiDubbing => "AI_DUBBING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

/// Job status values.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Queued and waiting for a worker.
    Pending,
    /// Claimed by a worker and running.
    Processing,
    Completed,
    /// Failed; eligible again after `retry_after` while retries remain.
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Quality {
    #[default]
    Best,
    #[serde(rename = "720p")]
    #[strum(serialize = "720p")]
    P720,
    #[serde(rename = "480p")]
    #[strum(serialize = "480p")]
    P480,
}

impl Quality {
    /// Maximum output height, `None` for best available.
    pub fn max_height(self) -> Option<u32> {
        match self {
            Quality::Best => None,
            Quality::P720 => Some(720),
            Quality::P480 => Some(480),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoDownloadMetadata {
    pub source_url: String,
    #[serde(default)]
    pub quality: Quality,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum VoiceGender {
    Male,
    #[default]
    Female,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SpeakerMode {
    #[default]
    Single,
    Alternating,
    Multi,
    Smart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Aac,
    Mp3,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Aac => "m4a",
            OutputFormat::Mp3 => "mp3",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Aac => "audio/mp4",
            OutputFormat::Mp3 => "audio/mpeg",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum VoiceQuality {
    #[default]
    Standard,
    Premium,
}

/// One configured voice for multi-speaker dubbing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakerSpec {
    #[serde(default)]
    pub name: Option<String>,
    pub gender: VoiceGender,
    #[serde(default)]
    pub voice: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DubbingMetadata {
    pub movie_id: String,
    pub target_language: String,
    #[serde(default = "default_source_language")]
    pub source_language: String,
    #[serde(default)]
    pub voice_gender: VoiceGender,
    #[serde(default)]
    pub speaker_mode: SpeakerMode,
    #[serde(default)]
    pub speakers: Vec<SpeakerSpec>,
    #[serde(default = "default_true")]
    pub keep_background: bool,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub voice_quality: VoiceQuality,
    /// Remote source to fetch instead of the catalog's stored asset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

fn default_source_language() -> String {
    "auto".to_string()
}

fn default_true() -> bool {
    true
}

/// Type-specific job payload, one variant per [`JobType`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobMetadata {
    VideoDownload(VideoDownloadMetadata),
    AiDubbing(DubbingMetadata),
}

impl JobMetadata {
    pub fn job_type(&self) -> JobType {
        match self {
            JobMetadata::VideoDownload(_) => JobType::VideoDownload,
            JobMetadata::AiDubbing(_) => JobType::AiDubbing,
        }
    }

    /// URL a failure should be attributed to, for platform advisories.
    pub fn source_url(&self) -> Option<&str> {
        match self {
            JobMetadata::VideoDownload(m) => Some(&m.source_url),
            JobMetadata::AiDubbing(m) => m.source_url.as_deref(),
        }
    }
}

/// Read model of `progress_detail`.
///
/// `checkpoint` stays opaque here; each pipeline decodes it into its own
/// typed checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Seconds remaining for the current transfer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<u64>,
    /// Bytes per second for the current transfer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Options accepted when creating a job.
#[derive(Debug, Clone, Default)]
pub struct CreateJobOptions {
    pub priority: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub run_at: Option<DateTime<Utc>>,
    pub max_retries: Option<u32>,
    pub target_id: Option<String>,
}

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A job as seen by the queue and the worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    pub target_id: Option<String>,
    pub status: JobStatus,
    pub priority: i32,
    pub metadata: JobMetadata,
    pub progress: u8,
    pub progress_detail: ProgressDetail,
    pub retry_count: u32,
    pub max_retries: u32,
    pub scheduled_at: DateTime<Utc>,
    pub run_at: DateTime<Utc>,
    pub retry_after: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// True once no automatic retry will pick the job up again.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            JobStatus::Completed | JobStatus::Cancelled => true,
            JobStatus::Failed => self.retry_count >= self.max_retries,
            JobStatus::Pending | JobStatus::Processing => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_is_tagged_by_type() {
        let meta = JobMetadata::VideoDownload(VideoDownloadMetadata {
            source_url: "https://vimeo.com/1".into(),
            quality: Quality::P720,
        });
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(
            value,
            json!({"type": "VIDEO_DOWNLOAD", "data": {"sourceUrl": "https://vimeo.com/1", "quality": "720p"}})
        );
        assert_eq!(meta.job_type(), JobType::VideoDownload);
    }

    #[test]
    fn dubbing_metadata_defaults() {
        let meta: DubbingMetadata =
            serde_json::from_value(json!({"movieId": "m1", "targetLanguage": "es"})).unwrap();
        assert_eq!(meta.source_language, "auto");
        assert!(meta.keep_background);
        assert_eq!(meta.speaker_mode, SpeakerMode::Single);
        assert_eq!(meta.output_format, OutputFormat::Aac);
    }

    #[test]
    fn progress_detail_keeps_unknown_keys() {
        let detail: ProgressDetail =
            serde_json::from_value(json!({"phase": "download", "custom": 1})).unwrap();
        assert_eq!(detail.phase.as_deref(), Some("download"));
        assert_eq!(detail.extra.get("custom"), Some(&json!(1)));
    }

    #[test]
    fn status_strings() {
        assert_eq!(JobStatus::Cancelled.as_str(), "CANCELLED");
        assert_eq!(JobStatus::parse("PROCESSING"), Some(JobStatus::Processing));
        assert_eq!(JobType::parse("AI_DUBBING"), Some(JobType::AiDubbing));
        assert_eq!(JobType::AiDubbing.to_string(), "AI_DUBBING");
    }
}
