//! External services the dubbing pipeline talks to.

pub mod speech;
pub mod transcribe;
pub mod translate;

use std::time::Duration;

use reqwest::Response;
use reqwest::header::RETRY_AFTER;
use serde::{Deserialize, Serialize};

pub use speech::{EspeakEngine, HttpSpeechEngine, SpeechEngine, Voice};
pub use transcribe::{Transcriber, WhisperCliTranscriber};
pub use translate::{HttpTranslator, Translator, UnconfiguredTranslator};

use super::error::PipelineError;
use crate::domain::VoiceGender;

/// One time-aligned piece of speech.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
    /// Speaker label assigned by diarization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<VoiceGender>,
}

impl Segment {
    pub fn new(start_ms: u64, end_ms: u64, text: impl Into<String>) -> Self {
        Self {
            start_ms,
            end_ms,
            text: text.into(),
            speaker: None,
            gender: None,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

/// Segments plus the language they are in. This is the JSON stored as the
/// transcribe and translate checkpoint artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    pub language: String,
    pub segments: Vec<Segment>,
}

impl Transcript {
    pub fn end_ms(&self) -> u64 {
        self.segments.iter().map(|s| s.end_ms).max().unwrap_or(0)
    }
}

/// Turn a non-success HTTP response into a service error, keeping any
/// `Retry-After` hint.
pub(crate) async fn service_failure(service: &'static str, response: Response) -> PipelineError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body: String = response
        .text()
        .await
        .unwrap_or_default()
        .chars()
        .take(300)
        .collect();
    PipelineError::Service {
        service,
        status: Some(status),
        message: if body.is_empty() {
            format!("HTTP {status}")
        } else {
            body
        },
        retry_after,
    }
}
