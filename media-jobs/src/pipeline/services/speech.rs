//! Text-to-speech engines.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use process_utils::{run_tool, tokio_command};
use serde::Serialize;

use super::service_failure;
use crate::domain::VoiceGender;
use crate::pipeline::{PipelineError, PipelineResult};

/// The voice a segment is spoken in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Voice {
    pub gender: VoiceGender,
    /// Engine-specific voice name overriding the gender default.
    pub name: Option<String>,
}

impl Voice {
    pub fn of(gender: VoiceGender) -> Self {
        Self { gender, name: None }
    }
}

#[async_trait]
pub trait SpeechEngine: Send + Sync {
    /// Identifier recorded against the dub track.
    fn model_id(&self) -> String;

    /// Write `text` spoken in `language` as WAV to `output`.
    async fn synthesize(
        &self,
        text: &str,
        voice: &Voice,
        language: &str,
        output: &Path,
    ) -> PipelineResult<()>;
}

/// Baseline engine: espeak-ng, always available offline.
pub struct EspeakEngine {
    program: String,
    timeout: Duration,
}

impl EspeakEngine {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    /// espeak-ng voice spec, e.g. `de+f3`.
    pub fn voice_spec(voice: &Voice, language: &str) -> String {
        if let Some(name) = &voice.name {
            return name.clone();
        }
        let variant = match voice.gender {
            VoiceGender::Male => "m3",
            VoiceGender::Female => "f3",
            VoiceGender::Neutral => "m1",
        };
        format!("{language}+{variant}")
    }
}

#[async_trait]
impl SpeechEngine for EspeakEngine {
    fn model_id(&self) -> String {
        "espeak-ng".to_string()
    }

    async fn synthesize(
        &self,
        text: &str,
        voice: &Voice,
        language: &str,
        output: &Path,
    ) -> PipelineResult<()> {
        let mut cmd = tokio_command(&self.program);
        cmd.args(["-v", &Self::voice_spec(voice, language)])
            .arg("-w")
            .arg(output)
            .arg("--")
            .arg(text);
        let result = run_tool(&mut cmd, Some(self.timeout)).await?;
        if !result.success() {
            return Err(PipelineError::tool(&self.program, result.stderr_tail(3)));
        }
        Ok(())
    }
}

/// Premium engine behind an HTTP endpoint returning WAV bytes.
pub struct HttpSpeechEngine {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpSpeechEngine {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        }
    }
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
    language: &'a str,
    gender: VoiceGender,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<&'a str>,
    format: &'static str,
}

#[async_trait]
impl SpeechEngine for HttpSpeechEngine {
    fn model_id(&self) -> String {
        match url::Url::parse(&self.endpoint) {
            Ok(url) => format!("premium:{}", url.host_str().unwrap_or("local")),
            Err(_) => "premium".to_string(),
        }
    }

    async fn synthesize(
        &self,
        text: &str,
        voice: &Voice,
        language: &str,
        output: &Path,
    ) -> PipelineResult<()> {
        let mut request = self.client.post(&self.endpoint).json(&SpeechRequest {
            text,
            language,
            gender: voice.gender,
            voice: voice.name.as_deref(),
            format: "wav",
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(service_failure("speech", response).await);
        }
        let audio = response.bytes().await?;
        if audio.is_empty() {
            return Err(PipelineError::service("speech", None, "empty audio response"));
        }
        tokio::fs::write(output, &audio).await?;
        Ok(())
    }
}
