use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use process_utils::{run_tool, tokio_command};
use serde::Deserialize;
use tracing::debug;

use super::{Segment, Transcript};
use crate::config::ToolConfig;
use crate::pipeline::{PipelineError, PipelineResult};

/// Speech-to-text with per-segment timing.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// `language` may be `"auto"`; the result carries the detected one.
    async fn transcribe(&self, audio: &Path, language: &str) -> PipelineResult<Transcript>;
}

/// The `whisper` command line tool, JSON output.
pub struct WhisperCliTranscriber {
    program: String,
    model: String,
    timeout: Duration,
}

impl WhisperCliTranscriber {
    pub fn new(config: &ToolConfig) -> Self {
        Self {
            program: config.whisper.clone(),
            model: config.whisper_model.clone(),
            timeout: config.tool_timeout,
        }
    }

    fn output_dir(audio: &Path) -> PathBuf {
        audio.with_file_name("whisper")
    }
}

#[derive(Debug, Deserialize)]
struct WhisperOutput {
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    start: f64,
    end: f64,
    text: String,
}

fn secs_to_ms(secs: f64) -> u64 {
    (secs.max(0.0) * 1000.0).round() as u64
}

/// Parse whisper's JSON, dropping empty segments.
pub fn parse_whisper_json(json: &str, requested: &str) -> PipelineResult<Transcript> {
    let output: WhisperOutput = serde_json::from_str(json)
        .map_err(|e| PipelineError::tool("whisper", format!("unreadable transcript: {e}")))?;
    let segments = output
        .segments
        .into_iter()
        .filter_map(|s| {
            let text = s.text.trim();
            (!text.is_empty()).then(|| Segment::new(secs_to_ms(s.start), secs_to_ms(s.end), text))
        })
        .collect();
    let language = output
        .language
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| requested.to_string());
    Ok(Transcript { language, segments })
}

#[async_trait]
impl Transcriber for WhisperCliTranscriber {
    async fn transcribe(&self, audio: &Path, language: &str) -> PipelineResult<Transcript> {
        let out_dir = Self::output_dir(audio);
        tokio::fs::create_dir_all(&out_dir).await?;

        let mut cmd = tokio_command(&self.program);
        cmd.arg(audio)
            .args(["--model", &self.model])
            .args(["--output_format", "json"])
            .arg("--output_dir")
            .arg(&out_dir);
        if language != "auto" {
            cmd.args(["--language", language]);
        }

        let output = run_tool(&mut cmd, Some(self.timeout)).await?;
        if !output.success() {
            return Err(PipelineError::tool("whisper", output.stderr_tail(5)));
        }

        let stem = audio
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let json_path = out_dir.join(format!("{stem}.json"));
        let json = tokio::fs::read_to_string(&json_path).await?;
        let transcript = parse_whisper_json(&json, language)?;
        debug!(
            segments = transcript.segments.len(),
            language = transcript.language,
            "transcription finished"
        );
        Ok(transcript)
    }
}
