//! ffmpeg/ffprobe behind a trait so pipelines can be driven by fakes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use process_utils::{run_tool, tokio_command};
use serde::Deserialize;
use tracing::debug;

use super::error::PipelineError;
use crate::config::ToolConfig;
use crate::domain::OutputFormat;

pub type ToolResult<T> = std::result::Result<T, PipelineError>;

/// What ffprobe reports about a media file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaProbe {
    pub container: String,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_ms: Option<u64>,
}

impl MediaProbe {
    /// H.264 video with AAC/MP3 (or no) audio in an MP4 container plays in
    /// every browser without re-encoding.
    pub fn is_browser_playable(&self) -> bool {
        let container_ok = self
            .container
            .split(',')
            .any(|c| matches!(c.trim(), "mp4" | "mov"));
        let video_ok = self.video_codec.as_deref() == Some("h264");
        let audio_ok = matches!(self.audio_codec.as_deref(), None | Some("aac") | Some("mp3"));
        container_ok && video_ok && audio_ok
    }

    pub fn needs_transcode(&self, max_height: Option<u32>) -> bool {
        let too_tall = match (max_height, self.height) {
            (Some(cap), Some(h)) => h > cap,
            _ => false,
        };
        !self.is_browser_playable() || too_tall
    }
}

/// A synthesized clip placed on the output timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedClip {
    pub path: PathBuf,
    pub start_ms: u64,
}

#[async_trait]
pub trait MediaToolkit: Send + Sync {
    async fn probe(&self, input: &Path) -> ToolResult<MediaProbe>;

    /// Re-encode to H.264/AAC MP4, optionally capping the height.
    async fn transcode_for_web(
        &self,
        input: &Path,
        output: &Path,
        max_height: Option<u32>,
    ) -> ToolResult<()>;

    /// Extract the audio track as 44.1kHz stereo WAV.
    async fn extract_audio(&self, input: &Path, output: &Path) -> ToolResult<()>;

    /// Lay clips out on a silent track of `total_ms`.
    async fn assemble_speech(
        &self,
        clips: &[TimedClip],
        total_ms: u64,
        output: &Path,
    ) -> ToolResult<()>;

    /// Loudness-normalise speech and either blend it over a ducked
    /// `background` or use it alone.
    async fn mix(&self, speech: &Path, background: Option<&Path>, output: &Path)
    -> ToolResult<()>;

    async fn encode_audio(&self, input: &Path, output: &Path, format: OutputFormat)
    -> ToolResult<()>;
}

pub struct FfmpegToolkit {
    ffmpeg: String,
    ffprobe: String,
    timeout: Duration,
}

impl FfmpegToolkit {
    pub fn new(config: &ToolConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg.clone(),
            ffprobe: config.ffprobe.clone(),
            timeout: config.tool_timeout,
        }
    }

    async fn ffmpeg(&self, args: Vec<String>) -> ToolResult<()> {
        let mut cmd = tokio_command(&self.ffmpeg);
        cmd.args(&args);
        let output = run_tool(&mut cmd, Some(self.timeout)).await?;
        if !output.success() {
            return Err(PipelineError::tool("ffmpeg", output.stderr_tail(8)));
        }
        debug!(elapsed_ms = output.elapsed.as_millis() as u64, "ffmpeg finished");
        Ok(())
    }
}

fn base_args() -> Vec<String> {
    ["-y", "-hide_banner", "-nostats", "-loglevel", "error"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub fn transcode_args(input: &Path, output: &Path, max_height: Option<u32>) -> Vec<String> {
    let mut args = base_args();
    args.extend(["-i".into(), path_arg(input)]);
    if let Some(h) = max_height {
        // keep aspect ratio, even width for yuv420p
        args.extend(["-vf".into(), format!("scale=-2:'min({h},ih)'")]);
    }
    args.extend(
        [
            "-c:v", "libx264", "-preset", "veryfast", "-crf", "23", "-pix_fmt", "yuv420p",
            "-c:a", "aac", "-b:a", "160k", "-movflags", "+faststart",
        ]
        .map(String::from),
    );
    args.push(path_arg(output));
    args
}

pub fn extract_audio_args(input: &Path, output: &Path) -> Vec<String> {
    let mut args = base_args();
    args.extend(["-i".into(), path_arg(input)]);
    args.extend(["-vn", "-ac", "2", "-ar", "44100", "-c:a", "pcm_s16le"].map(String::from));
    args.push(path_arg(output));
    args
}

pub fn assemble_args(clips: &[TimedClip], total_ms: u64, output: &Path) -> Vec<String> {
    let mut args = base_args();
    args.extend([
        "-f".into(),
        "lavfi".into(),
        "-t".into(),
        format!("{:.3}", total_ms as f64 / 1000.0),
        "-i".into(),
        "anullsrc=r=44100:cl=stereo".into(),
    ]);
    for clip in clips {
        args.extend(["-i".into(), path_arg(&clip.path)]);
    }

    let mut filter = String::new();
    let mut labels = String::from("[0:a]");
    for (i, clip) in clips.iter().enumerate() {
        let input = i + 1;
        filter.push_str(&format!(
            "[{input}:a]aresample=44100,adelay={d}|{d}[c{input}];",
            d = clip.start_ms
        ));
        labels.push_str(&format!("[c{input}]"));
    }
    filter.push_str(&format!(
        "{labels}amix=inputs={}:duration=first:dropout_transition=0:normalize=0[out]",
        clips.len() + 1
    ));
    args.extend(["-filter_complex".into(), filter, "-map".into(), "[out]".into()]);
    args.extend(["-c:a", "pcm_s16le"].map(String::from));
    args.push(path_arg(output));
    args
}

pub fn mix_args(speech: &Path, background: Option<&Path>, output: &Path) -> Vec<String> {
    let mut args = base_args();
    args.extend(["-i".into(), path_arg(speech)]);
    let filter = match background {
        Some(bg) => {
            args.extend(["-i".into(), path_arg(bg)]);
            "[0:a]loudnorm=I=-16:TP=-1.5:LRA=11[s];\
             [1:a]volume=0.25[b];\
             [s][b]amix=inputs=2:duration=first:dropout_transition=0:normalize=0[out]"
                .to_string()
        }
        None => "[0:a]loudnorm=I=-16:TP=-1.5:LRA=11[out]".to_string(),
    };
    args.extend(["-filter_complex".into(), filter, "-map".into(), "[out]".into()]);
    args.extend(["-ar", "44100", "-c:a", "pcm_s16le"].map(String::from));
    args.push(path_arg(output));
    args
}

pub fn encode_args(input: &Path, output: &Path, format: OutputFormat) -> Vec<String> {
    let mut args = base_args();
    args.extend(["-i".into(), path_arg(input), "-vn".into()]);
    match format {
        OutputFormat::Aac => {
            args.extend(["-c:a", "aac", "-b:a", "192k", "-movflags", "+faststart"].map(String::from))
        }
        OutputFormat::Mp3 => args.extend(["-c:a", "libmp3lame", "-b:a", "192k"].map(String::from)),
    }
    args.push(path_arg(output));
    args
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    format_name: Option<String>,
    duration: Option<String>,
}

pub fn parse_probe(json: &str) -> ToolResult<MediaProbe> {
    let parsed: ProbeOutput = serde_json::from_str(json)
        .map_err(|e| PipelineError::tool("ffprobe", format!("unreadable output: {e}")))?;
    let video = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));
    let audio = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));
    let format = parsed.format.as_ref();
    Ok(MediaProbe {
        container: format
            .and_then(|f| f.format_name.clone())
            .unwrap_or_default(),
        video_codec: video.and_then(|s| s.codec_name.clone()),
        audio_codec: audio.and_then(|s| s.codec_name.clone()),
        width: video.and_then(|s| s.width),
        height: video.and_then(|s| s.height),
        duration_ms: format
            .and_then(|f| f.duration.as_deref())
            .and_then(|d| d.parse::<f64>().ok())
            .map(|secs| (secs * 1000.0).round() as u64),
    })
}

#[async_trait]
impl MediaToolkit for FfmpegToolkit {
    async fn probe(&self, input: &Path) -> ToolResult<MediaProbe> {
        let mut cmd = tokio_command(&self.ffprobe);
        cmd.args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(input);
        let output = run_tool(&mut cmd, Some(Duration::from_secs(120))).await?;
        if !output.success() {
            return Err(PipelineError::tool("ffprobe", output.stderr_tail(5)));
        }
        parse_probe(&output.stdout)
    }

    async fn transcode_for_web(
        &self,
        input: &Path,
        output: &Path,
        max_height: Option<u32>,
    ) -> ToolResult<()> {
        self.ffmpeg(transcode_args(input, output, max_height)).await
    }

    async fn extract_audio(&self, input: &Path, output: &Path) -> ToolResult<()> {
        self.ffmpeg(extract_audio_args(input, output)).await
    }

    async fn assemble_speech(
        &self,
        clips: &[TimedClip],
        total_ms: u64,
        output: &Path,
    ) -> ToolResult<()> {
        self.ffmpeg(assemble_args(clips, total_ms, output)).await
    }

    async fn mix(
        &self,
        speech: &Path,
        background: Option<&Path>,
        output: &Path,
    ) -> ToolResult<()> {
        self.ffmpeg(mix_args(speech, background, output)).await
    }

    async fn encode_audio(
        &self,
        input: &Path,
        output: &Path,
        format: OutputFormat,
    ) -> ToolResult<()> {
        self.ffmpeg(encode_args(input, output, format)).await
    }
}
