//! Shared fixtures: a temp-file queue, fake collaborators that record their
//! calls, and a tiny HTTP server for download tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use media_jobs::config::QueueConfig;
use media_jobs::database::repositories::SqlxJobRepository;
use media_jobs::database::time::ManualClock;
use media_jobs::database::{DbPool, init_pool, run_migrations};
use media_jobs::domain::OutputFormat;
use media_jobs::download::{DownloadError, DownloadStrategy, FetchRequest};
use media_jobs::pipeline::{PipelineError, PipelineResult};
use media_jobs::pipeline::services::{SpeechEngine, Transcriber, Transcript, Translator, Voice};
use media_jobs::pipeline::tools::{MediaProbe, MediaToolkit, TimedClip, ToolResult};
use media_jobs::queue::JobQueue;

pub const LOCK_TIMEOUT: Duration = Duration::from_secs(1800);

pub struct TestQueue {
    pub dir: TempDir,
    pub pool: DbPool,
    pub queue: Arc<JobQueue>,
    pub clock: Arc<ManualClock>,
}

impl TestQueue {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let url = format!(
            "sqlite:{}?mode=rwc",
            dir.path().join("jobs.db").to_string_lossy().replace('\\', "/")
        );
        let pool = init_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let queue = Arc::new(JobQueue::new(
            Arc::new(SqlxJobRepository::new(pool.clone())),
            clock.clone(),
            QueueConfig {
                database_url: url,
                lock_timeout: LOCK_TIMEOUT,
                default_max_retries: 3,
            },
        ));
        Self {
            dir,
            pool,
            queue,
            clock,
        }
    }

    pub fn work_root(&self) -> PathBuf {
        self.dir.path().join("work")
    }
}

/// Append-only call log shared by the fakes.
#[derive(Default, Clone)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, call: impl Into<String>) {
        self.0.lock().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.0.lock().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

async fn write(path: &Path, body: &[u8]) -> ToolResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, body).await?;
    Ok(())
}

/// A download strategy that fails with HTTP 503 a set number of times.
pub struct FlakyStrategy {
    pub failures_left: AtomicUsize,
    pub payload: Vec<u8>,
    pub log: CallLog,
}

impl FlakyStrategy {
    pub fn new(failures: usize, payload: &[u8], log: CallLog) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
            payload: payload.to_vec(),
            log,
        }
    }
}

#[async_trait]
impl DownloadStrategy for FlakyStrategy {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn handles_pages(&self) -> bool {
        true
    }

    async fn fetch(&self, request: &FetchRequest, dest: &Path) -> Result<u64, DownloadError> {
        self.log.push(format!("fetch {}", request.url));
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(DownloadError::Http {
                status: 503,
                url: request.url.to_string(),
                retry_after: None,
            });
        }
        request.limit.check_declared(Some(self.payload.len() as u64))?;
        tokio::fs::write(dest, &self.payload).await?;
        Ok(self.payload.len() as u64)
    }
}

/// ffmpeg stand-in. Outputs are small marker files.
pub struct FakeToolkit {
    pub probe: Mutex<MediaProbe>,
    pub log: CallLog,
    /// Mix calls left to fail with a connection reset.
    pub mix_failures: AtomicUsize,
}

impl FakeToolkit {
    pub fn new(probe: MediaProbe, log: CallLog) -> Self {
        Self {
            probe: Mutex::new(probe),
            log,
            mix_failures: AtomicUsize::new(0),
        }
    }
}

pub fn h264_probe(height: u32) -> MediaProbe {
    MediaProbe {
        container: "mov,mp4,m4a,3gp,3g2,mj2".into(),
        video_codec: Some("h264".into()),
        audio_codec: Some("aac".into()),
        width: Some(height * 16 / 9),
        height: Some(height),
        duration_ms: Some(12_000),
    }
}

#[async_trait]
impl MediaToolkit for FakeToolkit {
    async fn probe(&self, input: &Path) -> ToolResult<MediaProbe> {
        self.log.push(format!("probe {}", file_name(input)));
        Ok(self.probe.lock().clone())
    }

    async fn transcode_for_web(
        &self,
        input: &Path,
        output: &Path,
        max_height: Option<u32>,
    ) -> ToolResult<()> {
        self.log
            .push(format!("transcode {} {max_height:?}", file_name(input)));
        write(output, b"transcoded").await
    }

    async fn extract_audio(&self, input: &Path, output: &Path) -> ToolResult<()> {
        self.log.push(format!("extract_audio {}", file_name(input)));
        write(output, b"audio").await
    }

    async fn assemble_speech(
        &self,
        clips: &[TimedClip],
        total_ms: u64,
        output: &Path,
    ) -> ToolResult<()> {
        self.log
            .push(format!("assemble {} {total_ms}", clips.len()));
        write(output, b"speech").await
    }

    async fn mix(&self, speech: &Path, background: Option<&Path>, output: &Path) -> ToolResult<()> {
        self.log.push(format!(
            "mix {} {}",
            file_name(speech),
            background.map(file_name).unwrap_or_default()
        ));
        if self
            .mix_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(PipelineError::tool(
                "ffmpeg",
                "Connection reset by peer while reading input",
            ));
        }
        write(output, b"mixed").await
    }

    async fn encode_audio(&self, input: &Path, output: &Path, format: OutputFormat) -> ToolResult<()> {
        self.log
            .push(format!("encode {} {format}", file_name(input)));
        write(output, b"encoded").await
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub struct FakeTranscriber {
    pub transcript: Transcript,
    pub log: CallLog,
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, audio: &Path, language: &str) -> PipelineResult<Transcript> {
        self.log
            .push(format!("transcribe {} {language}", file_name(audio)));
        Ok(self.transcript.clone())
    }
}

/// Prefixes every text with the target language.
pub struct FakeTranslator {
    pub log: CallLog,
}

#[async_trait]
impl Translator for FakeTranslator {
    async fn translate(
        &self,
        texts: &[String],
        source: &str,
        target: &str,
    ) -> PipelineResult<Vec<String>> {
        self.log
            .push(format!("translate {} {source}->{target}", texts.len()));
        Ok(texts.iter().map(|t| format!("[{target}] {t}")).collect())
    }
}

pub struct FakeVoice {
    pub id: &'static str,
    pub log: CallLog,
    pub voices: Arc<Mutex<HashMap<String, Voice>>>,
}

impl FakeVoice {
    pub fn new(id: &'static str, log: CallLog) -> Self {
        Self {
            id,
            log,
            voices: Arc::default(),
        }
    }
}

#[async_trait]
impl SpeechEngine for FakeVoice {
    fn model_id(&self) -> String {
        self.id.to_string()
    }

    async fn synthesize(
        &self,
        text: &str,
        voice: &Voice,
        _language: &str,
        output: &Path,
    ) -> PipelineResult<()> {
        self.log.push(format!("synthesize {} {}", self.id, voice.gender));
        self.voices.lock().insert(text.to_string(), voice.clone());
        write(output, b"clip").await
    }
}

/// Canned responses keyed by path. `Range` requests get 206 slices of the
/// body when the route allows it.
#[derive(Clone)]
pub enum Route {
    Body {
        body: Vec<u8>,
        ranges: bool,
    },
    /// Body sent without a Content-Length, then the connection closes.
    Unsized(Vec<u8>),
    Redirect(String),
    Status(u16),
}

pub async fn spawn_http_server(routes: HashMap<String, Route>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let routes = Arc::new(routes);
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let routes = routes.clone();
            tokio::spawn(async move {
                let _ = serve(socket, &routes).await;
            });
        }
    });
    addr
}

async fn serve(mut socket: TcpStream, routes: &HashMap<String, Route>) -> std::io::Result<()> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    while !raw.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        raw.extend_from_slice(&buf[..n]);
    }
    let head = String::from_utf8_lossy(&raw).to_string();
    let mut lines = head.lines();
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();
    let range = lines
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.eq_ignore_ascii_case("range"))
        .and_then(|(_, v)| v.trim().strip_prefix("bytes="))
        .and_then(|v| v.split_once('-'))
        .and_then(|(s, e)| Some((s.parse::<usize>().ok()?, e.parse::<usize>().ok()?)));

    let head_only = method == "HEAD";
    let response = match routes.get(&path) {
        None => status_response(404),
        Some(Route::Status(code)) => status_response(*code),
        Some(Route::Redirect(to)) => format!(
            "HTTP/1.1 302 Found\r\nLocation: {to}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        )
        .into_bytes(),
        Some(Route::Unsized(body)) => {
            let mut out = b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n".to_vec();
            if !head_only {
                out.extend_from_slice(body);
            }
            out
        }
        Some(Route::Body { body, ranges }) => match (range, *ranges) {
            (Some((start, end)), true) if start <= end && end < body.len() => {
                let slice = &body[start..=end];
                let mut out = format!(
                    "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {start}-{end}/{}\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n",
                    slice.len(),
                    body.len()
                )
                .into_bytes();
                if !head_only {
                    out.extend_from_slice(slice);
                }
                out
            }
            _ => {
                let accept = if *ranges { "Accept-Ranges: bytes\r\n" } else { "" };
                let mut out = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{accept}Connection: close\r\n\r\n",
                    body.len()
                )
                .into_bytes();
                if !head_only {
                    out.extend_from_slice(body);
                }
                out
            }
        },
    };
    socket.write_all(&response).await?;
    socket.shutdown().await
}

fn status_response(code: u16) -> Vec<u8> {
    format!("HTTP/1.1 {code} Status\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").into_bytes()
}
