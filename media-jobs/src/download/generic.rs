//! Platform-aware fallback backed by yt-dlp.
//!
//! Handles adaptive and segmented sources the plain HTTP fetchers cannot,
//! and resumes its own partial downloads across retries.

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use process_utils::{ToolError, run_tool_with_lines, tokio_command};
use regex::Regex;
use tracing::{debug, warn};

use super::{DownloadError, DownloadStrategy, FetchRequest, Result};
use crate::queue::{TransferMeter, TransferSnapshot};
use crate::utils::fs::{file_size, remove_dir_if_exists};

const NAME: &str = "generic";

static PROGRESS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\[download\]\s+(?P<pct>\d+(?:\.\d+)?)%\s+of\s+~?\s*(?P<size>\d+(?:\.\d+)?)(?P<unit>[KMGT]?i?B)(?:\s+at\s+(?P<speed>\d+(?:\.\d+)?)(?P<sunit>[KMGT]?i?B)/s)?",
    )
    .expect("valid progress regex")
});

pub struct GenericFetcher {
    program: String,
    timeout: Duration,
}

impl GenericFetcher {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    /// yt-dlp format selector honoring an optional height cap.
    pub fn format_selector(max_height: Option<u32>) -> String {
        match max_height {
            Some(h) => format!("bv*[height<={h}]+ba/b[height<={h}]/bv*+ba/b"),
            None => "bv*+ba/b".to_string(),
        }
    }

    fn work_dir(dest: &Path) -> PathBuf {
        let mut name = dest
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".d");
        dest.with_file_name(name)
    }
}

fn unit_multiplier(unit: &str) -> f64 {
    match unit.trim_end_matches('B').trim_end_matches('i') {
        "K" => 1024.0,
        "M" => 1024.0 * 1024.0,
        "G" => 1024.0 * 1024.0 * 1024.0,
        "T" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    }
}

/// Parse a `[download]  42.0% of 10.00MiB at 1.00MiB/s` line.
pub fn parse_progress(line: &str) -> Option<TransferSnapshot> {
    let caps = PROGRESS_LINE.captures(line)?;
    let pct: f64 = caps.name("pct")?.as_str().parse().ok()?;
    let size: f64 = caps.name("size")?.as_str().parse().ok()?;
    let total = (size * unit_multiplier(caps.name("unit")?.as_str())) as u64;
    let speed = match (caps.name("speed"), caps.name("sunit")) {
        (Some(s), Some(u)) => s
            .as_str()
            .parse::<f64>()
            .map(|v| (v * unit_multiplier(u.as_str())) as u64)
            .unwrap_or(0),
        _ => 0,
    };
    let transferred = ((pct / 100.0) * total as f64) as u64;
    let eta = (speed > 0).then(|| Duration::from_secs(total.saturating_sub(transferred) / speed));
    Some(TransferSnapshot {
        transferred,
        total: Some(total),
        speed,
        eta,
    })
}

/// Find the finished media file yt-dlp wrote into `dir`.
async fn find_output(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut best: Option<(u64, PathBuf)> = None;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".part") || name.ends_with(".ytdl") || name.contains(".temp.") {
            continue;
        }
        let len = entry.metadata().await?.len();
        if best.as_ref().is_none_or(|(l, _)| len > *l) {
            best = Some((len, path));
        }
    }
    Ok(best.map(|(_, p)| p))
}

/// Bytes currently on disk under `dir`, partial fragments included.
async fn dir_size(dir: &Path) -> std::io::Result<u64> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut total = 0;
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if meta.is_file() {
            total += meta.len();
        }
    }
    Ok(total)
}

async fn discard_work_dir(work: &Path) {
    if let Err(e) = remove_dir_if_exists(work).await {
        warn!(path = %work.display(), error = %e, "failed to remove yt-dlp work directory");
    }
}

#[async_trait]
impl DownloadStrategy for GenericFetcher {
    fn name(&self) -> &'static str {
        NAME
    }

    fn supports_resume(&self) -> bool {
        true
    }

    fn handles_pages(&self) -> bool {
        true
    }

    async fn fetch(&self, request: &FetchRequest, dest: &Path) -> Result<u64> {
        let work = Self::work_dir(dest);
        tokio::fs::create_dir_all(&work).await?;

        let mut cmd = tokio_command(&self.program);
        cmd.arg("--no-playlist")
            .arg("--newline")
            .arg("--continue")
            .args(["--max-filesize", &request.limit.max_bytes.to_string()])
            .args(["-f", &Self::format_selector(request.max_height)])
            .args(["--merge-output-format", "mp4"])
            .arg("-o")
            .arg(work.join("media.%(ext)s"))
            .arg(request.url.as_str());

        let progress = request.progress.clone();
        let limit = request.limit;
        let mut observed = 0u64;
        let mut meter = TransferMeter::new(None);
        let output = run_tool_with_lines(&mut cmd, Some(self.timeout), |line| {
            let Some(snapshot) = parse_progress(line) else {
                return ControlFlow::Continue(());
            };
            observed = observed.max(snapshot.transferred);
            if snapshot.transferred > limit.max_bytes {
                return ControlFlow::Break(());
            }
            if meter.should_emit() {
                progress(snapshot);
            }
            ControlFlow::Continue(())
        })
        .await
        .map_err(|e| match e {
            ToolError::Spawn { program, source } => DownloadError::Tool {
                tool: program,
                message: format!("not available: {source}"),
            },
            other => DownloadError::Tool {
                tool: self.program.clone(),
                message: other.to_string(),
            },
        })?;

        let combined = format!("{}\n{}", output.stdout, output.stderr);
        if output.stopped || combined.contains("larger than max-filesize") {
            let received = observed.max(dir_size(&work).await.unwrap_or(0));
            discard_work_dir(&work).await;
            warn!(
                url = %request.url,
                limit = limit.max_bytes,
                received,
                "yt-dlp download went over the size ceiling"
            );
            return Err(DownloadError::SizeExceeded {
                limit: limit.max_bytes,
                declared: None,
                received,
            });
        }
        if !output.success() {
            return Err(DownloadError::Tool {
                tool: self.program.clone(),
                message: output.stderr_tail(5),
            });
        }

        let Some(produced) = find_output(&work).await? else {
            warn!(url = %request.url, "yt-dlp exited cleanly without producing a file");
            return Err(DownloadError::Tool {
                tool: self.program.clone(),
                message: "no output file produced".into(),
            });
        };
        let size = file_size(&produced).await?.unwrap_or(0);
        if let Err(e) = request.limit.check_received(None, size) {
            discard_work_dir(&work).await;
            return Err(e);
        }

        tokio::fs::rename(&produced, dest).await?;
        discard_work_dir(&work).await;
        debug!(bytes = size, "generic fetch complete");
        Ok(size)
    }
}
