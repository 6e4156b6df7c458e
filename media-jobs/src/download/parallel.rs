//! Multi-connection range fetcher.
//!
//! Splits the file into contiguous byte ranges and fetches them concurrently
//! into a preallocated file. Requires a declared length and
//! `Accept-Ranges: bytes`; anything else is left to the next strategy.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinSet;
use tracing::debug;
use url::Url;

use super::{DownloadError, DownloadStrategy, FetchRequest, Result, SizeLimit, check_response};
use crate::queue::TransferMeter;

const NAME: &str = "parallel";
const PROGRESS_TICK: Duration = Duration::from_millis(500);

/// Byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub start: u64,
    pub end: u64,
}

impl Segment {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// HTTP `Range` value; the header's end offset is inclusive.
    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end.saturating_sub(1))
    }
}

/// Split `total` bytes into `count` near-equal segments.
pub fn plan_segments(total: u64, count: usize) -> Vec<Segment> {
    if total == 0 || count == 0 {
        return Vec::new();
    }
    let count = (count as u64).min(total);
    let base = total / count;
    let remainder = total % count;
    let mut offset = 0;
    (0..count)
        .map(|i| {
            let len = base + u64::from(i < remainder);
            let seg = Segment {
                start: offset,
                end: offset + len,
            };
            offset += len;
            seg
        })
        .collect()
}

pub struct ParallelRangeFetcher {
    client: reqwest::Client,
    connections: usize,
    min_bytes: u64,
}

impl ParallelRangeFetcher {
    pub fn new(client: reqwest::Client, connections: usize, min_bytes: u64) -> Self {
        Self {
            client,
            connections: connections.max(1),
            min_bytes,
        }
    }

    async fn probe(&self, url: &Url) -> Result<(u64, Url)> {
        let response = self
            .client
            .head(url.clone())
            .send()
            .await
            .map_err(DownloadError::from_reqwest)?;
        let response = check_response(response)?;

        let accepts_ranges = response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));
        // HEAD bodies are empty, so `content_length()` would report zero.
        let length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|len| *len > 0);

        match (length, accepts_ranges) {
            (Some(len), true) => Ok((len, response.url().clone())),
            (None, _) => Err(DownloadError::Unsupported {
                strategy: NAME,
                reason: "no declared content length".into(),
            }),
            (Some(_), false) => Err(DownloadError::Unsupported {
                strategy: NAME,
                reason: "server does not accept byte ranges".into(),
            }),
        }
    }
}

#[async_trait]
impl DownloadStrategy for ParallelRangeFetcher {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn fetch(&self, request: &FetchRequest, dest: &Path) -> Result<u64> {
        let (total, resolved) = self.probe(&request.url).await?;
        request.limit.check_declared(Some(total))?;
        if total < self.min_bytes {
            return Err(DownloadError::Unsupported {
                strategy: NAME,
                reason: format!("{total} bytes is below the parallel threshold"),
            });
        }

        let file = tokio::fs::File::create(dest).await?;
        file.set_len(total).await?;
        drop(file);

        let received = Arc::new(AtomicU64::new(0));
        let mut tasks = JoinSet::new();
        let segments = plan_segments(total, self.connections);
        debug!(segments = segments.len(), total, "starting ranged download");

        for segment in segments {
            tasks.spawn(fetch_segment(
                self.client.clone(),
                resolved.clone(),
                dest.to_path_buf(),
                segment,
                received.clone(),
                request.limit,
                total,
            ));
        }

        let mut meter = TransferMeter::new(Some(total));
        let mut tick = tokio::time::interval(PROGRESS_TICK);
        loop {
            tokio::select! {
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => return Err(e),
                        Err(join) => {
                            return Err(DownloadError::Io(std::io::Error::other(format!(
                                "segment task failed: {join}"
                            ))));
                        }
                    }
                }
                _ = tick.tick() => {
                    meter.set_transferred(received.load(Ordering::Relaxed));
                    (request.progress)(meter.snapshot());
                }
            }
        }

        let got = received.load(Ordering::Relaxed);
        if got != total {
            return Err(DownloadError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("ranged download produced {got} of {total} bytes"),
            )));
        }
        meter.set_transferred(got);
        (request.progress)(meter.snapshot());
        Ok(total)
    }
}

async fn fetch_segment(
    client: reqwest::Client,
    url: Url,
    dest: PathBuf,
    segment: Segment,
    received: Arc<AtomicU64>,
    limit: SizeLimit,
    total: u64,
) -> Result<()> {
    let response = client
        .get(url)
        .header(RANGE, segment.range_header())
        .send()
        .await
        .map_err(DownloadError::from_reqwest)?;
    let response = check_response(response)?;
    if response.status() != StatusCode::PARTIAL_CONTENT {
        return Err(DownloadError::Unsupported {
            strategy: NAME,
            reason: format!("range request answered with {}", response.status()),
        });
    }

    let mut file = tokio::fs::OpenOptions::new().write(true).open(&dest).await?;
    file.seek(SeekFrom::Start(segment.start)).await?;

    let mut written: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(DownloadError::from_reqwest)?;
        let n = chunk.len() as u64;
        if written + n > segment.len() {
            return Err(DownloadError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("server sent more than the requested range {}", segment.range_header()),
            )));
        }
        let so_far = received.fetch_add(n, Ordering::Relaxed) + n;
        limit.check_received(Some(total), so_far)?;
        file.write_all(&chunk).await?;
        written += n;
    }
    file.flush().await?;

    if written != segment.len() {
        return Err(DownloadError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("range {} ended after {written} bytes", segment.range_header()),
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_cover_the_file_exactly() {
        let segs = plan_segments(10, 4);
        assert_eq!(
            segs,
            vec![
                Segment { start: 0, end: 3 },
                Segment { start: 3, end: 6 },
                Segment { start: 6, end: 8 },
                Segment { start: 8, end: 10 },
            ]
        );
        assert_eq!(segs.iter().map(Segment::len).sum::<u64>(), 10);
        assert_eq!(segs[0].range_header(), "bytes=0-2");
    }

    #[test]
    fn never_more_segments_than_bytes() {
        assert_eq!(plan_segments(3, 8).len(), 3);
        assert!(plan_segments(0, 8).is_empty());
    }
}
