//! Single-connection streaming fetcher.

use std::path::Path;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{DownloadError, DownloadStrategy, FetchRequest, Result, check_response};
use crate::queue::TransferMeter;

pub struct StreamingFetcher {
    client: reqwest::Client,
}

impl StreamingFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DownloadStrategy for StreamingFetcher {
    fn name(&self) -> &'static str {
        "streaming"
    }

    async fn fetch(&self, request: &FetchRequest, dest: &Path) -> Result<u64> {
        let response = self
            .client
            .get(request.url.clone())
            .send()
            .await
            .map_err(DownloadError::from_reqwest)?;
        let response = check_response(response)?;

        let declared = response.content_length();
        request.limit.check_declared(declared)?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut meter = TransferMeter::new(declared);
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(DownloadError::from_reqwest)?;
            let received = meter.transferred() + chunk.len() as u64;
            // Chunked responses may omit a length; enforce on the live count.
            request.limit.check_received(declared, received)?;
            file.write_all(&chunk).await?;
            meter.add(chunk.len() as u64);
            if meter.should_emit() {
                (request.progress)(meter.snapshot());
            }
        }
        file.flush().await?;
        file.sync_all().await?;

        let received = meter.transferred();
        if let Some(expected) = declared
            && received != expected
        {
            return Err(DownloadError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("received {received} of {expected} declared bytes"),
            )));
        }
        (request.progress)(meter.snapshot());
        debug!(bytes = received, "stream complete");
        Ok(received)
    }
}
