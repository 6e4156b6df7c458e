use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::service_failure;
use crate::pipeline::{PipelineError, PipelineResult};

const BATCH_SIZE: usize = 50;
const SERVICE: &str = "translate";

#[async_trait]
pub trait Translator: Send + Sync {
    /// Translate each text, preserving order and count.
    async fn translate(
        &self,
        texts: &[String],
        source: &str,
        target: &str,
    ) -> PipelineResult<Vec<String>>;
}

/// A LibreTranslate-compatible endpoint taking batched `q` arrays.
pub struct HttpTranslator {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpTranslator {
    pub fn new(client: reqwest::Client, base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client,
            endpoint: format!("{}/translate", base_url.trim_end_matches('/')),
            api_key,
        }
    }
}

#[derive(Serialize)]
struct TranslateRequest<'a> {
    q: &'a [String],
    source: &'a str,
    target: &'a str,
    format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranslateResponse {
    translated_text: Vec<String>,
}

#[async_trait]
impl Translator for HttpTranslator {
    async fn translate(
        &self,
        texts: &[String],
        source: &str,
        target: &str,
    ) -> PipelineResult<Vec<String>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(BATCH_SIZE) {
            let response = self
                .client
                .post(&self.endpoint)
                .json(&TranslateRequest {
                    q: batch,
                    source,
                    target,
                    format: "text",
                    api_key: self.api_key.as_deref(),
                })
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(service_failure(SERVICE, response).await);
            }
            let parsed: TranslateResponse = response.json().await?;
            if parsed.translated_text.len() != batch.len() {
                return Err(PipelineError::service(
                    SERVICE,
                    None,
                    format!(
                        "asked for {} translations, got {}",
                        batch.len(),
                        parsed.translated_text.len()
                    ),
                ));
            }
            out.extend(parsed.translated_text);
        }
        debug!(count = out.len(), source, target, "translated segments");
        Ok(out)
    }
}

/// Stands in when no translation endpoint is configured. Every call fails
/// without retry so video-only deployments can still run a worker.
pub struct UnconfiguredTranslator;

#[async_trait]
impl Translator for UnconfiguredTranslator {
    async fn translate(
        &self,
        _texts: &[String],
        _source: &str,
        _target: &str,
    ) -> PipelineResult<Vec<String>> {
        Err(PipelineError::NotImplemented(
            "no translation service configured, set TRANSLATE_URL".to_string(),
        ))
    }
}
