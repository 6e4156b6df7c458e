use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use parking_lot::RwLock;
use tracing::{debug, info};
use url::Url;

use super::error::ExtractorError;
use super::platform_extractor::{Extraction, PlatformExtractor};

/// Default lifetime of a cached direct URL. Platform CDN links expire.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(600);

const CACHE_CAPACITY: u64 = 1_000;

/// A resolved page URL together with the extractor that handled it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub extractor: &'static str,
    pub extraction: Extraction,
    pub cached: bool,
}

/// Ordered, mutable set of extractors plus a short-lived result cache.
///
/// Extractors are consulted in registration order; the first whose
/// `matches` returns true handles the URL.
pub struct ExtractorRegistry {
    extractors: RwLock<Vec<Arc<dyn PlatformExtractor>>>,
    cache: Cache<String, (&'static str, Extraction)>,
}

impl ExtractorRegistry {
    pub fn new(cache_ttl: Duration) -> Self {
        Self {
            extractors: RwLock::new(Vec::new()),
            cache: Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(cache_ttl)
                .build(),
        }
    }

    /// Add an extractor. A previously registered extractor with the same
    /// name is replaced in place.
    pub fn register(&self, extractor: Arc<dyn PlatformExtractor>) {
        let mut list = self.extractors.write();
        if let Some(slot) = list.iter_mut().find(|e| e.name() == extractor.name()) {
            *slot = extractor;
        } else {
            info!(extractor = extractor.name(), "registered extractor");
            list.push(extractor);
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut list = self.extractors.write();
        let before = list.len();
        list.retain(|e| e.name() != name);
        before != list.len()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.extractors.read().iter().map(|e| e.name()).collect()
    }

    pub fn find(&self, url: &Url) -> Option<Arc<dyn PlatformExtractor>> {
        self.extractors
            .read()
            .iter()
            .find(|e| e.matches(url))
            .cloned()
    }

    /// Resolve a page URL. Returns `Ok(None)` when no extractor claims it.
    pub async fn resolve(&self, url: &Url) -> Result<Option<Resolved>, ExtractorError> {
        let key = url.as_str().to_string();
        if let Some((extractor, extraction)) = self.cache.get(&key).await {
            debug!(%url, extractor, "extraction cache hit");
            return Ok(Some(Resolved {
                extractor,
                extraction,
                cached: true,
            }));
        }

        let Some(extractor) = self.find(url) else {
            return Ok(None);
        };
        let name = extractor.name();
        let extraction = extractor.extract(url).await?;

        if matches!(extraction, Extraction::Direct { .. }) {
            self.cache.insert(key, (name, extraction.clone())).await;
        }

        Ok(Some(Resolved {
            extractor: name,
            extraction,
            cached: false,
        }))
    }

    pub async fn invalidate(&self, url: &Url) {
        self.cache.invalidate(url.as_str()).await;
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}
