use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;

use super::platforms::{ArchiveOrg, Dailymotion, DirectFile, Streamable, Vimeo, YouTube};
use super::registry::ExtractorRegistry;

/// Returns a registry populated with every built-in extractor.
///
/// Platform-specific extractors are registered before the direct-file
/// fallback so that e.g. an archive.org page never hits a bare HEAD probe.
pub fn default_registry(client: Client, cache_ttl: Duration) -> ExtractorRegistry {
    let registry = ExtractorRegistry::new(cache_ttl);
    registry.register(Arc::new(YouTube));
    registry.register(Arc::new(Vimeo::new(client.clone())));
    registry.register(Arc::new(Dailymotion::new(client.clone())));
    registry.register(Arc::new(Streamable::new(client.clone())));
    registry.register(Arc::new(ArchiveOrg::new(client.clone())));
    registry.register(Arc::new(DirectFile::new(client)));
    registry
}
