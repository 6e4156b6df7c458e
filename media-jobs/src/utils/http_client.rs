use std::sync::OnceLock;

use reqwest::redirect;
use tracing::debug;

use crate::config::DownloadConfig;

const USER_AGENT: &str = concat!("media-jobs/", env!("CARGO_PKG_VERSION"));

/// reqwest is built without a bundled crypto provider; install aws-lc-rs
/// once per process before any client is constructed.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Client used by the download chain. Redirects are capped; a redirect
/// response left over after the cap surfaces as a fetch error.
pub fn build_download_client(config: &DownloadConfig) -> reqwest::Result<reqwest::Client> {
    install_rustls_provider();
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.read_timeout)
        .redirect(redirect::Policy::limited(config.max_redirects))
        .pool_max_idle_per_host(config.parallel_connections.max(1))
        .build()
}

/// Client for extractors and JSON service calls.
pub fn build_api_client(config: &DownloadConfig) -> reqwest::Result<reqwest::Client> {
    install_rustls_provider();
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(config.connect_timeout)
        .timeout(config.read_timeout)
        .redirect(redirect::Policy::limited(config.max_redirects))
        .gzip(true)
        .build()
}
