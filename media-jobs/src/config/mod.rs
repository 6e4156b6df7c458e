//! Runtime configuration loaded from environment variables.
//!
//! Every variable has a default so a bare `media-jobs worker` runs against a
//! local SQLite file and a local object store.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

const GIB: u64 = 1024 * 1024 * 1024;

/// Source of configuration values. `std::env` in production, a map in tests.
pub trait EnvSource {
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

fn string(env: &dyn EnvSource, key: &str) -> Option<String> {
    env.get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<T: FromStr>(env: &dyn EnvSource, key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match string(env, key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| Error::config(format!("{key}={raw:?}: {e}"))),
        None => Ok(default),
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub database_url: String,
    /// A lock older than this may be taken over by another worker.
    pub lock_timeout: Duration,
    pub default_max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub max_concurrency: usize,
    pub poll_interval: Duration,
    pub watchdog_interval: Duration,
    pub job_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub shutdown_grace: Duration,
    /// Root for per-job scratch directories.
    pub work_dir: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            max_concurrency: 3,
            poll_interval: Duration::from_millis(2_000),
            watchdog_interval: Duration::from_secs(300),
            job_timeout: Duration::from_secs(120 * 60),
            heartbeat_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
            work_dir: std::env::temp_dir().join("media-jobs"),
        }
    }
}

fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    format!("{host}-{}", std::process::id())
}

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub max_bytes_trusted: u64,
    pub max_bytes_untrusted: u64,
    /// Hosts (and their subdomains) whose downloads get the trusted ceiling.
    pub trusted_hosts: Vec<String>,
    pub max_redirects: usize,
    pub parallel_connections: usize,
    /// Below this size the parallel fetcher defers to a single stream.
    pub parallel_min_bytes: u64,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_bytes_trusted: 20 * GIB,
            max_bytes_untrusted: 4 * GIB,
            trusted_hosts: Vec::new(),
            max_redirects: 5,
            parallel_connections: 8,
            parallel_min_bytes: 8 * 1024 * 1024,
            connect_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum StorageBackend {
    Local,
    Memory,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ToolConfig {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub ytdlp: String,
    pub whisper: String,
    pub whisper_model: String,
    pub espeak: String,
    /// Upper bound for any single tool invocation.
    pub tool_timeout: Duration,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            ytdlp: "yt-dlp".to_string(),
            whisper: "whisper".to_string(),
            whisper_model: "base".to_string(),
            espeak: "espeak-ng".to_string(),
            tool_timeout: Duration::from_secs(2 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DubbingConfig {
    pub translate_url: Option<String>,
    pub translate_api_key: Option<String>,
    pub premium_tts_url: Option<String>,
    pub premium_tts_api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub cache_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub download: DownloadConfig,
    pub storage: StorageConfig,
    pub tools: ToolConfig,
    pub dubbing: DubbingConfig,
    pub extractor: ExtractorConfig,
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Load from the process environment, after applying any `.env` file.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_source(&ProcessEnv)
    }

    pub fn from_source(env: &dyn EnvSource) -> Result<Self> {
        let worker_defaults = WorkerConfig::default();
        let download_defaults = DownloadConfig::default();
        let tool_defaults = ToolConfig::default();

        let max_concurrency: usize = parsed(env, "MAX_CONCURRENCY", worker_defaults.max_concurrency)?;
        if max_concurrency == 0 {
            return Err(Error::config("MAX_CONCURRENCY must be at least 1"));
        }

        let lock_timeout = Duration::from_secs(parsed(env, "LOCK_TIMEOUT_SECS", 1_800u64)?);
        let heartbeat_interval = Duration::from_secs(parsed(
            env,
            "HEARTBEAT_INTERVAL_SECS",
            worker_defaults.heartbeat_interval.as_secs(),
        )?);
        if heartbeat_interval >= lock_timeout {
            return Err(Error::config(
                "HEARTBEAT_INTERVAL_SECS must be shorter than LOCK_TIMEOUT_SECS",
            ));
        }

        let max_bytes_trusted = parsed(env, "MAX_DOWNLOAD_BYTES_TRUSTED", download_defaults.max_bytes_trusted)?;
        let max_bytes_untrusted = parsed(
            env,
            "MAX_DOWNLOAD_BYTES_UNTRUSTED",
            download_defaults.max_bytes_untrusted,
        )?;
        if max_bytes_untrusted > max_bytes_trusted {
            return Err(Error::config(
                "MAX_DOWNLOAD_BYTES_UNTRUSTED must not exceed MAX_DOWNLOAD_BYTES_TRUSTED",
            ));
        }

        let trusted_hosts = string(env, "TRUSTED_HOSTS")
            .map(|raw| {
                raw.split(',')
                    .map(|h| h.trim().to_ascii_lowercase())
                    .filter(|h| !h.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let backend: StorageBackend = parsed(env, "STORAGE_BACKEND", StorageBackend::Local)?;

        Ok(Self {
            queue: QueueConfig {
                database_url: string(env, "DATABASE_URL")
                    .unwrap_or_else(|| "sqlite:media-jobs.db?mode=rwc".to_string()),
                lock_timeout,
                default_max_retries: parsed(env, "DEFAULT_MAX_RETRIES", crate::domain::DEFAULT_MAX_RETRIES)?,
            },
            worker: WorkerConfig {
                worker_id: string(env, "WORKER_ID").unwrap_or(worker_defaults.worker_id),
                max_concurrency,
                poll_interval: Duration::from_millis(parsed(env, "POLL_INTERVAL_MS", 2_000u64)?),
                watchdog_interval: Duration::from_secs(parsed(env, "WATCHDOG_INTERVAL_SECS", 300u64)?),
                job_timeout: Duration::from_secs(60 * parsed(env, "JOB_TIMEOUT_MINUTES", 120u64)?),
                heartbeat_interval,
                shutdown_grace: Duration::from_secs(parsed(env, "SHUTDOWN_GRACE_SECS", 30u64)?),
                work_dir: string(env, "WORK_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(worker_defaults.work_dir),
            },
            download: DownloadConfig {
                max_bytes_trusted,
                max_bytes_untrusted,
                trusted_hosts,
                max_redirects: parsed(env, "MAX_REDIRECTS", download_defaults.max_redirects)?,
                parallel_connections: parsed(
                    env,
                    "PARALLEL_CONNECTIONS",
                    download_defaults.parallel_connections,
                )?
                .max(1),
                ..download_defaults
            },
            storage: StorageConfig {
                backend,
                root: string(env, "STORAGE_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./storage")),
            },
            tools: ToolConfig {
                ffmpeg: string(env, "FFMPEG_PATH").unwrap_or(tool_defaults.ffmpeg),
                ffprobe: string(env, "FFPROBE_PATH").unwrap_or(tool_defaults.ffprobe),
                ytdlp: string(env, "YTDLP_PATH").unwrap_or(tool_defaults.ytdlp),
                whisper: string(env, "WHISPER_PATH").unwrap_or(tool_defaults.whisper),
                whisper_model: string(env, "WHISPER_MODEL").unwrap_or(tool_defaults.whisper_model),
                espeak: string(env, "ESPEAK_PATH").unwrap_or(tool_defaults.espeak),
                tool_timeout: tool_defaults.tool_timeout,
            },
            dubbing: DubbingConfig {
                translate_url: string(env, "TRANSLATE_URL"),
                translate_api_key: string(env, "TRANSLATE_API_KEY"),
                premium_tts_url: string(env, "PREMIUM_TTS_URL"),
                premium_tts_api_key: string(env, "PREMIUM_TTS_API_KEY"),
            },
            extractor: ExtractorConfig {
                cache_ttl: Duration::from_secs(parsed(env, "EXTRACTOR_CACHE_TTL_SECS", 600u64)?),
            },
            log_dir: string(env, "LOG_DIR").map(PathBuf::from),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = AppConfig::from_source(&env(&[])).unwrap();
        assert_eq!(cfg.worker.max_concurrency, 3);
        assert_eq!(cfg.worker.shutdown_grace, Duration::from_secs(30));
        assert_eq!(cfg.worker.watchdog_interval, Duration::from_secs(300));
        assert_eq!(cfg.queue.lock_timeout, Duration::from_secs(1_800));
        assert_eq!(cfg.download.max_redirects, 5);
        assert_eq!(cfg.storage.backend, StorageBackend::Local);
        assert_eq!(cfg.tools.ffmpeg, "ffmpeg");
        assert!(cfg.dubbing.premium_tts_url.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = AppConfig::from_source(&env(&[
            ("MAX_CONCURRENCY", "5"),
            ("STORAGE_BACKEND", "memory"),
            ("TRUSTED_HOSTS", "cdn.internal, Assets.Example.com ,"),
            ("JOB_TIMEOUT_MINUTES", "10"),
            ("WORKER_ID", "w-1"),
        ]))
        .unwrap();
        assert_eq!(cfg.worker.max_concurrency, 5);
        assert_eq!(cfg.storage.backend, StorageBackend::Memory);
        assert_eq!(cfg.download.trusted_hosts, vec!["cdn.internal", "assets.example.com"]);
        assert_eq!(cfg.worker.job_timeout, Duration::from_secs(600));
        assert_eq!(cfg.worker.worker_id, "w-1");
    }

    #[test]
    fn invalid_values_are_configuration_errors() {
        let err = AppConfig::from_source(&env(&[("MAX_CONCURRENCY", "many")])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = AppConfig::from_source(&env(&[("MAX_CONCURRENCY", "0")])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = AppConfig::from_source(&env(&[
            ("MAX_DOWNLOAD_BYTES_TRUSTED", "10"),
            ("MAX_DOWNLOAD_BYTES_UNTRUSTED", "20"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
