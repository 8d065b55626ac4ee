use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Hard cap on a single downloaded artifact.
pub const MAX_ARTIFACT_BYTES: u64 = 8 * 1024 * 1024 * 1024;

/// Attempts per chunk before the download is declared failed.
pub const CHUNK_RETRIES: u32 = 3;

/// Fixed delay between chunk retry attempts.
pub const CHUNK_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Wall-clock budget for one download task.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(8 * 60 * 60);

/// Interval of the progress/speed ticker.
pub const PROGRESS_TICK: Duration = Duration::from_millis(500);

pub const MIN_DOWNLOAD_THREADS: u32 = 1;
pub const MAX_DOWNLOAD_THREADS: u32 = 32;
pub const DEFAULT_DOWNLOAD_THREADS: u32 = 8;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub public_base_url: Option<String>,
    pub disable_https_redirect: bool,
    pub auto_cleanup_days: u32,
    pub auto_cleanup_max_mb: u64,
    pub max_download_mb: u64,
    pub download_threads: u32,
    pub access_password: Option<String>,
    pub build_commit: String,
    pub build_date: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            data_dir: PathBuf::from("./data"),
            public_base_url: None,
            disable_https_redirect: false,
            auto_cleanup_days: 0,
            auto_cleanup_max_mb: 0,
            max_download_mb: 0,
            download_threads: DEFAULT_DOWNLOAD_THREADS,
            access_password: None,
            build_commit: "unknown".to_string(),
            build_date: "unknown".to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parse("PORT").unwrap_or(defaults.port),
            data_dir: env::var("DATA_DIR")
                .ok()
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            public_base_url: env_string("PUBLIC_BASE_URL"),
            disable_https_redirect: env_truthy("UNSAFE_DANGEROUSLY_DISABLE_HTTPS_REDIRECT"),
            auto_cleanup_days: env_parse("AUTO_CLEANUP_DAYS").unwrap_or(0),
            auto_cleanup_max_mb: env_parse("AUTO_CLEANUP_MAX_MB").unwrap_or(0),
            max_download_mb: env_parse("MAX_DOWNLOAD_MB").unwrap_or(0),
            download_threads: clamp_threads(
                env_parse("DOWNLOAD_THREADS").unwrap_or(DEFAULT_DOWNLOAD_THREADS),
            ),
            access_password: env_string("ACCESS_PASSWORD"),
            build_commit: env_string("BUILD_COMMIT").unwrap_or(defaults.build_commit),
            build_date: env_string("BUILD_DATE").unwrap_or(defaults.build_date),
        }
    }

    pub fn max_download_bytes(&self) -> Option<u64> {
        if self.max_download_mb > 0 {
            Some(self.max_download_mb * 1024 * 1024)
        } else {
            None
        }
    }
}

pub fn clamp_threads(value: u32) -> u32 {
    value.clamp(MIN_DOWNLOAD_THREADS, MAX_DOWNLOAD_THREADS)
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

fn env_truthy(key: &str) -> bool {
    env::var(key)
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
        })
        .unwrap_or(false)
}
