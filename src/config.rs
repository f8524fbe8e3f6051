use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Capture pipeline
    /// Maximum capture jobs running at once.
    pub max_concurrent_jobs: usize,
    /// Page-actions processed in parallel by the multi-page crawler.
    pub crawler_concurrency: usize,
    /// Resource downloads per batch within a page.
    pub download_concurrency: usize,
    /// Minimum spacing between requests to the same domain.
    pub rate_limit_min_delay: Duration,

    // Storage
    /// Base directory holding `captures/`.
    pub storage_dir: PathBuf,
    /// Scratch directory for in-flight downloads.
    pub temp_dir: PathBuf,

    // Browser
    /// Path to Chrome/Chromium executable (None for auto-detection).
    pub chrome_path: Option<String>,

    // Retention
    pub job_retention: Duration,
    pub crawl_retention: Duration,
    pub temp_retention: Duration,
    pub cleanup_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a set variable fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            max_concurrent_jobs: parse_env_usize("MAX_CONCURRENT_JOBS", 3)?,
            crawler_concurrency: parse_env_usize("CRAWLER_CONCURRENCY", 3)?,
            download_concurrency: parse_env_usize("DOWNLOAD_CONCURRENCY", 5)?,
            rate_limit_min_delay: Duration::from_millis(parse_env_u64(
                "RATE_LIMIT_MIN_DELAY_MS",
                1000,
            )?),

            storage_dir: PathBuf::from(env_or_default("STORAGE_DIR", "./data")),
            temp_dir: PathBuf::from(env_or_default("TEMP_DIR", "./data/tmp")),

            chrome_path: optional_env("CHROME_PATH"),

            job_retention: Duration::from_secs(parse_env_u64("JOB_RETENTION_HOURS", 24 * 7)? * 3600),
            crawl_retention: Duration::from_secs(
                parse_env_u64("CRAWL_RETENTION_HOURS", 24 * 2)? * 3600,
            ),
            temp_retention: Duration::from_secs(parse_env_u64("TEMP_RETENTION_HOURS", 24)? * 3600),
            cleanup_interval: Duration::from_secs(parse_env_u64("CLEANUP_INTERVAL_SECS", 3600)?),
        })
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::InvalidValue {
                name: "MAX_CONCURRENT_JOBS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.crawler_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                name: "CRAWLER_CONCURRENCY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.download_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                name: "DOWNLOAD_CONCURRENCY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.rate_limit_min_delay.is_zero() {
            return Err(ConfigError::InvalidValue {
                name: "RATE_LIMIT_MIN_DELAY_MS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Configuration for tests: small limits, no rate-limit sleeps beyond 1 ms.
    #[must_use]
    pub fn for_testing(base_dir: &std::path::Path) -> Self {
        Self {
            max_concurrent_jobs: 3,
            crawler_concurrency: 3,
            download_concurrency: 5,
            rate_limit_min_delay: Duration::from_millis(1),
            storage_dir: base_dir.to_path_buf(),
            temp_dir: base_dir.join("tmp"),
            chrome_path: None,
            job_retention: Duration::from_secs(3600),
            crawl_retention: Duration::from_secs(3600),
            temp_retention: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_or_default(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::for_testing(std::path::Path::new("/tmp/pa-test"));
        assert!(config.validate().is_ok());
        assert_eq!(config.max_concurrent_jobs, 3);
        assert_eq!(config.download_concurrency, 5);
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = Config::for_testing(std::path::Path::new("/tmp/pa-test"));
        config.max_concurrent_jobs = 0;
        assert!(config.validate().is_err());
    }
}
