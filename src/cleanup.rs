//! Retention sweeps for finished jobs, crawls, and temp files.
//!
//! Kept outside the core components; the service is handed its
//! collaborators and runs on its own interval from `main`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::jobs::test_crawl::TestCrawlManager;
use crate::jobs::JobTracker;

/// Periodic cleanup of aged artifacts.
pub struct CleanupService {
    tracker: Arc<JobTracker>,
    crawls: Arc<TestCrawlManager>,
    temp_dir: PathBuf,
    job_retention: Duration,
    crawl_retention: Duration,
    temp_retention: Duration,
    interval: Duration,
}

impl CleanupService {
    #[must_use]
    pub fn new(config: &Config, tracker: Arc<JobTracker>, crawls: Arc<TestCrawlManager>) -> Self {
        Self {
            tracker,
            crawls,
            temp_dir: config.temp_dir.clone(),
            job_retention: config.job_retention,
            crawl_retention: config.crawl_retention,
            temp_retention: config.temp_retention,
            interval: config.cleanup_interval,
        }
    }

    /// Run sweeps forever on the configured interval.
    pub async fn run_loop(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep_once().await;
        }
    }

    /// One full sweep across jobs, batches, crawls, and temp files.
    pub async fn sweep_once(&self) {
        let jobs = self.tracker.cleanup_old_jobs(self.job_retention).await;
        let batches = self.tracker.cleanup_old_batches(self.job_retention).await;
        let crawls = self.crawls.cleanup(self.crawl_retention).await;
        let temp = match sweep_temp_dir(&self.temp_dir, self.temp_retention).await {
            Ok(count) => count,
            Err(e) => {
                warn!("Temp sweep failed: {e:#}");
                0
            }
        };

        if jobs + batches + crawls + temp > 0 {
            info!(jobs, batches, crawls, temp, "Cleanup sweep removed aged artifacts");
        } else {
            debug!("Cleanup sweep found nothing to remove");
        }
    }
}

/// Remove top-level temp entries whose modification time exceeds `max_age`.
pub async fn sweep_temp_dir(temp_dir: &std::path::Path, max_age: Duration) -> Result<usize> {
    let mut entries = match fs::read_dir(temp_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to read temp dir: {}", temp_dir.display()));
        }
    };

    let now = std::time::SystemTime::now();
    let mut removed = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        let aged = now
            .duration_since(modified)
            .map(|elapsed| elapsed > max_age)
            .unwrap_or(false);
        if !aged {
            continue;
        }

        let result = if metadata.is_dir() {
            fs::remove_dir_all(&path).await
        } else {
            fs::remove_file(&path).await
        };
        match result {
            Ok(()) => {
                debug!(path = %path.display(), "Removed aged temp entry");
                removed += 1;
            }
            Err(e) => warn!(path = %path.display(), "Failed to remove temp entry: {e}"),
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sweep_missing_dir_is_noop() {
        let missing = std::env::temp_dir().join("pa-sweep-does-not-exist");
        assert_eq!(
            sweep_temp_dir(&missing, Duration::from_secs(60)).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_sweep_removes_only_aged_entries() {
        let dir = std::env::temp_dir().join(format!("pa-sweep-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).await.unwrap();
        fs::write(dir.join("fresh.bin"), b"x").await.unwrap();

        // Nothing is older than an hour
        assert_eq!(
            sweep_temp_dir(&dir, Duration::from_secs(3600)).await.unwrap(),
            0
        );
        // Everything is older than zero seconds
        assert_eq!(
            sweep_temp_dir(&dir, Duration::from_secs(0)).await.unwrap(),
            1
        );

        fs::remove_dir_all(&dir).await.unwrap();
    }
}
