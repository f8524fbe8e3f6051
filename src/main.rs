use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use page_archiver::browser::ChromiumBrowser;
use page_archiver::capture::{Archiver, CaptureOptions};
use page_archiver::cleanup::CleanupService;
use page_archiver::config::Config;
use page_archiver::jobs::test_crawl::TestCrawlManager;
use page_archiver::jobs::{JobStatus, JobTracker};
use page_archiver::storage::CaptureStore;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    init_tracing()?;

    info!("Starting page-archiver");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    info!(
        storage = %config.storage_dir.display(),
        max_concurrent = config.max_concurrent_jobs,
        "Configuration loaded"
    );

    // Ensure data directories exist
    tokio::fs::create_dir_all(&config.storage_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create storage directory: {}",
                config.storage_dir.display()
            )
        })?;
    tokio::fs::create_dir_all(&config.temp_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create temp directory: {}",
                config.temp_dir.display()
            )
        })?;

    let store = Arc::new(CaptureStore::new(&config.storage_dir));
    store
        .initialize()
        .await
        .context("Failed to initialize capture store")?;

    let browser = Arc::new(ChromiumBrowser::new(config.chrome_path.clone()));
    let tracker = Arc::new(JobTracker::new(config.max_concurrent_jobs));
    let crawls = Arc::new(TestCrawlManager::new(browser.clone()));

    let archiver = Archiver::new(
        config.clone(),
        browser,
        Arc::clone(&tracker),
        Arc::clone(&store),
        Arc::clone(&crawls),
    );

    // Start the retention sweeper in the background
    let cleanup = CleanupService::new(&config, Arc::clone(&tracker), Arc::clone(&crawls));
    let cleanup_handle = tokio::spawn(async move {
        cleanup.run_loop().await;
    });

    // URLs on the command line are captured immediately; otherwise the
    // service idles, driven by whatever queues requests into the archiver.
    let urls: Vec<String> = std::env::args().skip(1).collect();
    if urls.is_empty() {
        info!("No URLs given; running as a service until interrupted");
        shutdown_signal().await;
    } else {
        capture_urls(&archiver, urls).await?;
    }

    info!("Shutting down...");
    cleanup_handle.abort();
    archiver.shutdown().await;
    info!("Shutdown complete");

    Ok(())
}

/// Capture each URL and wait for the jobs to finish.
async fn capture_urls(archiver: &Archiver, urls: Vec<String>) -> Result<()> {
    let mut job_ids = Vec::new();
    for url in urls {
        let job_id = archiver
            .start_capture(&url, CaptureOptions::default())
            .await
            .with_context(|| format!("Failed to start capture for {url}"))?;
        info!(job_id = %job_id, url = %url, "Capture started");
        job_ids.push(job_id);
    }

    for job_id in job_ids {
        loop {
            let Some(job) = archiver.tracker().get_job(&job_id).await else {
                break;
            };
            if job.status.is_terminal() {
                match job.status {
                    JobStatus::Completed => {
                        let path = job
                            .output_path
                            .map(|p| p.display().to_string())
                            .unwrap_or_default();
                        info!(job_id = %job_id, path = %path, "Capture finished");
                    }
                    _ => {
                        error!(
                            job_id = %job_id,
                            error = %job.error.unwrap_or_default(),
                            "Capture failed"
                        );
                    }
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,page_archiver=debug"));

    // Check if JSON logging is requested
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| matches!(v.to_lowercase().as_str(), "json" | "structured"))
        .unwrap_or(false);

    if use_json {
        // Structured JSON logging for production
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    } else {
        // Pretty-printed logging for development
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
