//! Top-level capture workflows: single page, multi-URL batches, and
//! curated captures built from a completed test crawl.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::browser::Browser;
use crate::config::Config;
use crate::jobs::test_crawl::{CrawlStatus, TestCrawlManager};
use crate::jobs::{BatchJob, JobStatus, JobTracker};
use crate::storage::export::{export_batch, BatchExportMember};
use crate::storage::{CaptureMode, CaptureRecordStats, CaptureStore, SaveCapture};

use super::crawler::{BfsCrawler, CapturedPage};
use super::downloader::ResourceDownloader;
use super::extractor::extract_font_urls;
use super::rate_limiter::DomainRateLimiter;
use super::rewriter::{self, UrlMap};
use super::{CaptureOptions, ResourceKind};

/// Poll interval while waiting for a free job slot.
const START_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// The capture orchestrator. Owns the shared browser and wires the
/// crawler, downloader, rewriter, store, and trackers into jobs.
///
/// Cloning is cheap; all state is shared.
#[derive(Clone)]
pub struct Archiver {
    config: Config,
    browser: Arc<dyn Browser>,
    tracker: Arc<JobTracker>,
    store: Arc<CaptureStore>,
    crawls: Arc<TestCrawlManager>,
    rate_limiter: Arc<DomainRateLimiter>,
}

impl Archiver {
    #[must_use]
    pub fn new(
        config: Config,
        browser: Arc<dyn Browser>,
        tracker: Arc<JobTracker>,
        store: Arc<CaptureStore>,
        crawls: Arc<TestCrawlManager>,
    ) -> Self {
        let rate_limiter = Arc::new(DomainRateLimiter::new(config.rate_limit_min_delay));
        Self {
            config,
            browser,
            tracker,
            store,
            crawls,
            rate_limiter,
        }
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<JobTracker> {
        &self.tracker
    }

    #[must_use]
    pub fn crawls(&self) -> &Arc<TestCrawlManager> {
        &self.crawls
    }

    #[must_use]
    pub fn store(&self) -> &Arc<CaptureStore> {
        &self.store
    }

    /// Start a capture job for `url`. Returns the job id immediately; the
    /// work runs in the background gated by the job concurrency limit.
    ///
    /// # Errors
    ///
    /// Returns an error only when `url` does not parse; everything later
    /// is reported through the job.
    pub async fn start_capture(&self, url: &str, options: CaptureOptions) -> Result<String> {
        let seed = Url::parse(url).with_context(|| format!("Invalid capture URL: {url}"))?;
        let options = options.normalized();
        let job = self.tracker.create_job(seed.as_str(), options.clone()).await;
        let job_id = job.id.clone();

        let this = self.clone();
        let spawn_id = job_id.clone();
        tokio::spawn(async move {
            this.run_capture_job(&spawn_id, seed, options).await;
        });

        Ok(job_id)
    }

    /// Capture a set of URLs as a batch of single-page jobs.
    ///
    /// Per-URL failures never abort the batch; the summary reflects
    /// partial completion.
    pub async fn capture_multi(
        &self,
        urls: Vec<String>,
        options: CaptureOptions,
    ) -> Result<BatchJob> {
        let mut options = options.normalized();
        // Batch members are single-page captures by contract.
        options.multi_page.enabled = false;

        let mut seeds = Vec::new();
        let mut seen = HashSet::new();
        for url in urls {
            let seed =
                Url::parse(&url).with_context(|| format!("Invalid capture URL: {url}"))?;
            if seen.insert(seed.to_string()) {
                seeds.push(seed);
            }
        }
        if seeds.is_empty() {
            anyhow::bail!("No URLs to capture");
        }

        let mut members = Vec::new();
        let mut spawned = Vec::new();
        for seed in seeds {
            let job = self.tracker.create_job(seed.as_str(), options.clone()).await;
            members.push((job.id.clone(), seed.to_string()));
            spawned.push((job.id, seed));
        }

        let batch = self.tracker.create_batch(members).await;
        info!(batch_id = %batch.batch_id, jobs = spawned.len(), "Batch created");

        for (job_id, seed) in spawned {
            let this = self.clone();
            let batch_id = batch.batch_id.clone();
            let member_options = options.clone();
            tokio::spawn(async move {
                this.tracker
                    .update_batch_member(&batch_id, &job_id, JobStatus::Processing)
                    .await;
                this.run_capture_job(&job_id, seed, member_options).await;

                let terminal = this
                    .tracker
                    .get_job(&job_id)
                    .await
                    .map_or(JobStatus::Failed, |job| job.status);
                this.tracker
                    .update_batch_member(&batch_id, &job_id, terminal)
                    .await;
            });
        }

        Ok(batch)
    }

    /// Capture the curated selection of a completed test crawl:
    /// unique(selected ∪ additional) minus excluded.
    pub async fn capture_curated(
        &self,
        crawl_id: &str,
        selected: Vec<String>,
        additional: Vec<String>,
        excluded: Vec<String>,
        options: CaptureOptions,
    ) -> Result<BatchJob> {
        let crawl = self
            .crawls
            .get_status(crawl_id)
            .await
            .with_context(|| format!("Test crawl not found: {crawl_id}"))?;
        if crawl.status != CrawlStatus::Completed {
            anyhow::bail!(
                "Test crawl {crawl_id} is not completed (status: {:?})",
                crawl.status
            );
        }

        let excluded: HashSet<String> = excluded.into_iter().collect();
        let mut urls = Vec::new();
        let mut seen = HashSet::new();
        for url in selected.into_iter().chain(additional) {
            if excluded.contains(&url) {
                continue;
            }
            if seen.insert(url.clone()) {
                urls.push(url);
            }
        }
        if urls.is_empty() {
            anyhow::bail!("Curated selection is empty");
        }

        debug!(crawl_id, urls = urls.len(), "Curated capture selection formed");
        self.capture_multi(urls, options).await
    }

    /// Build the batch export ZIP from its completed member captures.
    pub async fn export_batch_zip(&self, batch_id: &str) -> Result<Vec<u8>> {
        let batch = self
            .tracker
            .get_batch(batch_id)
            .await
            .with_context(|| format!("Batch not found: {batch_id}"))?;

        let mut members = Vec::new();
        for member in &batch.jobs {
            let Some(job) = self.tracker.get_job(&member.job_id).await else {
                continue;
            };
            if let Some(output_path) = job.output_path {
                members.push(BatchExportMember {
                    job_id: member.job_id.clone(),
                    url: member.url.clone(),
                    capture_dir: output_path,
                });
            }
        }
        if members.is_empty() {
            anyhow::bail!("Batch {batch_id} has no completed captures to export");
        }

        export_batch(&batch, members).await
    }

    /// Close the shared browser.
    pub async fn shutdown(&self) {
        if let Err(e) = self.browser.shutdown().await {
            error!("Browser shutdown failed: {e:#}");
        }
    }

    /// Drive one capture job to its terminal state.
    async fn run_capture_job(&self, job_id: &str, seed: Url, options: CaptureOptions) {
        // Wait for a slot under the concurrency gate.
        while !self.tracker.start_job(job_id).await {
            if self.tracker.get_job(job_id).await.is_none() {
                return; // cleaned up while waiting
            }
            tokio::time::sleep(START_POLL_INTERVAL).await;
        }

        let temp_dir = self.config.temp_dir.join(job_id);
        let result = self
            .run_capture_inner(job_id, &seed, &options, &temp_dir)
            .await;

        match result {
            Ok(output_path) => {
                self.tracker.complete_job(job_id, output_path).await;
            }
            Err(e) => {
                error!(job_id, url = %seed, "Capture failed: {e:#}");
                self.tracker.fail_job(job_id, &format!("{e:#}")).await;
            }
        }

        if let Err(e) = tokio::fs::remove_dir_all(&temp_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(job_id, "Failed to clean up temp directory: {e}");
            }
        }
    }

    async fn run_capture_inner(
        &self,
        job_id: &str,
        seed: &Url,
        options: &CaptureOptions,
        temp_dir: &std::path::Path,
    ) -> Result<PathBuf> {
        self.tracker.update_step(job_id, "initializing").await;
        self.tracker.update_progress(job_id, 5).await;

        let user_agent = options
            .user_agent
            .clone()
            .unwrap_or_else(|| crate::constants::random_user_agent().to_string());
        let downloader = ResourceDownloader::new(
            Some(seed.clone()),
            temp_dir.to_path_buf(),
            Arc::clone(&self.rate_limiter),
            &user_agent,
            self.config.download_concurrency,
        )?;

        // Crawl phase: 5..50% of job progress.
        self.tracker.update_step(job_id, "loading pages").await;
        let (progress_tx, mut progress_rx) =
            tokio::sync::mpsc::unbounded_channel::<(usize, usize)>();
        let progress_tracker = Arc::clone(&self.tracker);
        let progress_job = job_id.to_string();
        let progress_task = tokio::spawn(async move {
            while let Some((done, total)) = progress_rx.recv().await {
                let pct = 5 + ((45 * done) / total.max(1)).min(45) as u8;
                progress_tracker.update_progress(&progress_job, pct).await;
                progress_tracker
                    .with_stats(&progress_job, |stats| {
                        stats.pages_processed = done;
                        stats.total_pages = total;
                    })
                    .await;
            }
        });

        let crawler = BfsCrawler::new(self.browser.as_ref());
        let crawl_result = crawler
            .capture(seed, options, self.config.crawler_concurrency, |done, total| {
                let _ = progress_tx.send((done, total));
            })
            .await;
        drop(progress_tx);
        let _ = progress_task.await;

        let mut pages = crawl_result.context("Crawl failed")?;
        let seed_ok = pages.first().is_some_and(|p| p.success);
        if !seed_ok {
            anyhow::bail!("Failed to load page: {seed}");
        }
        pages.retain(|p| p.success);

        self.tracker
            .with_stats(job_id, |stats| {
                stats.pages_processed = pages.len();
                stats.total_pages = pages.len();
            })
            .await;

        // Font URLs come from stylesheet text, fetched but not persisted.
        self.tracker.update_step(job_id, "extracting resources").await;
        for page in &mut pages {
            let Ok(page_url) = Url::parse(&page.url) else {
                continue;
            };
            page.resources.fonts =
                extract_font_urls(&downloader, &page.resources, &page_url).await;
        }
        self.tracker.update_progress(job_id, 55).await;

        // Download everything before any rewriting; the URL map must be
        // complete when the first page is rewritten.
        self.tracker.update_step(job_id, "downloading resources").await;
        let requests = collect_download_requests(&pages);
        let total_resources = requests.len();
        let stylesheet_count = count_kind(&requests, ResourceKind::Stylesheet);
        let script_count = count_kind(&requests, ResourceKind::Script);
        let font_count = count_kind(&requests, ResourceKind::Font);
        self.tracker
            .with_stats(job_id, |stats| stats.total_resources = total_resources)
            .await;

        let outcome = downloader.download_batch(requests).await;
        self.tracker
            .with_stats(job_id, |stats| {
                for descriptor in &outcome.succeeded {
                    stats.record_success(descriptor.kind.stat_key());
                }
                for failure in &outcome.failed {
                    stats.record_failure(failure.kind.stat_key(), &failure.url, &failure.error);
                }
            })
            .await;
        debug!(
            job_id,
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "Resource downloads finished"
        );
        self.tracker.update_progress(job_id, 80).await;

        let url_map: UrlMap = outcome
            .succeeded
            .iter()
            .map(|d| (d.url.clone(), d.archive_path()))
            .collect();

        // Rewrite HTML, then stylesheets (which may reference other
        // downloaded resources).
        self.tracker.update_step(job_id, "rewriting pages").await;
        let mut rewritten_pages = Vec::with_capacity(pages.len());
        for page in &pages {
            let Ok(page_url) = Url::parse(&page.url) else {
                continue;
            };
            rewritten_pages.push(rewriter::rewrite_html(&page.html, &page_url, &url_map));
        }

        for descriptor in &outcome.succeeded {
            if descriptor.kind != ResourceKind::Stylesheet {
                continue;
            }
            let Ok(sheet_url) = Url::parse(&descriptor.url) else {
                continue;
            };
            match tokio::fs::read_to_string(&descriptor.local_path).await {
                Ok(css) => {
                    let rewritten = rewriter::rewrite_css(&css, &sheet_url, &url_map);
                    if let Err(e) =
                        tokio::fs::write(&descriptor.local_path, rewritten).await
                    {
                        warn!(job_id, url = %descriptor.url, "Failed to write rewritten stylesheet: {e}");
                    }
                }
                Err(e) => {
                    // Binary or unreadable stylesheet: archive it as-is.
                    debug!(job_id, url = %descriptor.url, "Stylesheet not rewritten: {e}");
                }
            }
        }
        self.tracker.update_progress(job_id, 90).await;

        self.tracker.update_step(job_id, "saving capture").await;
        let title = pages
            .first()
            .and_then(|p| p.title.clone())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| seed.to_string());
        let capture_mode = if options.multi_page.enabled && pages.len() > 1 {
            CaptureMode::MultiPage
        } else {
            CaptureMode::SinglePage
        };

        let mut page_htmls = rewritten_pages.into_iter();
        let index_html = page_htmls.next().unwrap_or_default();
        let extra_pages: Vec<(String, String)> = page_htmls
            .enumerate()
            .map(|(i, html)| (format!("page-{}.html", i + 2), html))
            .collect();

        let record_stats = CaptureRecordStats {
            total_pages: pages.len(),
            images: pages.iter().map(|p| p.resources.image_elements).sum(),
            stylesheets: stylesheet_count,
            scripts: script_count,
            fonts: font_count,
            total_size: 0,
        };

        let metadata = self
            .store
            .save_capture(SaveCapture {
                url: seed.to_string(),
                title,
                html: index_html,
                extra_pages,
                resources: outcome.succeeded,
                capture_mode,
                stats: record_stats,
            })
            .await
            .context("Failed to persist capture")?;

        info!(
            job_id,
            capture_id = %metadata.id,
            url = %seed,
            pages = metadata.stats.total_pages,
            size = metadata.stats.total_size,
            "Capture complete"
        );

        Ok(self.store.captures_dir().join(&metadata.id))
    }
}

fn count_kind(requests: &[(String, ResourceKind)], kind: ResourceKind) -> usize {
    requests.iter().filter(|(_, k)| *k == kind).count()
}

/// Unique download requests across all pages: images, stylesheets,
/// scripts, fonts, and the seed page's favicon.
fn collect_download_requests(pages: &[CapturedPage]) -> Vec<(String, ResourceKind)> {
    let mut requests = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |url: &String, kind: ResourceKind, requests: &mut Vec<(String, ResourceKind)>| {
        if seen.insert(url.clone()) {
            requests.push((url.clone(), kind));
        }
    };

    for (page_index, page) in pages.iter().enumerate() {
        for url in &page.resources.images {
            push(url, ResourceKind::Image, &mut requests);
        }
        for url in &page.resources.stylesheets {
            push(url, ResourceKind::Stylesheet, &mut requests);
        }
        for url in &page.resources.scripts {
            push(url, ResourceKind::Script, &mut requests);
        }
        for url in &page.resources.fonts {
            push(url, ResourceKind::Font, &mut requests);
        }
        if page_index == 0 {
            if let Some(ref favicon) = page.resources.favicon {
                push(favicon, ResourceKind::Favicon, &mut requests);
            }
        }
    }

    requests
}
