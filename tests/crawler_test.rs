//! BFS crawl integration tests: discovery sessions, curated captures, and
//! multi-page capture bounds.

mod fake_browser;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use fake_browser::FakeBrowser;
use page_archiver::capture::crawler::DiscoveryOptions;
use page_archiver::capture::{Archiver, CaptureOptions, MultiPageOptions};
use page_archiver::config::Config;
use page_archiver::jobs::test_crawl::{CrawlStatus, TestCrawl, TestCrawlManager};
use page_archiver::jobs::{BatchStatus, JobStatus, JobTracker};
use page_archiver::storage::CaptureStore;

async fn build_archiver(browser: FakeBrowser, base_dir: &Path) -> Archiver {
    let config = Config::for_testing(base_dir);
    let store = Arc::new(CaptureStore::new(&config.storage_dir));
    store.initialize().await.expect("store init");
    let browser: Arc<dyn page_archiver::browser::Browser> = Arc::new(browser);
    let tracker = Arc::new(JobTracker::new(config.max_concurrent_jobs));
    let crawls = Arc::new(TestCrawlManager::new(Arc::clone(&browser)));
    Archiver::new(config, browser, tracker, store, crawls)
}

async fn wait_for_crawl(manager: &TestCrawlManager, crawl_id: &str) -> TestCrawl {
    for _ in 0..600 {
        let crawl = manager.get_status(crawl_id).await.expect("crawl exists");
        if crawl.status != CrawlStatus::Crawling {
            return crawl;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("crawl {crawl_id} did not finish in time");
}

fn page_with_links(title: &str, links: &[&str]) -> String {
    let anchors: String = links
        .iter()
        .map(|l| format!(r#"<a href="{l}">{l}</a>"#))
        .collect();
    format!(
        r#"<html><head><title>{title}</title></head>
        <body><main><p>content</p>{anchors}</main></body></html>"#
    )
}

#[tokio::test]
async fn test_discovery_respects_same_domain_and_max_pages() {
    let browser = FakeBrowser::new()
        .with_page(
            "https://example.test/article",
            &page_with_links("Seed", &["/p2", "https://other.test/x"]),
        )
        .with_page("https://example.test/p2", &page_with_links("P2", &[]))
        .with_page("https://other.test/x", &page_with_links("Offsite", &[]));

    let manager = TestCrawlManager::new(Arc::new(browser));
    let options = DiscoveryOptions {
        depth: 1,
        max_pages: 2,
        same_domain_only: true,
        timeout_ms: 10_000,
    };
    let crawl_id = manager
        .start(&url::Url::parse("https://example.test/article").unwrap(), options)
        .await;

    let crawl = wait_for_crawl(&manager, &crawl_id).await;
    assert_eq!(crawl.status, CrawlStatus::Completed);
    assert_eq!(crawl.progress, 100);

    let urls: Vec<&str> = crawl
        .discovered
        .pages
        .iter()
        .map(|p| p.url.as_str())
        .collect();
    assert_eq!(
        urls,
        vec!["https://example.test/article", "https://example.test/p2"]
    );
    assert_eq!(crawl.discovered.by_depth.get(&0), Some(&1));
    assert_eq!(crawl.discovered.by_depth.get(&1), Some(&1));
    assert!(crawl.discovered.total_estimated_size > 0);

    // No page is visited twice
    let mut sorted = urls.clone();
    sorted.dedup();
    assert_eq!(sorted.len(), urls.len());
}

#[tokio::test]
async fn test_discovery_hierarchical_view_groups_by_depth() {
    let browser = FakeBrowser::new()
        .with_page(
            "https://example.test/",
            &page_with_links("Root", &["/a", "/b"]),
        )
        .with_page("https://example.test/a", &page_with_links("A", &[]))
        .with_page("https://example.test/b", &page_with_links("B", &[]));

    let manager = TestCrawlManager::new(Arc::new(browser));
    let crawl_id = manager
        .start(
            &url::Url::parse("https://example.test/").unwrap(),
            DiscoveryOptions::default(),
        )
        .await;
    wait_for_crawl(&manager, &crawl_id).await;

    let view = manager.get_hierarchical(&crawl_id).await.unwrap();
    assert_eq!(view.levels.len(), 2);
    assert_eq!(view.levels[0].depth, 0);
    assert_eq!(view.levels[0].pages.len(), 1);
    assert_eq!(view.levels[1].depth, 1);
    assert_eq!(view.levels[1].pages.len(), 2);
    assert_eq!(view.by_depth.get(&1), Some(&2));
}

#[tokio::test]
async fn test_discovery_cancellation() {
    // Slow navigation keeps the crawl alive long enough to cancel it.
    let browser = FakeBrowser::new()
        .with_delay(Duration::from_millis(100))
        .with_page(
            "https://example.test/",
            &page_with_links("Root", &["/a", "/b", "/c"]),
        )
        .with_page("https://example.test/a", &page_with_links("A", &["/d"]))
        .with_page("https://example.test/b", &page_with_links("B", &[]))
        .with_page("https://example.test/c", &page_with_links("C", &[]))
        .with_page("https://example.test/d", &page_with_links("D", &[]));

    let manager = TestCrawlManager::new(Arc::new(browser));
    let crawl_id = manager
        .start(
            &url::Url::parse("https://example.test/").unwrap(),
            DiscoveryOptions::default(),
        )
        .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(manager.cancel(&crawl_id).await);

    let crawl = manager.get_status(&crawl_id).await.unwrap();
    assert_eq!(crawl.status, CrawlStatus::Failed);
    assert_eq!(crawl.error.as_deref(), Some("Cancelled by user"));

    // Cancelling a finished crawl is refused
    assert!(!manager.cancel(&crawl_id).await);
}

#[tokio::test]
async fn test_multi_page_capture_bounded_by_max_pages_and_depth() {
    let temp = TempDir::new().unwrap();
    let browser = FakeBrowser::new()
        .with_page(
            "https://example.test/",
            &page_with_links("Root", &["/p2", "/p3"]),
        )
        .with_page(
            "https://example.test/p2",
            // Links back to the root: the visited set must not loop.
            &page_with_links("P2", &["/", "/p4"]),
        )
        .with_page("https://example.test/p3", &page_with_links("P3", &[]))
        .with_page("https://example.test/p4", &page_with_links("P4", &[]));

    let archiver = build_archiver(browser, temp.path()).await;
    let options = CaptureOptions {
        multi_page: MultiPageOptions {
            enabled: true,
            depth: 1,
            max_pages: 2,
            same_domain_only: true,
        },
        ..Default::default()
    };

    let job_id = archiver
        .start_capture("https://example.test/", options)
        .await
        .unwrap();
    let job = loop {
        let job = archiver.tracker().get_job(&job_id).await.unwrap();
        if job.status.is_terminal() {
            break job;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    };

    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);
    assert_eq!(job.stats.total_pages, 2);

    let capture_dir = job.output_path.unwrap();
    assert!(capture_dir.join("index.html").is_file());
    assert!(capture_dir.join("page-2.html").is_file());
    assert!(!capture_dir.join("page-3.html").exists());

    let metadata: serde_json::Value = serde_json::from_slice(
        &tokio::fs::read(capture_dir.join("metadata.json")).await.unwrap(),
    )
    .unwrap();
    assert_eq!(metadata["captureMode"], "multi-page");
    assert_eq!(metadata["stats"]["totalPages"], 2);
}

#[tokio::test]
async fn test_curated_capture_forms_selection_and_completes_batch() {
    let temp = TempDir::new().unwrap();
    let pages = ["p1", "p2", "p3", "p4", "p5", "extra"];
    let mut browser = FakeBrowser::new().with_page(
        "https://example.test/",
        &page_with_links("Root", &["/p1", "/p2", "/p3", "/p4", "/p5"]),
    );
    for name in pages {
        browser = browser.with_page(
            &format!("https://example.test/{name}"),
            &page_with_links(name, &[]),
        );
    }

    let archiver = build_archiver(browser, temp.path()).await;

    // Discovery first: the curated workflow requires a completed crawl.
    let crawl_id = archiver
        .crawls()
        .start(
            &url::Url::parse("https://example.test/").unwrap(),
            DiscoveryOptions::default(),
        )
        .await;
    let crawl = wait_for_crawl(archiver.crawls(), &crawl_id).await;
    assert_eq!(crawl.status, CrawlStatus::Completed);
    assert_eq!(crawl.discovered.pages.len(), 6);

    // selected ∪ additional minus excluded = {p3, extra}
    let batch = archiver
        .capture_curated(
            &crawl_id,
            vec![
                "https://example.test/p1".to_string(),
                "https://example.test/p3".to_string(),
            ],
            vec!["https://example.test/extra".to_string()],
            vec!["https://example.test/p1".to_string()],
            CaptureOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(batch.summary.total, 2);
    let urls: Vec<&str> = batch.jobs.iter().map(|m| m.url.as_str()).collect();
    assert_eq!(
        urls,
        vec!["https://example.test/p3", "https://example.test/extra"]
    );

    // Batch reaches completed as members finish
    let final_batch = loop {
        let current = archiver.tracker().get_batch(&batch.batch_id).await.unwrap();
        match current.status {
            BatchStatus::Completed | BatchStatus::Partial | BatchStatus::Failed => break current,
            _ => tokio::time::sleep(Duration::from_millis(25)).await,
        }
    };
    assert_eq!(final_batch.status, BatchStatus::Completed);
    assert_eq!(final_batch.summary.completed, 2);
    assert_eq!(final_batch.progress, 100);

    // The batch ZIP bundles both captures with a manifest
    let zip_bytes = archiver.export_batch_zip(&batch.batch_id).await.unwrap();
    assert!(!zip_bytes.is_empty());
    let reader = std::io::Cursor::new(zip_bytes);
    let mut zip = zip::ZipArchive::new(reader).unwrap();
    let names: Vec<String> = (0..zip.len())
        .map(|i| zip.by_index(i).unwrap().name().to_string())
        .collect();
    assert!(names.iter().any(|n| n == "manifest.json"));
    assert!(names.iter().any(|n| n.starts_with("example.test-") && n.ends_with("index.html")));
}

#[tokio::test]
async fn test_curated_capture_requires_completed_crawl() {
    let temp = TempDir::new().unwrap();
    let browser = FakeBrowser::new()
        .with_delay(Duration::from_millis(200))
        .with_page("https://example.test/", &page_with_links("Root", &[]));
    let archiver = build_archiver(browser, temp.path()).await;

    let crawl_id = archiver
        .crawls()
        .start(
            &url::Url::parse("https://example.test/").unwrap(),
            DiscoveryOptions::default(),
        )
        .await;

    // Still crawling
    let result = archiver
        .capture_curated(
            &crawl_id,
            vec!["https://example.test/".to_string()],
            vec![],
            vec![],
            CaptureOptions::default(),
        )
        .await;
    assert!(result.is_err());

    // Unknown crawl id
    let result = archiver
        .capture_curated(
            "no-such-crawl",
            vec!["https://example.test/".to_string()],
            vec![],
            vec![],
            CaptureOptions::default(),
        )
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_failed_member_yields_partial_batch() {
    let temp = TempDir::new().unwrap();
    let browser = FakeBrowser::new()
        .with_page("https://example.test/good", &page_with_links("Good", &[]));
    // "https://example.test/dead" is not registered: navigation fails.

    let archiver = build_archiver(browser, temp.path()).await;
    let batch = archiver
        .capture_multi(
            vec![
                "https://example.test/good".to_string(),
                "https://example.test/dead".to_string(),
            ],
            CaptureOptions::default(),
        )
        .await
        .unwrap();

    let final_batch = loop {
        let current = archiver.tracker().get_batch(&batch.batch_id).await.unwrap();
        match current.status {
            BatchStatus::Completed | BatchStatus::Partial | BatchStatus::Failed => break current,
            _ => tokio::time::sleep(Duration::from_millis(25)).await,
        }
    };

    assert_eq!(final_batch.status, BatchStatus::Partial);
    assert_eq!(final_batch.summary.completed, 1);
    assert_eq!(final_batch.summary.failed, 1);

    // The failed member's job carries its own error
    let failed_member = final_batch
        .jobs
        .iter()
        .find(|m| m.url.ends_with("/dead"))
        .unwrap();
    let failed_job = archiver
        .tracker()
        .get_job(&failed_member.job_id)
        .await
        .unwrap();
    assert_eq!(failed_job.status, JobStatus::Failed);
    assert!(failed_job.error.is_some());
}
