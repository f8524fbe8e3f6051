//! End-to-end capture pipeline tests with a scripted browser and wiremock
//! asset origins.

mod fake_browser;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fake_browser::FakeBrowser;
use page_archiver::capture::rewriter::{rewrite_html, UrlMap};
use page_archiver::capture::{Archiver, CaptureOptions};
use page_archiver::config::Config;
use page_archiver::jobs::test_crawl::TestCrawlManager;
use page_archiver::jobs::{CaptureJob, JobStatus, JobTracker};
use page_archiver::storage::{CaptureMetadata, CaptureStore};

async fn build_archiver(browser: FakeBrowser, base_dir: &Path) -> Archiver {
    let config = Config::for_testing(base_dir);
    let store = Arc::new(CaptureStore::new(&config.storage_dir));
    store.initialize().await.expect("store init");
    let browser: Arc<dyn page_archiver::browser::Browser> = Arc::new(browser);
    let tracker = Arc::new(JobTracker::new(config.max_concurrent_jobs));
    let crawls = Arc::new(TestCrawlManager::new(Arc::clone(&browser)));
    Archiver::new(config, browser, tracker, store, crawls)
}

async fn wait_for_job(archiver: &Archiver, job_id: &str) -> CaptureJob {
    for _ in 0..600 {
        let job = archiver.tracker().get_job(job_id).await.expect("job exists");
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job {job_id} did not finish in time");
}

async fn mount_asset(server: &MockServer, route: &str, content_type: &str, body: &[u8]) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", content_type)
                .set_body_bytes(body.to_vec()),
        )
        .mount(server)
        .await;
}

async fn read_metadata(capture_dir: &Path) -> CaptureMetadata {
    let bytes = tokio::fs::read(capture_dir.join("metadata.json"))
        .await
        .expect("metadata.json exists");
    serde_json::from_slice(&bytes).expect("metadata parses")
}

#[tokio::test]
async fn test_single_page_capture_with_images_css_and_fonts() {
    let origin = MockServer::start().await;
    let cdn = MockServer::start().await;

    mount_asset(&origin, "/a.png", "image/png", b"png-a").await;
    mount_asset(&cdn, "/b.jpg", "image/jpeg", b"jpg-b").await;
    mount_asset(&cdn, "/b@2x.jpg", "image/jpeg", b"jpg-b2x").await;
    mount_asset(
        &origin,
        "/s.css",
        "text/css",
        br#"@font-face { font-family: A; src: url("/f.woff2") format("woff2"); } body { margin: 0 }"#,
    )
    .await;
    mount_asset(&origin, "/f.woff2", "font/woff2", b"woff2").await;

    let page_url = format!("{}/article", origin.uri());
    let html = format!(
        r#"<html><head><title>Archive Me</title>
        <link rel="stylesheet" href="/s.css">
        </head><body>
        <img src="/a.png">
        <img src="{cdn}/b.jpg" srcset="{cdn}/b.jpg 1x, {cdn}/b@2x.jpg 2x">
        </body></html>"#,
        cdn = cdn.uri()
    );

    let temp = TempDir::new().unwrap();
    let browser = FakeBrowser::new().with_page(&page_url, &html);
    let archiver = build_archiver(browser, temp.path()).await;

    let job_id = archiver
        .start_capture(&page_url, CaptureOptions::default())
        .await
        .unwrap();
    let job = wait_for_job(&archiver, &job_id).await;

    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);
    let capture_dir = job.output_path.expect("output path set");

    // Rewritten references
    let index_html = tokio::fs::read_to_string(capture_dir.join("index.html"))
        .await
        .unwrap();
    assert!(index_html.contains(r#"src="images/a.png""#), "{index_html}");
    assert!(index_html.contains(r#"src="images/b.jpg""#));
    assert!(index_html.contains(r#"srcset="images/b.jpg 1x, images/b_2x.jpg 2x""#));
    assert!(index_html.contains(r#"href="css/s.css""#));

    // Stylesheet rewritten relative to its bucket
    let css = tokio::fs::read_to_string(capture_dir.join("css/s.css"))
        .await
        .unwrap();
    assert!(css.contains(r#"url("../fonts/f.woff2")"#), "{css}");

    // Archive self-containment: every rewritten reference exists on disk
    for file in [
        "images/a.png",
        "images/b.jpg",
        "images/b_2x.jpg",
        "css/s.css",
        "fonts/f.woff2",
    ] {
        assert!(capture_dir.join(file).is_file(), "missing {file}");
    }

    // Metadata stats
    let metadata = read_metadata(&capture_dir).await;
    assert_eq!(metadata.title, "Archive Me");
    assert_eq!(metadata.stats.images, 2);
    assert_eq!(metadata.stats.stylesheets, 1);
    assert_eq!(metadata.stats.fonts, 1);
    assert_eq!(metadata.stats.scripts, 0);
    assert_eq!(metadata.stats.total_pages, 1);
    assert!(metadata.stats.total_size > 0);

    // Job stats mirror the downloads
    assert_eq!(job.stats.succeeded.get("images"), Some(&3));
    assert_eq!(job.stats.succeeded.get("stylesheets"), Some(&1));
    assert_eq!(job.stats.succeeded.get("fonts"), Some(&1));
    assert!(job.stats.failed.is_empty());

    // Index entry matches the metadata file
    let index: serde_json::Value = serde_json::from_slice(
        &tokio::fs::read(temp.path().join("captures/index.json"))
            .await
            .unwrap(),
    )
    .unwrap();
    let entry = index["captures"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["id"] == metadata.id.as_str())
        .expect("index entry exists");
    assert_eq!(entry["title"], "Archive Me");
    assert_eq!(entry["url"], page_url.as_str());
    assert_eq!(entry["size"], metadata.stats.total_size);
}

#[tokio::test]
async fn test_missing_resources_do_not_fail_the_job() {
    let origin = MockServer::start().await;
    mount_asset(&origin, "/ok.png", "image/png", b"ok").await;
    Mock::given(method("GET"))
        .and(path("/gone.png"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&origin)
        .await;

    let page_url = format!("{}/page", origin.uri());
    let html = r#"<html><head><title>Half</title></head>
        <body><img src="/ok.png"><img src="/gone.png"></body></html>"#;

    let temp = TempDir::new().unwrap();
    let browser = FakeBrowser::new().with_page(&page_url, html);
    let archiver = build_archiver(browser, temp.path()).await;

    let job_id = archiver
        .start_capture(&page_url, CaptureOptions::default())
        .await
        .unwrap();
    let job = wait_for_job(&archiver, &job_id).await;

    assert_eq!(job.status, JobStatus::Completed);
    let failures = job.stats.failed.get("images").expect("failures recorded");
    assert_eq!(failures.len(), 1);
    assert!(failures[0].url.ends_with("/gone.png"));
    assert!(failures[0].error.contains("404"));

    // The good image is archived; the bad reference is left as-is.
    let capture_dir = job.output_path.unwrap();
    let index_html = tokio::fs::read_to_string(capture_dir.join("index.html"))
        .await
        .unwrap();
    assert!(index_html.contains(r#"src="images/ok.png""#));
    assert!(index_html.contains(r#"src="/gone.png""#));
}

#[tokio::test]
async fn test_wikipedia_file_anchor_resolves_to_largest_rendition() {
    let wiki = MockServer::start().await;
    let thumb_250 = "/wikipedia/commons/thumb/a/a9/Example.jpg/250px-Example.jpg";
    let thumb_500 = "/wikipedia/commons/thumb/a/a9/Example.jpg/500px-Example.jpg";
    mount_asset(&wiki, thumb_250, "image/jpeg", b"small").await;
    mount_asset(&wiki, thumb_500, "image/jpeg", b"large").await;

    let page_url = format!("{}/wiki/Article", wiki.uri());
    let html = format!(
        r#"<html><head><title>Wiki</title></head><body>
        <a href="/wiki/File:Example.jpg"><img src="{origin}{thumb_250}"></a>
        <img src="{origin}{thumb_500}">
        </body></html>"#,
        origin = wiki.uri()
    );

    let temp = TempDir::new().unwrap();
    let browser = FakeBrowser::new().with_page(&page_url, &html);
    let archiver = build_archiver(browser, temp.path()).await;

    let job_id = archiver
        .start_capture(&page_url, CaptureOptions::default())
        .await
        .unwrap();
    let job = wait_for_job(&archiver, &job_id).await;

    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);
    let index_html = tokio::fs::read_to_string(job.output_path.unwrap().join("index.html"))
        .await
        .unwrap();
    assert!(
        index_html.contains(r#"href="images/500px-Example.jpg""#),
        "{index_html}"
    );
    assert!(index_html.contains(r#"src="images/250px-Example.jpg""#));
}

#[tokio::test]
async fn test_rewritten_archive_is_a_rewrite_fixed_point() {
    let origin = MockServer::start().await;
    mount_asset(&origin, "/a.png", "image/png", b"png").await;

    let page_url = format!("{}/article", origin.uri());
    let html = r#"<html><body><img src="/a.png"><a href="/about">x</a></body></html>"#;

    let temp = TempDir::new().unwrap();
    let browser = FakeBrowser::new().with_page(&page_url, html);
    let archiver = build_archiver(browser, temp.path()).await;

    let job_id = archiver
        .start_capture(&page_url, CaptureOptions::default())
        .await
        .unwrap();
    let job = wait_for_job(&archiver, &job_id).await;
    assert_eq!(job.status, JobStatus::Completed);

    let saved = tokio::fs::read_to_string(job.output_path.unwrap().join("index.html"))
        .await
        .unwrap();

    let mut url_map = UrlMap::new();
    url_map.insert(format!("{}/a.png", origin.uri()), "images/a.png".to_string());
    let again = rewrite_html(
        &saved,
        &url::Url::parse(&page_url).unwrap(),
        &url_map,
    );
    assert_eq!(saved, again);
}
