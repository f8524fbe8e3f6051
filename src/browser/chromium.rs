//! chromiumoxide-backed implementation of the browser capability.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser as CdpBrowser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams as FetchEnableParams, EventRequestPaused,
    FailRequestParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    ErrorReason, ResourceType, SetUserAgentOverrideParams,
};
use chromiumoxide::page::Page;
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{Browser, BrowserPage, InterceptPolicy, WaitUntil};

/// Default viewport width in pixels.
const VIEWPORT_WIDTH: u32 = 1280;

/// Default viewport height in pixels.
const VIEWPORT_HEIGHT: u32 = 800;

/// Settle time after navigation for late-rendering content.
const RENDER_SETTLE: Duration = Duration::from_millis(500);

/// Shared headless Chrome/Chromium instance.
///
/// The browser process is launched lazily on first page request and closed
/// by [`Browser::shutdown`]. Pages are isolated by the browser itself.
pub struct ChromiumBrowser {
    chrome_path: Option<String>,
    browser: Arc<Mutex<Option<CdpBrowser>>>,
}

impl ChromiumBrowser {
    #[must_use]
    pub fn new(chrome_path: Option<String>) -> Self {
        Self {
            chrome_path,
            browser: Arc::new(Mutex::new(None)),
        }
    }

    /// Launch the browser if not already running.
    async fn ensure_browser(&self) -> Result<()> {
        let mut browser_guard = self.browser.lock().await;
        if browser_guard.is_some() {
            return Ok(());
        }

        info!("Launching headless browser");

        let mut config_builder = BrowserConfig::builder()
            .window_size(VIEWPORT_WIDTH, VIEWPORT_HEIGHT)
            .no_sandbox()
            .disable_default_args()
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-software-rasterizer")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-background-networking")
            .arg("--disable-extensions")
            .arg("--disable-sync")
            .arg("--disable-translate")
            .arg("--mute-audio")
            .arg("--hide-scrollbars");

        if let Some(ref chrome_path) = self.chrome_path {
            config_builder = config_builder.chrome_executable(chrome_path);
        }

        let browser_config = config_builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build browser config: {e}"))?;

        let (browser, mut handler) = CdpBrowser::launch(browser_config)
            .await
            .context("Failed to launch browser")?;

        // Drive the CDP connection in the background
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler error: {e}");
                }
            }
        });

        *browser_guard = Some(browser);
        info!("Headless browser ready");

        Ok(())
    }
}

#[async_trait]
impl Browser for ChromiumBrowser {
    async fn new_page(&self) -> Result<Box<dyn BrowserPage>> {
        self.ensure_browser().await?;

        let browser_guard = self.browser.lock().await;
        let browser = browser_guard.as_ref().context("Browser not initialized")?;

        let page = browser
            .new_page("about:blank")
            .await
            .context("Failed to create new page")?;

        Ok(Box::new(ChromiumPage { page }))
    }

    async fn shutdown(&self) -> Result<()> {
        let mut browser_guard = self.browser.lock().await;
        if let Some(mut browser) = browser_guard.take() {
            if let Err(e) = browser.close().await {
                error!("Failed to close browser: {e}");
            } else {
                info!("Browser shutdown complete");
            }
        }
        Ok(())
    }
}

struct ChromiumPage {
    page: Page,
}

#[async_trait]
impl BrowserPage for ChromiumPage {
    async fn set_user_agent(&self, user_agent: &str) -> Result<()> {
        self.page
            .set_user_agent(SetUserAgentOverrideParams::new(user_agent))
            .await
            .context("Failed to set user agent")?;
        Ok(())
    }

    async fn set_intercept_policy(&self, policy: InterceptPolicy) -> Result<()> {
        if policy == InterceptPolicy::AllowAll {
            return Ok(());
        }

        let mut request_events = self
            .page
            .event_listener::<EventRequestPaused>()
            .await
            .context("Failed to listen for paused requests")?;
        self.page
            .execute(FetchEnableParams::default())
            .await
            .context("Failed to enable request interception")?;

        let page = self.page.clone();
        tokio::spawn(async move {
            while let Some(event) = request_events.next().await {
                let allowed = matches!(
                    event.resource_type,
                    ResourceType::Document | ResourceType::Script
                );
                let request_id = event.request_id.clone();
                let result = if allowed {
                    page.execute(ContinueRequestParams::new(request_id))
                        .await
                        .map(|_| ())
                } else {
                    page.execute(FailRequestParams::new(request_id, ErrorReason::Aborted))
                        .await
                        .map(|_| ())
                };
                if let Err(e) = result {
                    // The page may already be closing; nothing to do.
                    debug!("Interception decision failed: {e}");
                }
            }
        });

        Ok(())
    }

    async fn navigate(&self, url: &str, wait: WaitUntil, timeout: Duration) -> Result<()> {
        let navigation = async {
            self.page.goto(url).await.context("Navigation failed")?;
            if wait == WaitUntil::NetworkIdle {
                self.page
                    .wait_for_navigation()
                    .await
                    .context("Waiting for page load failed")?;
            }
            Ok::<(), anyhow::Error>(())
        };

        tokio::time::timeout(timeout, navigation)
            .await
            .context("Navigation timeout")??;

        // Give dynamic content a moment to render
        tokio::time::sleep(RENDER_SETTLE).await;
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value> {
        let result = self
            .page
            .evaluate(script)
            .await
            .context("Page evaluation failed")?;
        let value = result
            .into_value::<serde_json::Value>()
            .context("Evaluation produced no JSON value")?;
        Ok(value)
    }

    async fn title(&self) -> Result<Option<String>> {
        self.page.get_title().await.context("Failed to read title")
    }

    async fn content(&self) -> Result<String> {
        self.page
            .content()
            .await
            .context("Failed to read page content")
    }

    async fn close(self: Box<Self>) -> Result<()> {
        if let Err(e) = self.page.close().await {
            warn!("Failed to close page: {e}");
        }
        Ok(())
    }
}
