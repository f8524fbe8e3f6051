//! The headless-browser capability consumed by the capture pipeline.
//!
//! The pipeline only ever talks to these traits; production uses the
//! chromiumoxide-backed [`ChromiumBrowser`], tests substitute a scripted
//! fake.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

pub mod chromium;

pub use chromium::ChromiumBrowser;

/// Which requests a page lets through while loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptPolicy {
    /// No interception: every request proceeds.
    AllowAll,
    /// Allow only document and script requests; abort everything else.
    /// Used by discovery crawls, which never download assets.
    DocumentAndScript,
}

/// Navigation wait condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitUntil {
    /// DOM parsed; subresources may still be loading.
    DomContentLoaded,
    /// DOM parsed and the network has gone quiet.
    NetworkIdle,
}

/// One open page.
#[async_trait]
pub trait BrowserPage: Send + Sync {
    async fn set_user_agent(&self, user_agent: &str) -> Result<()>;

    async fn set_intercept_policy(&self, policy: InterceptPolicy) -> Result<()>;

    async fn navigate(&self, url: &str, wait: WaitUntil, timeout: Duration) -> Result<()>;

    /// Evaluate a script in the page, returning its JSON result.
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value>;

    async fn title(&self) -> Result<Option<String>>;

    /// Rendered HTML of the current document.
    async fn content(&self) -> Result<String>;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// A running browser that can open pages.
#[async_trait]
pub trait Browser: Send + Sync {
    async fn new_page(&self) -> Result<Box<dyn BrowserPage>>;

    async fn shutdown(&self) -> Result<()>;
}
