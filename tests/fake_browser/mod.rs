//! Scripted browser for integration tests.
//!
//! Serves prepared HTML per URL without any real rendering. Navigating to
//! an unknown URL fails the same way a dead site would.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use page_archiver::browser::{Browser, BrowserPage, InterceptPolicy, WaitUntil};

#[derive(Default)]
struct FakeState {
    pages: HashMap<String, String>,
    navigations: Vec<String>,
}

/// Browser fake backed by a URL → HTML map.
#[derive(Clone, Default)]
pub struct FakeBrowser {
    state: Arc<Mutex<FakeState>>,
    /// Artificial per-navigation delay, for cancellation tests.
    delay: Duration,
}

impl FakeBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_page(self, url: &str, html: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .pages
            .insert(url.trim_end_matches('/').to_string(), html.to_string());
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// URLs navigated to, in order.
    #[allow(dead_code)]
    pub fn navigations(&self) -> Vec<String> {
        self.state.lock().unwrap().navigations.clone()
    }
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn new_page(&self) -> Result<Box<dyn BrowserPage>> {
        Ok(Box::new(FakePage {
            state: Arc::clone(&self.state),
            delay: self.delay,
            current: Mutex::new(None),
        }))
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

struct FakePage {
    state: Arc<Mutex<FakeState>>,
    delay: Duration,
    current: Mutex<Option<String>>,
}

#[async_trait]
impl BrowserPage for FakePage {
    async fn set_user_agent(&self, _user_agent: &str) -> Result<()> {
        Ok(())
    }

    async fn set_intercept_policy(&self, _policy: InterceptPolicy) -> Result<()> {
        Ok(())
    }

    async fn navigate(&self, url: &str, _wait: WaitUntil, _timeout: Duration) -> Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let key = url.trim_end_matches('/').to_string();
        let html = {
            let mut state = self.state.lock().unwrap();
            state.navigations.push(url.to_string());
            state.pages.get(&key).cloned()
        };
        match html {
            Some(html) => {
                *self.current.lock().unwrap() = Some(html);
                Ok(())
            }
            None => anyhow::bail!("net::ERR_NAME_NOT_RESOLVED for {url}"),
        }
    }

    async fn evaluate(&self, _script: &str) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Bool(true))
    }

    async fn title(&self) -> Result<Option<String>> {
        let html = self.current.lock().unwrap().clone().unwrap_or_default();
        let title = html
            .split("<title>")
            .nth(1)
            .and_then(|rest| rest.split("</title>").next())
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        Ok(title)
    }

    async fn content(&self) -> Result<String> {
        self.current
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no page loaded"))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
