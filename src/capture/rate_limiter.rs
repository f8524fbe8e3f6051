//! Per-domain request spacing for polite archival.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;
use url::Url;

/// Longest wait honored from a `Retry-After` header.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

/// Per-domain rate limiter enforcing a minimum spacing between departures.
///
/// Callers to the same domain are serialized: no two requests depart less
/// than `min_delay` apart, even under parallel callers.
#[derive(Debug)]
pub struct DomainRateLimiter {
    min_delay: Duration,
    last_departure: RwLock<HashMap<String, Arc<Mutex<Option<Instant>>>>>,
}

impl DomainRateLimiter {
    #[must_use]
    pub fn new(min_delay: Duration) -> Self {
        Self {
            min_delay,
            last_departure: RwLock::new(HashMap::new()),
        }
    }

    /// Wait until a request to `url`'s domain may depart, then claim the slot.
    pub async fn wait_for_domain(&self, url: &str) {
        let domain = domain_of(url);
        let slot = self.get_or_create_slot(&domain).await;

        // Holding the domain lock across the sleep serializes waiters, so
        // concurrent callers space out rather than departing together.
        let mut last = slot.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_delay {
                let remaining = self.min_delay - elapsed;
                debug!(domain = %domain, wait_ms = remaining.as_millis() as u64, "Rate limit wait");
                tokio::time::sleep(remaining).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Honor a `Retry-After` header value (seconds or RFC-1123 date),
    /// clamped to [`MAX_RETRY_AFTER`].
    pub async fn handle_retry_after(&self, value: &str) {
        let Some(wait) = parse_retry_after(value) else {
            return;
        };
        let wait = wait.min(MAX_RETRY_AFTER);
        if wait.is_zero() {
            return;
        }
        debug!(wait_secs = wait.as_secs(), "Honoring Retry-After");
        tokio::time::sleep(wait).await;
    }

    /// Number of domains currently tracked.
    pub async fn domain_count(&self) -> usize {
        self.last_departure.read().await.len()
    }

    async fn get_or_create_slot(&self, domain: &str) -> Arc<Mutex<Option<Instant>>> {
        // Fast path: slot already exists
        {
            let read_guard = self.last_departure.read().await;
            if let Some(slot) = read_guard.get(domain) {
                return Arc::clone(slot);
            }
        }

        // Slow path: create slot
        let mut write_guard = self.last_departure.write().await;
        // Double-check pattern to avoid race condition
        if let Some(slot) = write_guard.get(domain) {
            return Arc::clone(slot);
        }

        let slot = Arc::new(Mutex::new(None));
        write_guard.insert(domain.to_string(), Arc::clone(&slot));
        slot
    }
}

/// Derive the rate-limiting key for a URL. Falls back to the raw string for
/// unparseable input so such requests still share one slot.
fn domain_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

/// Parse a `Retry-After` value: either delta-seconds or an RFC-1123 date.
/// Past dates yield `None`.
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let trimmed = value.trim();
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let when = chrono::DateTime::parse_from_rfc2822(trimmed).ok()?;
    let delta = when.with_timezone(&Utc) - Utc::now();
    delta.to_std().ok().filter(|d| !d.is_zero())
}
