//! Typed errors for the capture pipeline.
//!
//! Per-resource failures stay local (recorded in job stats); navigation,
//! extraction, and persistence failures terminate the owning job.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("navigation failed for {url}: {message}")]
    Navigation { url: String, message: String },

    #[error("page extraction failed: {0}")]
    Extraction(String),

    #[error("download failed for {url}: {message}")]
    Download { url: String, message: String },

    #[error("rate limited by {domain}")]
    RateLimited {
        domain: String,
        retry_after: Option<Duration>,
    },

    #[error("rewrite failed: {0}")]
    Rewrite(String),

    #[error("failed to persist capture: {message}")]
    Persistence {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Cancelled by user")]
    Cancelled,
}

impl CaptureError {
    pub fn navigation(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Navigation {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn download(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Download {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
            source: None,
        }
    }

    /// Whether this error fails the whole job (true) or only the resource
    /// it occurred on (false).
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Navigation { .. }
                | Self::Extraction(_)
                | Self::Persistence { .. }
                | Self::Cancelled
        )
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(CaptureError::navigation("https://a.test", "timeout").is_fatal());
        assert!(CaptureError::Cancelled.is_fatal());
        assert!(!CaptureError::download("https://a.test/x.png", "404").is_fatal());
        assert!(!CaptureError::Rewrite("bad href".to_string()).is_fatal());
    }

    #[test]
    fn test_cancelled_message() {
        assert_eq!(CaptureError::Cancelled.to_string(), "Cancelled by user");
    }
}
