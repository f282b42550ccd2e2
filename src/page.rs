use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};

/// Failure of a single page query or interaction. Callers decide whether it
/// matters: the detector swallows these, the sequencer propagates them.
#[derive(Debug, Error)]
#[error("page error: {0}")]
pub struct PageError(pub String);

impl PageError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// How to find a control on markup this crate does not own. Each variant is an
/// independent lookup signal so a single selector breaking does not strand the
/// whole flow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum Locator {
    /// Accessible role plus a case-insensitive name fragment.
    Role { role: String, name: String },
    /// Case-insensitive visible-text fragment on a clickable element.
    Text { pattern: String },
    Css { selector: String },
    /// Any element whose class attribute contains the fragment.
    ClassFragment { fragment: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum UrlPattern {
    Contains(String),
    ContainsAny(Vec<String>),
    StartsWith(String),
}

impl UrlPattern {
    pub fn contains(s: impl Into<String>) -> Self {
        Self::Contains(s.into())
    }

    pub fn matches(&self, url: &str) -> bool {
        match self {
            Self::Contains(frag) => url.contains(frag.as_str()),
            Self::ContainsAny(frags) => frags.iter().any(|f| url.contains(f.as_str())),
            Self::StartsWith(prefix) => url.starts_with(prefix.as_str()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
}

const URL_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// The one page handle the run owns, threaded explicitly through every stage.
/// Implemented by the chromiumoxide-backed [`crate::browser::Browser`] and by
/// scripted fakes in tests.
#[async_trait]
pub trait ConsolePage: Send + Sync {
    async fn current_url(&self) -> Result<String, PageError>;

    /// Whether the given text is anywhere in the rendered page body.
    async fn text_visible(&self, needle: &str) -> Result<bool, PageError>;

    /// Whether the locator resolves to at least one visible element.
    async fn locator_visible(&self, locator: &Locator) -> Result<bool, PageError>;

    async fn click(&self, locator: &Locator) -> Result<(), PageError>;

    async fn fill(&self, selector: &str, value: &str) -> Result<(), PageError>;

    /// Press Enter with the selected element focused (the input's default
    /// accept action).
    async fn submit(&self, selector: &str) -> Result<(), PageError>;

    async fn reload(&self) -> Result<(), PageError>;

    async fn html(&self) -> Result<String, PageError>;

    async fn cookies(&self) -> Result<Vec<CookieRecord>, PageError>;

    async fn screenshot_b64(&self) -> Result<String, PageError>;

    /// Poll the address bar until `pattern` matches or `timeout` elapses.
    /// Expiry is a normal outcome, not an error: returns the matching address
    /// or `None`.
    async fn wait_for_url(
        &self,
        pattern: &UrlPattern,
        timeout: Duration,
    ) -> Result<Option<String>, PageError> {
        let deadline = Instant::now() + timeout;
        loop {
            let url = self.current_url().await?;
            if pattern.matches(&url) {
                return Ok(Some(url));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(URL_POLL_INTERVAL).await;
        }
    }
}
