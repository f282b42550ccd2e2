use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::Utc;
use nanoid::nanoid;
use regex::Regex;
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use tracing::{info, warn};

use crate::page::{ConsolePage, CookieRecord};

pub const REDACTION_MARKER: &str = "***REDACTED***";

/// Best-effort diagnostic sink. Every stage drops a named bundle here (image,
/// redacted cookie set, redacted HTML) so a failed run can be reconstructed
/// without re-running. Capture failures are logged and discarded; diagnostics
/// never abort the flow.
pub struct CheckpointSink {
    dir: PathBuf,
    password_then_value: Regex,
    value_then_password: Regex,
}

impl CheckpointSink {
    /// Sink rooted at `base/<run key>`.
    pub fn for_run(base: impl AsRef<Path>) -> Self {
        Self::at(base.as_ref().join(nanoid!(10)))
    }

    /// Sink writing directly into `dir`.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            password_then_value: Regex::new(
                r#"(?i)(<input[^>]*type\s*=\s*["']?password["']?[^>]*value\s*=\s*["'])([^"']*)(["'])"#,
            )
            .unwrap(),
            value_then_password: Regex::new(
                r#"(?i)(<input[^>]*value\s*=\s*["'])([^"']*)(["'][^>]*type\s*=\s*["']?password)"#,
            )
            .unwrap(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Capture a checkpoint under a normalized key. Never fails outward.
    pub async fn capture<P: ConsolePage + ?Sized>(&self, page: &P, label: &str) {
        let key = normalize_label(label);
        if let Err(e) = async_fs::create_dir_all(&self.dir).await {
            warn!(label = %key, error = %e, "checkpoint directory unavailable");
            return;
        }
        if let Err(e) = self.capture_screenshot(page, &key).await {
            warn!(label = %key, error = %e, "screenshot capture failed");
        }
        if let Err(e) = self.capture_cookies(page, &key).await {
            warn!(label = %key, error = %e, "cookie capture failed");
        }
        if let Err(e) = self.capture_html(page, &key).await {
            warn!(label = %key, error = %e, "html capture failed");
        }
    }

    async fn capture_screenshot<P: ConsolePage + ?Sized>(&self, page: &P, key: &str) -> Result<()> {
        let b64 = page.screenshot_b64().await?;
        let png = B64.decode(b64).context("screenshot decode")?;
        async_fs::write(self.dir.join(format!("{key}.png")), &png).await?;
        Ok(())
    }

    async fn capture_cookies<P: ConsolePage + ?Sized>(&self, page: &P, key: &str) -> Result<()> {
        let cookies = page.cookies().await?;
        info!(label = %key, count = cookies.len(), "cookie overview");
        for c in cookies.iter().take(3) {
            info!(label = %key, name = %c.name, domain = %c.domain, "cookie");
        }
        let redacted = redact_cookies(&cookies);
        let json = serde_json::to_vec_pretty(&redacted)?;
        async_fs::write(self.dir.join(format!("{key}_cookies.json")), &json).await?;
        Ok(())
    }

    async fn capture_html<P: ConsolePage + ?Sized>(&self, page: &P, key: &str) -> Result<()> {
        let html = page.html().await?;
        let scrubbed = self.redact_html(&html);
        async_fs::write(self.dir.join(format!("{key}.html")), scrubbed.as_bytes()).await?;
        Ok(())
    }

    /// Replace the value attribute of password-typed inputs, whichever side of
    /// `type` it sits on.
    pub fn redact_html(&self, html: &str) -> String {
        let pass = self
            .password_then_value
            .replace_all(html, format!("${{1}}{REDACTION_MARKER}${{3}}"));
        self.value_then_password
            .replace_all(&pass, format!("${{1}}{REDACTION_MARKER}${{3}}"))
            .into_owned()
    }

    /// Write the plain-text success marker: timestamp, final address,
    /// detection reason.
    pub async fn write_success_marker(&self, final_url: &str, reason: Option<&str>) -> Result<PathBuf> {
        async_fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join("login_success.txt");
        let body = format!(
            "{}\n{}\n{}\n",
            Utc::now().to_rfc3339(),
            final_url,
            reason.unwrap_or("-")
        );
        async_fs::write(&path, body).await?;
        Ok(path)
    }
}

/// Every cookie keeps its name and domain; the value is replaced wholesale.
pub fn redact_cookies(cookies: &[CookieRecord]) -> Vec<CookieRecord> {
    cookies
        .iter()
        .map(|c| CookieRecord {
            value: REDACTION_MARKER.into(),
            ..c.clone()
        })
        .collect()
}

fn normalize_label(label: &str) -> String {
    label
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{ConsolePage, CookieRecord, Locator, PageError};
    use async_trait::async_trait;

    struct ArtifactPage;

    #[async_trait]
    impl ConsolePage for ArtifactPage {
        async fn current_url(&self) -> Result<String, PageError> {
            Ok("https://us-west-1.run.claw.cloud/".into())
        }
        async fn text_visible(&self, _: &str) -> Result<bool, PageError> {
            Ok(false)
        }
        async fn locator_visible(&self, _: &Locator) -> Result<bool, PageError> {
            Ok(false)
        }
        async fn click(&self, _: &Locator) -> Result<(), PageError> {
            Ok(())
        }
        async fn fill(&self, _: &str, _: &str) -> Result<(), PageError> {
            Ok(())
        }
        async fn submit(&self, _: &str) -> Result<(), PageError> {
            Ok(())
        }
        async fn reload(&self) -> Result<(), PageError> {
            Ok(())
        }
        async fn html(&self) -> Result<String, PageError> {
            Ok(r#"<form><input type="password" value="secretpw"></form>"#.into())
        }
        async fn cookies(&self) -> Result<Vec<CookieRecord>, PageError> {
            Ok(vec![CookieRecord {
                name: "session".into(),
                value: "abc123".into(),
                domain: ".claw.cloud".into(),
                path: "/".into(),
            }])
        }
        async fn screenshot_b64(&self) -> Result<String, PageError> {
            Ok(B64.encode(b"not really a png"))
        }
    }

    #[test]
    fn label_is_case_and_whitespace_normalized() {
        assert_eq!(normalize_label("ClawCloud  Initial "), "clawcloud_initial");
        assert_eq!(normalize_label("entry not found"), "entry_not_found");
    }

    #[test]
    fn password_value_is_scrubbed() {
        let sink = CheckpointSink::at("unused");
        let html = r#"<input type="password" value="secretpw">"#;
        let out = sink.redact_html(html);
        assert!(!out.contains("secretpw"));
        assert!(out.contains(REDACTION_MARKER));
    }

    #[test]
    fn password_value_is_scrubbed_in_either_attribute_order() {
        let sink = CheckpointSink::at("unused");
        let html = r#"<input value="secretpw" type="password">"#;
        let out = sink.redact_html(html);
        assert!(!out.contains("secretpw"));
    }

    #[test]
    fn non_password_values_are_kept() {
        let sink = CheckpointSink::at("unused");
        let html = r#"<input type="text" value="octocat">"#;
        assert_eq!(sink.redact_html(html), html);
    }

    #[test]
    fn cookie_values_are_scrubbed_names_kept() {
        let cookies = vec![CookieRecord {
            name: "session".into(),
            value: "abc123".into(),
            domain: ".claw.cloud".into(),
            path: "/".into(),
        }];
        let redacted = redact_cookies(&cookies);
        let json = serde_json::to_string(&redacted).unwrap();
        assert!(!json.contains("abc123"));
        assert!(json.contains("session"));
        assert!(json.contains(".claw.cloud"));
    }

    #[tokio::test]
    async fn capture_writes_all_three_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = CheckpointSink::at(tmp.path());
        sink.capture(&ArtifactPage, "GitHub Authorize Page").await;

        let png = tmp.path().join("github_authorize_page.png");
        let cookies = tmp.path().join("github_authorize_page_cookies.json");
        let html = tmp.path().join("github_authorize_page.html");
        assert!(png.exists() && cookies.exists() && html.exists());

        let cookie_json = std::fs::read_to_string(cookies).unwrap();
        assert!(!cookie_json.contains("abc123"));
        let html_text = std::fs::read_to_string(html).unwrap();
        assert!(!html_text.contains("secretpw"));
    }

    #[tokio::test]
    async fn success_marker_contains_final_address() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = CheckpointSink::at(tmp.path());
        let path = sink
            .write_success_marker("https://us-west-1.run.claw.cloud/", Some("console label"))
            .await
            .unwrap();
        let body = std::fs::read_to_string(path).unwrap();
        assert!(body.contains("https://us-west-1.run.claw.cloud/"));
        assert!(body.contains("console label"));
    }
}
