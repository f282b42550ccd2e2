use anyhow::Result;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetLocaleOverrideParams, SetTimezoneOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams as NetworkEnableParams, Headers, SetExtraHttpHeadersParams,
};
use chromiumoxide::cdp::browser_protocol::page::ReloadParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde_json::json;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{sleep, timeout};

use crate::config::Fingerprint;
use crate::page::{ConsolePage, CookieRecord, Locator, PageError};

#[derive(Clone)]
pub struct SessionConfig {
    pub headless: bool,
    pub fingerprint: Fingerprint,
    pub nav_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            headless: true,
            fingerprint: Fingerprint::default(),
            nav_timeout: Duration::from_secs(30),
        }
    }
}

/// One Chromium process, one tab, owned for the whole run.
pub struct Browser {
    page: Page,
    browser: OxideBrowser,
    nav_timeout: Duration,
}

impl Browser {
    pub async fn launch(cfg: SessionConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // Unique user data dir per run to avoid ProcessSingleton profile lock
        // conflicts when Chromium instances are spawned in quick succession.
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("cloudgate-profile-{}-{}", std::process::id(), ts));
        let _ = std::fs::create_dir_all(&profile_dir);
        builder = builder
            .user_data_dir(profile_dir)
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| anyhow::anyhow!(e))?;

        let (browser, mut handler) = OxideBrowser::launch(bcfg).await?;
        tokio::spawn(async move {
            while let Some(_ev) = handler.next().await {}
        });

        let page = browser.new_page("about:blank").await?;
        apply_fingerprint(&page, &cfg.fingerprint).await?;

        Ok(Self {
            page,
            browser,
            nav_timeout: cfg.nav_timeout,
        })
    }

    /// Navigate and wait until the document is parsed and network activity has
    /// settled, bounded by the configured timeout.
    pub async fn goto(&self, url: &str) -> Result<()> {
        let nav = async {
            self.page.goto(url).await?;
            self.page.wait_for_navigation().await?;
            Ok::<(), anyhow::Error>(())
        };
        timeout(self.nav_timeout, nav)
            .await
            .map_err(|_| anyhow::anyhow!("navigation to {url} timed out"))??;
        Ok(())
    }

    /// Tear down the tab and the browser process. Called on every exit path.
    pub async fn close(mut self) -> Result<()> {
        self.browser.close().await?;
        self.browser.wait().await?;
        Ok(())
    }

    async fn eval_bool(&self, js: String) -> Result<bool, PageError> {
        let res = self.page.evaluate(js).await.map_err(to_page_err)?;
        Ok(res.into_value::<bool>().unwrap_or(false))
    }
}

async fn apply_fingerprint(page: &Page, fp: &Fingerprint) -> Result<()> {
    page.set_user_agent(fp.user_agent.clone()).await?;
    page.execute(
        SetDeviceMetricsOverrideParams::builder()
            .width(fp.viewport.0 as i64)
            .height(fp.viewport.1 as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| anyhow::anyhow!(e))?,
    )
    .await?;
    page.execute(SetLocaleOverrideParams {
        locale: Some(fp.locale.clone()),
    })
    .await?;
    page.execute(
        SetTimezoneOverrideParams::builder()
            .timezone_id(fp.timezone.clone())
            .build()
            .map_err(|e| anyhow::anyhow!(e))?,
    )
    .await?;
    // Extra headers need the network domain enabled first.
    page.execute(NetworkEnableParams::default()).await?;
    page.execute(SetExtraHttpHeadersParams {
        headers: Headers::new(json!({
            "Accept-Language": fp.accept_language,
            "Upgrade-Insecure-Requests": "1",
        })),
    })
    .await?;
    Ok(())
}

fn to_page_err(e: impl std::fmt::Display) -> PageError {
    PageError::new(e.to_string())
}

fn js_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

/// A JS expression resolving the locator to an element or null.
fn finder_js(locator: &Locator) -> String {
    match locator {
        Locator::Css { selector } => {
            format!("document.querySelector('{}')", js_escape(selector))
        }
        Locator::Role { role, name } => {
            let candidates = if role == "button" {
                r#"button, [role="button"], input[type="submit"], a"#.to_string()
            } else {
                format!(r#"[role="{}"]"#, js_escape(role))
            };
            format!(
                r#"(() => {{
                    const name = '{}'.toLowerCase();
                    for (const el of document.querySelectorAll('{}')) {{
                        const label = (el.innerText || el.value || el.getAttribute('aria-label') || '').toLowerCase();
                        if (label.includes(name)) return el;
                    }}
                    return null;
                }})()"#,
                js_escape(name),
                candidates,
            )
        }
        Locator::Text { pattern } => format!(
            r#"(() => {{
                const pattern = '{}'.toLowerCase();
                for (const el of document.querySelectorAll('button, a, [role="button"], input[type="submit"]')) {{
                    if ((el.innerText || el.value || '').toLowerCase().includes(pattern)) return el;
                }}
                return null;
            }})()"#,
            js_escape(pattern),
        ),
        Locator::ClassFragment { fragment } => format!(
            r#"(() => {{
                const fragment = '{}'.toLowerCase();
                for (const el of document.querySelectorAll('button, a')) {{
                    if ((el.className || '').toString().toLowerCase().includes(fragment)) return el;
                }}
                return null;
            }})()"#,
            js_escape(fragment),
        ),
    }
}

#[async_trait]
impl ConsolePage for Browser {
    async fn current_url(&self) -> Result<String, PageError> {
        Ok(self
            .page
            .url()
            .await
            .map_err(to_page_err)?
            .unwrap_or_default())
    }

    async fn text_visible(&self, needle: &str) -> Result<bool, PageError> {
        let js = format!(
            "(() => !!(document.body && document.body.innerText.includes('{}')))()",
            js_escape(needle)
        );
        self.eval_bool(js).await
    }

    async fn locator_visible(&self, locator: &Locator) -> Result<bool, PageError> {
        let js = format!(
            "(() => {{ const el = {}; return !!(el && el.offsetParent !== null); }})()",
            finder_js(locator)
        );
        self.eval_bool(js).await
    }

    async fn click(&self, locator: &Locator) -> Result<(), PageError> {
        let js = format!(
            "(() => {{ const el = {}; if (!el) return false; el.click(); return true; }})()",
            finder_js(locator)
        );
        if self.eval_bool(js).await? {
            Ok(())
        } else {
            Err(PageError::new(format!("no element for {locator:?}")))
        }
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), PageError> {
        self.page
            .find_element(selector)
            .await
            .map_err(to_page_err)?
            .click()
            .await
            .map_err(to_page_err)?
            .type_str(value)
            .await
            .map_err(to_page_err)?;
        Ok(())
    }

    async fn submit(&self, selector: &str) -> Result<(), PageError> {
        self.page
            .find_element(selector)
            .await
            .map_err(to_page_err)?
            .press_key("Enter")
            .await
            .map_err(to_page_err)?;
        Ok(())
    }

    async fn reload(&self) -> Result<(), PageError> {
        self.page
            .execute(ReloadParams::default())
            .await
            .map_err(to_page_err)?;
        self.page
            .wait_for_navigation()
            .await
            .map_err(to_page_err)?;
        Ok(())
    }

    async fn html(&self) -> Result<String, PageError> {
        self.page.content().await.map_err(to_page_err)
    }

    async fn cookies(&self) -> Result<Vec<CookieRecord>, PageError> {
        let cookies = self.page.get_cookies().await.map_err(to_page_err)?;
        Ok(cookies
            .into_iter()
            .map(|c| CookieRecord {
                name: c.name,
                value: c.value,
                domain: c.domain,
                path: c.path,
            })
            .collect())
    }

    async fn screenshot_b64(&self) -> Result<String, PageError> {
        use chromiumoxide::page::ScreenshotParamsBuilder;
        let take = || async {
            self.page
                .screenshot(ScreenshotParamsBuilder::default().full_page(true).build())
                .await
        };
        match take().await {
            Ok(bytes) => Ok(STANDARD.encode(bytes)),
            Err(e) => {
                let msg = format!("{e}");
                if msg.contains("0 width") || msg.contains("0 height") {
                    // A fresh tab can race the metrics override; re-assert the
                    // viewport and retry once.
                    let _ = self
                        .page
                        .execute(
                            SetDeviceMetricsOverrideParams::builder()
                                .width(1280)
                                .height(800)
                                .device_scale_factor(1.0)
                                .mobile(false)
                                .build()
                                .map_err(to_page_err)?,
                        )
                        .await;
                    sleep(Duration::from_millis(50)).await;
                    let bytes = take().await.map_err(to_page_err)?;
                    return Ok(STANDARD.encode(bytes));
                }
                Err(to_page_err(e))
            }
        }
    }
}
