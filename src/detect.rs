use tracing::debug;

use crate::page::{ConsolePage, Locator};

/// Console UI labels that only render behind a session.
const AUTHENTICATED_TEXTS: &[&str] = &["App Launchpad", "Devbox"];

/// Address fragments of the authenticated console.
const AUTHENTICATED_URL_PARTS: &[&str] = &["private-team", "console"];

/// DOM markers of the authenticated shell.
const AUTHENTICATED_MARKERS: &[&str] = &["[data-app='launchpad']", "nav[aria-label='Workspace']"];

/// Address fragments that prove we are still somewhere in the sign-in funnel.
const SIGN_IN_URL_PARTS: &[&str] = &["signin", "github.com"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoginState {
    pub authenticated: bool,
    pub reason: Option<String>,
}

impl LoginState {
    fn yes(reason: String) -> Self {
        Self {
            authenticated: true,
            reason: Some(reason),
        }
    }

    fn no() -> Self {
        Self {
            authenticated: false,
            reason: None,
        }
    }
}

/// Decide whether the page already shows the authenticated console, checking
/// signals in priority order: UI text, then address, then DOM markers.
///
/// Absence of a signal is a normal outcome; any probe failure is swallowed and
/// treated as "not found". Side-effect free, safe to call repeatedly on an
/// evolving page.
pub async fn detect<P: ConsolePage + ?Sized>(page: &P) -> LoginState {
    for text in AUTHENTICATED_TEXTS {
        if page.text_visible(text).await.unwrap_or(false) {
            return LoginState::yes(format!("console label \"{text}\" visible"));
        }
    }

    if let Ok(url) = page.current_url().await {
        for part in AUTHENTICATED_URL_PARTS {
            if url.contains(part) {
                return LoginState::yes(format!("address contains \"{part}\""));
            }
        }
    }

    for selector in AUTHENTICATED_MARKERS {
        let marker = Locator::Css {
            selector: selector.to_string(),
        };
        if page.locator_visible(&marker).await.unwrap_or(false) {
            return LoginState::yes(format!("marker element {selector} present"));
        }
    }

    LoginState::no()
}

/// Final-verification variant: the priority signals above, then a weakest
/// fallback for providers that land the session on an unrecognized console
/// route. An address that is neither a sign-in page nor a provider page counts
/// as authenticated.
pub async fn verify_final<P: ConsolePage + ?Sized>(page: &P) -> LoginState {
    let state = detect(page).await;
    if state.authenticated {
        return state;
    }

    match page.current_url().await {
        Ok(url) if !url.is_empty() => {
            let lowered = url.to_lowercase();
            if SIGN_IN_URL_PARTS.iter().all(|part| !lowered.contains(part)) {
                debug!(url = %url, "no sign-in fragment in final address");
                return LoginState::yes("address left the sign-in funnel".into());
            }
            LoginState::no()
        }
        _ => LoginState::no(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{ConsolePage, CookieRecord, Locator, PageError};
    use async_trait::async_trait;

    /// Minimal scripted page: fixed url, fixed visible texts and selectors.
    struct StubPage {
        url: String,
        texts: Vec<&'static str>,
        selectors: Vec<&'static str>,
    }

    impl StubPage {
        fn at(url: &str) -> Self {
            Self {
                url: url.into(),
                texts: vec![],
                selectors: vec![],
            }
        }
    }

    #[async_trait]
    impl ConsolePage for StubPage {
        async fn current_url(&self) -> Result<String, PageError> {
            Ok(self.url.clone())
        }
        async fn text_visible(&self, needle: &str) -> Result<bool, PageError> {
            Ok(self.texts.iter().any(|t| *t == needle))
        }
        async fn locator_visible(&self, locator: &Locator) -> Result<bool, PageError> {
            match locator {
                Locator::Css { selector } => {
                    Ok(self.selectors.iter().any(|s| *s == selector.as_str()))
                }
                _ => Ok(false),
            }
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
            Ok(String::new())
        }
        async fn cookies(&self) -> Result<Vec<CookieRecord>, PageError> {
            Ok(vec![])
        }
        async fn screenshot_b64(&self) -> Result<String, PageError> {
            Ok(String::new())
        }
    }

    /// Every probe fails, as when the underlying tab has gone away.
    struct BrokenPage;

    #[async_trait]
    impl ConsolePage for BrokenPage {
        async fn current_url(&self) -> Result<String, PageError> {
            Err(PageError::new("tab gone"))
        }
        async fn text_visible(&self, _: &str) -> Result<bool, PageError> {
            Err(PageError::new("tab gone"))
        }
        async fn locator_visible(&self, _: &Locator) -> Result<bool, PageError> {
            Err(PageError::new("tab gone"))
        }
        async fn click(&self, _: &Locator) -> Result<(), PageError> {
            Err(PageError::new("tab gone"))
        }
        async fn fill(&self, _: &str, _: &str) -> Result<(), PageError> {
            Err(PageError::new("tab gone"))
        }
        async fn submit(&self, _: &str) -> Result<(), PageError> {
            Err(PageError::new("tab gone"))
        }
        async fn reload(&self) -> Result<(), PageError> {
            Err(PageError::new("tab gone"))
        }
        async fn html(&self) -> Result<String, PageError> {
            Err(PageError::new("tab gone"))
        }
        async fn cookies(&self) -> Result<Vec<CookieRecord>, PageError> {
            Err(PageError::new("tab gone"))
        }
        async fn screenshot_b64(&self) -> Result<String, PageError> {
            Err(PageError::new("tab gone"))
        }
    }

    #[tokio::test]
    async fn text_label_wins() {
        let mut page = StubPage::at("https://us-west-1.run.claw.cloud/");
        page.texts.push("App Launchpad");
        let state = detect(&page).await;
        assert!(state.authenticated);
        assert!(state.reason.unwrap().contains("App Launchpad"));
    }

    #[tokio::test]
    async fn url_fragment_matches_when_no_text() {
        let page = StubPage::at("https://us-west-1.run.claw.cloud/private-team/apps");
        let state = detect(&page).await;
        assert!(state.authenticated);
        assert!(state.reason.unwrap().contains("private-team"));
    }

    #[tokio::test]
    async fn text_takes_priority_over_url() {
        let mut page = StubPage::at("https://us-west-1.run.claw.cloud/private-team/apps");
        page.texts.push("Devbox");
        let state = detect(&page).await;
        assert!(state.reason.unwrap().contains("Devbox"));
    }

    #[tokio::test]
    async fn dom_marker_is_last_resort() {
        let mut page = StubPage::at("https://us-west-1.run.claw.cloud/");
        page.selectors.push("[data-app='launchpad']");
        let state = detect(&page).await;
        assert!(state.authenticated);
        assert!(state.reason.unwrap().contains("launchpad"));
    }

    #[tokio::test]
    async fn unauthenticated_page_yields_none() {
        let page = StubPage::at("https://us-west-1.run.claw.cloud/signin");
        let state = detect(&page).await;
        assert!(!state.authenticated);
        assert!(state.reason.is_none());
    }

    #[tokio::test]
    async fn idempotent_on_unchanged_page() {
        let mut page = StubPage::at("https://us-west-1.run.claw.cloud/");
        page.texts.push("App Launchpad");
        let first = detect(&page).await;
        let second = detect(&page).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn never_raises_on_broken_page() {
        let state = detect(&BrokenPage).await;
        assert_eq!(
            state,
            LoginState {
                authenticated: false,
                reason: None
            }
        );
    }

    #[tokio::test]
    async fn final_fallback_accepts_neutral_address() {
        let page = StubPage::at("https://dashboard.example.net/home");
        assert!(!detect(&page).await.authenticated);
        assert!(verify_final(&page).await.authenticated);
    }

    #[tokio::test]
    async fn final_fallback_rejects_provider_address() {
        let page = StubPage::at("https://github.com/login");
        assert!(!verify_final(&page).await.authenticated);
    }
}
