use serde::Serialize;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

use crate::checkpoint::CheckpointSink;
use crate::config::{Credentials, FlowSettings};
use crate::detect;
use crate::locate;
use crate::page::{ConsolePage, Locator, PageError, UrlPattern};
use crate::totp::{CodeGenerator, TotpError};

const PROVIDER_LOGIN_PARTS: &[&str] = &["github.com/login", "github.com/session"];
const TWO_FACTOR_FRAGMENT: &str = "two-factor";
const AUTHORIZE_FRAGMENT: &str = "authorize";
const CALLBACK_FRAGMENT: &str = "/callback";

const USERNAME_INPUT: &str = "#login_field";
const PASSWORD_INPUT: &str = "#password";
const LOGIN_SUBMIT: &str = "input[name='commit']";
const OTP_INPUT: &str = "#app_totp";

/// Progress of one login run through the multi-hop flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum FlowState {
    Start,
    EntryFound,
    CredentialsSubmitted,
    TwoFactorSubmitted,
    ConsentCaptured,
    CallbackObserved,
    Verified,
    Failed,
}

/// The bounded hops of the flow, each with its own expiry policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    ClickEntry,
    Credentials,
    TwoFactor,
    Consent,
    Callback,
    FinalRedirect,
    Verification,
}

/// What an expired bound means for the run. OAuth providers legitimately skip
/// consent and callback hops for previously-authorized applications, so most
/// expiries only mark a stage as unresolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpiryPolicy {
    Advisory,
    Fatal,
}

pub const STAGE_POLICIES: &[(Stage, ExpiryPolicy)] = &[
    (Stage::ClickEntry, ExpiryPolicy::Fatal),
    (Stage::Credentials, ExpiryPolicy::Advisory),
    (Stage::TwoFactor, ExpiryPolicy::Advisory),
    (Stage::Consent, ExpiryPolicy::Advisory),
    (Stage::Callback, ExpiryPolicy::Advisory),
    (Stage::FinalRedirect, ExpiryPolicy::Advisory),
    (Stage::Verification, ExpiryPolicy::Fatal),
];

pub fn expiry_policy(stage: Stage) -> ExpiryPolicy {
    STAGE_POLICIES
        .iter()
        .find(|(s, _)| *s == stage)
        .map(|(_, p)| *p)
        .unwrap_or(ExpiryPolicy::Advisory)
}

/// Whether a callback `state` token differing from the one sent fails the run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StateTokenPolicy {
    /// Log a warning and keep going. Some providers omit or rewrite the token.
    #[default]
    Advisory,
    Strict,
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("sign-in entry control not found after {attempts} lookup rounds")]
    EntryNotFound { attempts: usize },
    #[error("final verification failed, page at {url} is not the authenticated console")]
    VerificationFailed { url: String },
    #[error("authorization state token mismatch: sent {sent:?}, received {received:?}")]
    StateTokenMismatch { sent: String, received: String },
    #[error("stage {stage:?} bound expired")]
    StageTimeout { stage: Stage },
    #[error(transparent)]
    Totp(#[from] TotpError),
    #[error(transparent)]
    Page(#[from] PageError),
}

#[derive(Clone, Debug, Serialize)]
pub struct FlowReport {
    pub state: FlowState,
    pub authenticated: bool,
    pub reason: Option<String>,
    pub final_url: String,
    pub token_mismatch: bool,
}

/// The canonical sequencer: credential submission, two-factor, consent,
/// callback correlation, redirect wait, final re-detection. Strictly
/// sequential over one exclusively-owned page handle; no stage is retried once
/// entered. Every stage drops a checkpoint right after acting.
pub struct LoginFlow<'a, P: ConsolePage> {
    page: &'a P,
    creds: &'a Credentials,
    settings: &'a FlowSettings,
    sink: &'a CheckpointSink,
}

impl<'a, P: ConsolePage> LoginFlow<'a, P> {
    pub fn new(
        page: &'a P,
        creds: &'a Credentials,
        settings: &'a FlowSettings,
        sink: &'a CheckpointSink,
    ) -> Self {
        Self {
            page,
            creds,
            settings,
            sink,
        }
    }

    pub async fn run(&self) -> Result<FlowReport, FlowError> {
        let mut state = FlowState::Start;

        let initial = detect::detect(self.page).await;
        self.sink.capture(self.page, "initial").await;
        if initial.authenticated {
            info!(reason = ?initial.reason, "already signed in, skipping the flow");
            let final_url = self.page.current_url().await.unwrap_or_default();
            return Ok(FlowReport {
                state: FlowState::Verified,
                authenticated: true,
                reason: initial.reason,
                final_url,
                token_mismatch: false,
            });
        }

        let entry = locate::locate_entry(
            self.page,
            self.settings.entry_attempts,
            self.settings.entry_settle,
        )
        .await;
        let entry = match entry {
            Some(entry) => entry,
            None => {
                self.sink.capture(self.page, "entry not found").await;
                return Err(FlowError::EntryNotFound {
                    attempts: self.settings.entry_attempts,
                });
            }
        };
        self.page.click(&entry).await?;
        advance(&mut state, FlowState::EntryFound);
        self.sink.capture(self.page, "entry clicked").await;

        self.submit_credentials(&mut state).await?;
        self.submit_two_factor(&mut state).await?;
        let consent_token = self.capture_consent(&mut state).await?;
        let token_mismatch = self.check_callback(&mut state, consent_token.as_deref()).await?;
        self.await_return().await?;
        self.verify(state, token_mismatch).await
    }

    /// Credential submission, guarded on landing at the provider's login page.
    /// An account with a live provider session skips straight past this hop.
    async fn submit_credentials(&self, state: &mut FlowState) -> Result<(), FlowError> {
        let pattern = UrlPattern::ContainsAny(
            PROVIDER_LOGIN_PARTS.iter().map(|s| s.to_string()).collect(),
        );
        match self
            .page
            .wait_for_url(&pattern, self.settings.login_redirect_timeout)
            .await?
        {
            Some(url) if url.contains("login") => {
                info!("provider login page reached, submitting credentials");
                self.page.fill(USERNAME_INPUT, &self.creds.username).await?;
                self.page.fill(PASSWORD_INPUT, &self.creds.password).await?;
                self.page
                    .click(&Locator::Css {
                        selector: LOGIN_SUBMIT.into(),
                    })
                    .await?;
                advance(state, FlowState::CredentialsSubmitted);
            }
            Some(url) => debug!(url = %url, "provider session already live, no login form"),
            None => self.stage_expired(Stage::Credentials, "provider login page")?,
        }
        self.sink.capture(self.page, "credentials").await;
        Ok(())
    }

    /// Two-factor submission, guarded on the one-time-code input being there.
    async fn submit_two_factor(&self, state: &mut FlowState) -> Result<(), FlowError> {
        sleep(self.settings.two_factor_settle).await;
        let url = self.page.current_url().await.unwrap_or_default();
        let otp_input = Locator::Css {
            selector: OTP_INPUT.into(),
        };
        let challenged = url.contains(TWO_FACTOR_FRAGMENT)
            || self.page.locator_visible(&otp_input).await.unwrap_or(false);
        if challenged {
            let code = CodeGenerator::new(&self.creds.totp_seed)?.current()?;
            info!("two-factor challenge detected, submitting one-time code");
            self.page.fill(OTP_INPUT, &code).await?;
            // The code field has no submit button; Enter is the accept action.
            self.page.submit(OTP_INPUT).await?;
            advance(state, FlowState::TwoFactorSubmitted);
        } else {
            debug!(url = %url, "no two-factor challenge, skipping");
        }
        self.sink.capture(self.page, "two factor").await;
        Ok(())
    }

    /// Wait for the authorization page, pocket its `state` token and grant
    /// consent. Expiry means the application was authorized on a prior run.
    async fn capture_consent(&self, state: &mut FlowState) -> Result<Option<String>, FlowError> {
        let token = match self
            .page
            .wait_for_url(
                &UrlPattern::contains(AUTHORIZE_FRAGMENT),
                self.settings.consent_timeout,
            )
            .await?
        {
            Some(url) => {
                let token = state_param(&url);
                if token.is_none() {
                    debug!(url = %url, "authorization page carries no state parameter");
                }
                self.page
                    .click(&Locator::Role {
                        role: "button".into(),
                        name: "Authorize".into(),
                    })
                    .await?;
                info!("authorization consent granted");
                advance(state, FlowState::ConsentCaptured);
                token
            }
            None => {
                let here = self.page.current_url().await.unwrap_or_default();
                info!(url = %here, "authorization page never appeared, treating as already consented");
                self.stage_expired(Stage::Consent, "authorization page")?;
                None
            }
        };
        self.sink.capture(self.page, "authorize").await;
        Ok(token)
    }

    /// Compare the `state` token echoed on the callback with the one sent.
    /// Returns whether a mismatch was observed (and tolerated).
    async fn check_callback(
        &self,
        state: &mut FlowState,
        consent_token: Option<&str>,
    ) -> Result<bool, FlowError> {
        let mut mismatch = false;
        match self
            .page
            .wait_for_url(
                &UrlPattern::contains(CALLBACK_FRAGMENT),
                self.settings.callback_timeout,
            )
            .await?
        {
            Some(url) => {
                advance(state, FlowState::CallbackObserved);
                let returned = state_param(&url);
                match (consent_token, returned.as_deref()) {
                    (Some(sent), Some(received)) if sent == received => {
                        debug!("state token round-tripped intact");
                    }
                    (Some(sent), Some(received)) => {
                        mismatch = true;
                        match self.settings.state_token_policy {
                            StateTokenPolicy::Strict => {
                                self.sink.capture(self.page, "state mismatch").await;
                                return Err(FlowError::StateTokenMismatch {
                                    sent: sent.into(),
                                    received: received.into(),
                                });
                            }
                            StateTokenPolicy::Advisory => {
                                warn!(sent, received, "state token mismatch on callback");
                            }
                        }
                    }
                    _ => debug!("state token absent on one side, nothing to compare"),
                }
            }
            None => self.stage_expired(Stage::Callback, "authorization callback")?,
        }
        self.sink.capture(self.page, "callback").await;
        Ok(mismatch)
    }

    /// Wait for the address to come back to the console. Expiry falls through
    /// to verification against whatever address is current.
    async fn await_return(&self) -> Result<(), FlowError> {
        let returned = self
            .page
            .wait_for_url(
                &UrlPattern::StartsWith(self.settings.target_url.clone()),
                self.settings.final_redirect_timeout,
            )
            .await?;
        if returned.is_none() {
            self.stage_expired(Stage::FinalRedirect, "console address")?;
            let here = self.page.current_url().await.unwrap_or_default();
            warn!(url = %here, "console address not reached in time, verifying in place");
        }
        self.sink.capture(self.page, "final redirect").await;
        Ok(())
    }

    /// The authoritative re-detection.
    async fn verify(
        &self,
        mut state: FlowState,
        token_mismatch: bool,
    ) -> Result<FlowReport, FlowError> {
        let verdict = detect::verify_final(self.page).await;
        let final_url = self.page.current_url().await.unwrap_or_default();
        self.sink.capture(self.page, "final").await;
        if verdict.authenticated {
            advance(&mut state, FlowState::Verified);
            info!(reason = ?verdict.reason, url = %final_url, "login verified");
            Ok(FlowReport {
                state,
                authenticated: true,
                reason: verdict.reason,
                final_url,
                token_mismatch,
            })
        } else {
            advance(&mut state, FlowState::Failed);
            Err(FlowError::VerificationFailed { url: final_url })
        }
    }

    /// Interpret an expired stage bound through the policy table.
    fn stage_expired(&self, stage: Stage, what: &str) -> Result<(), FlowError> {
        match expiry_policy(stage) {
            ExpiryPolicy::Advisory => {
                debug!(stage = ?stage, what, "stage bound expired, continuing");
                Ok(())
            }
            ExpiryPolicy::Fatal => Err(FlowError::StageTimeout { stage }),
        }
    }
}

fn advance(state: &mut FlowState, to: FlowState) {
    debug!(from = ?*state, to = ?to, "flow state");
    *state = to;
}

/// The OAuth correlation token from an address's query string.
pub fn state_param(address: &str) -> Option<String> {
    let parsed = Url::parse(address).ok()?;
    parsed
        .query_pairs()
        .find(|(key, _)| key == "state")
        .map(|(_, value)| value.into_owned())
}
