use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::flow::StateTokenPolicy;

pub const DEFAULT_TARGET_URL: &str = "https://us-west-1.run.claw.cloud/";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
}

/// Externally supplied identity inputs. Read once, never mutated, held only in
/// process memory for the run.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Base32 shared secret for the one-time-code generator.
    pub totp_seed: String,
}

impl Credentials {
    /// Fails before any network activity when a required input is absent.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |key: &'static str| {
            get(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::MissingVar(key))
        };
        Ok(Self {
            username: required("GH_USERNAME")?,
            password: required("GH_PASSWORD")?,
            totp_seed: required("GH_2FA_SECRET")?,
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never let secrets reach logs through a stray {:?}.
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .field("totp_seed", &"***")
            .finish()
    }
}

/// The identity the remote site sees. Fixed values resembling an ordinary
/// interactive Chrome session.
#[derive(Clone, Debug)]
pub struct Fingerprint {
    pub viewport: (u32, u32),
    pub user_agent: String,
    pub locale: String,
    pub timezone: String,
    pub accept_language: String,
}

impl Default for Fingerprint {
    fn default() -> Self {
        Self {
            viewport: (1920, 1080),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36"
                .into(),
            locale: "en-US".into(),
            timezone: "America/Los_Angeles".into(),
            accept_language: "en-US,en;q=0.9".into(),
        }
    }
}

/// Per-run knobs. Timeouts are per-operation and non-composable; there is no
/// global run deadline.
#[derive(Clone, Debug)]
pub struct FlowSettings {
    pub target_url: String,
    pub headless: bool,
    pub artifacts_dir: PathBuf,
    /// Lookup-and-reload rounds for the sign-in entry control.
    pub entry_attempts: usize,
    /// Settle delay between entry lookup rounds.
    pub entry_settle: Duration,
    pub nav_timeout: Duration,
    pub login_redirect_timeout: Duration,
    pub two_factor_settle: Duration,
    pub consent_timeout: Duration,
    pub callback_timeout: Duration,
    pub final_redirect_timeout: Duration,
    pub state_token_policy: StateTokenPolicy,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            target_url: DEFAULT_TARGET_URL.into(),
            headless: true,
            artifacts_dir: PathBuf::from("artifacts"),
            entry_attempts: 3,
            entry_settle: Duration::from_millis(1200),
            nav_timeout: Duration::from_secs(30),
            login_redirect_timeout: Duration::from_secs(20),
            two_factor_settle: Duration::from_secs(2),
            consent_timeout: Duration::from_secs(25),
            callback_timeout: Duration::from_secs(10),
            final_redirect_timeout: Duration::from_secs(30),
            state_token_policy: StateTokenPolicy::Advisory,
        }
    }
}

impl FlowSettings {
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Ok(url) = env::var("CONSOLE_URL") {
            if !url.trim().is_empty() {
                settings.target_url = url;
            }
        }
        if let Ok(dir) = env::var("CLOUDGATE_ARTIFACTS") {
            if !dir.trim().is_empty() {
                settings.artifacts_dir = PathBuf::from(dir);
            }
        }
        if env_flag("CLOUDGATE_STRICT_STATE") {
            settings.state_token_policy = StateTokenPolicy::Strict;
        }
        if let Ok(v) = env::var("CLOUDGATE_HEADLESS") {
            settings.headless = !matches!(v.trim(), "0" | "false" | "no");
        }
        settings
    }
}

fn env_flag(key: &str) -> bool {
    matches!(
        env::var(key).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}
