use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cloudgate::browser::{Browser, SessionConfig};
use cloudgate::checkpoint::CheckpointSink;
use cloudgate::config::{Credentials, Fingerprint, FlowSettings};
use cloudgate::flow::{FlowReport, LoginFlow};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match run().await {
        Ok(report) => {
            info!(url = %report.final_url, reason = ?report.reason, "login succeeded");
            std::process::exit(0);
        }
        Err(e) => {
            error!(error = ?e, "login run failed");
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<FlowReport> {
    // Identity inputs are validated before any network activity.
    let creds = Credentials::from_env()?;
    let settings = FlowSettings::from_env();
    let sink = CheckpointSink::for_run(&settings.artifacts_dir);
    info!(
        target = %settings.target_url,
        artifacts = %sink.dir().display(),
        "starting login run"
    );

    let browser = Browser::launch(SessionConfig {
        headless: settings.headless,
        fingerprint: Fingerprint::default(),
        nav_timeout: settings.nav_timeout,
    })
    .await?;

    let outcome = drive(&browser, &creds, &settings, &sink).await;

    if let Err(e) = browser.close().await {
        warn!(error = %e, "browser teardown failed");
    }

    let report = outcome?;
    let marker = sink
        .write_success_marker(&report.final_url, report.reason.as_deref())
        .await?;
    info!(marker = %marker.display(), "success marker written");
    Ok(report)
}

async fn drive(
    browser: &Browser,
    creds: &Credentials,
    settings: &FlowSettings,
    sink: &CheckpointSink,
) -> Result<FlowReport> {
    browser.goto(&settings.target_url).await?;

    match LoginFlow::new(browser, creds, settings, sink).run().await {
        Ok(report) => Ok(report),
        Err(e) => {
            // Leave a last checkpoint so the cause is reconstructable
            // without re-running.
            sink.capture(browser, "fatal error").await;
            Err(e.into())
        }
    }
}
