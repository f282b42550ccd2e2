use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::page::{ConsolePage, Locator};

/// Independent lookup signals for the third-party sign-in control, tried in
/// order. The console's markup is not under our control, so no single selector
/// is trusted on its own.
pub fn entry_strategies() -> Vec<Locator> {
    vec![
        Locator::Role {
            role: "button".into(),
            name: "GitHub".into(),
        },
        Locator::Text {
            pattern: "GitHub".into(),
        },
        Locator::Css {
            selector: "button[data-provider='github'], a[href*='github.com/login/oauth']".into(),
        },
        Locator::ClassFragment {
            fragment: "github".into(),
        },
    ]
}

/// Find the control that starts third-party sign-in. Each round tries every
/// strategy; when none matches, waits out the settle delay and reloads the
/// page, up to `max_attempts` rounds. Exhaustion is a normal outcome the
/// caller turns into terminal failure handling, not an error here.
pub async fn locate_entry<P: ConsolePage + ?Sized>(
    page: &P,
    max_attempts: usize,
    settle: Duration,
) -> Option<Locator> {
    let strategies = entry_strategies();
    for round in 1..=max_attempts.max(1) {
        for strategy in &strategies {
            match page.locator_visible(strategy).await {
                Ok(true) => {
                    info!(round, strategy = ?strategy, "sign-in entry located");
                    return Some(strategy.clone());
                }
                Ok(false) => {}
                Err(e) => debug!(round, strategy = ?strategy, error = %e, "strategy probe failed"),
            }
        }
        warn!(round, max_attempts, "no entry strategy matched, reloading");
        sleep(settle).await;
        if let Err(e) = page.reload().await {
            debug!(round, error = %e, "reload failed");
        }
    }
    None
}
