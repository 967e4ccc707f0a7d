use anyhow::Result;
use std::time::Duration;
use tracing::{info, warn};

use feedlog_core::service::{FeedlogService, SyncMode};
use feedlog_core::sync::{Backoff, SyncRemote, SyncSummary};

fn print_summary(summary: &SyncSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(summary)?);
        return Ok(());
    }

    let push = &summary.push;
    println!(
        "Pushed {} change(s), {} conflict(s), {} failed, {} held back",
        push.pushed, push.conflicts, push.failed, push.skipped
    );
    if push.interrupted {
        println!("Server unavailable; remaining changes stay queued.");
    }
    if let Some(pull) = summary.pull {
        println!(
            "Pulled {} page(s): {} applied, {} deleted, {} waiting on local edits",
            pull.pages, pull.applied, pull.deleted, pull.deferred
        );
    }
    if push.conflicts > 0 {
        println!("Run `feedlog conflicts list` to review conflicts.");
    }
    Ok(())
}

pub(crate) async fn cmd_sync<R: SyncRemote + ?Sized>(
    service: &FeedlogService,
    remote: &R,
    mode: SyncMode,
    json: bool,
) -> Result<()> {
    let summary = service.sync(remote, mode).await?;
    print_summary(&summary, json)
}

/// Sync every `interval` until Ctrl-C. Failed or interrupted cycles retry
/// with exponential backoff instead of the fixed interval.
pub(crate) async fn cmd_sync_watch<R: SyncRemote + ?Sized>(
    service: &FeedlogService,
    remote: &R,
    mode: SyncMode,
    interval: Duration,
    json: bool,
) -> Result<()> {
    let mut backoff = Backoff::default();
    loop {
        let delay = match service.sync(remote, mode).await {
            Ok(summary) => {
                print_summary(&summary, json)?;
                if summary.push.interrupted {
                    backoff.next_delay()
                } else {
                    backoff.reset();
                    interval
                }
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    attempt = backoff.attempt(),
                    retry_in_secs = delay.as_secs(),
                    "sync failed: {e:#}"
                );
                delay
            }
        };

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("stopping sync watch");
                return Ok(());
            }
        }
    }
}
