use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::fetcher::Fetcher;
use crate::ingest::{self, IngestError};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid interval '{0}' (expected forms like \"30s\", \"5m\" or \"1h\")")]
    BadInterval(String),
}

/// Parse a human interval like `"30s"`, `"5m"` or `"1h"`.
pub fn parse_interval(raw: &str) -> Result<Duration, SchedulerError> {
    let raw = raw.trim();
    let unit_start = raw
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| SchedulerError::BadInterval(raw.to_string()))?;
    let (value, unit) = raw.split_at(unit_start);
    let value: u64 = value
        .parse()
        .map_err(|_| SchedulerError::BadInterval(raw.to_string()))?;

    let secs = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        _ => return Err(SchedulerError::BadInterval(raw.to_string())),
    };
    if secs == 0 {
        return Err(SchedulerError::BadInterval(raw.to_string()));
    }

    Ok(Duration::from_secs(secs))
}

/// Poll forever: one ingestion cycle immediately on entry, then one per
/// elapsed interval. Each cycle runs to completion before the next tick is
/// honored; ticks that elapse during a long cycle are coalesced, not
/// queued, so two cycles can never overlap. Ingestion failures are logged
/// and the loop keeps going; the loop only ends when `shutdown` signals.
pub async fn run(
    db: &Database,
    fetcher: &Fetcher,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("scheduler shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                match ingest::ingest_next(db, fetcher).await {
                    Ok(outcome) => {
                        info!(
                            feed = %outcome.feed_name,
                            items = outcome.items_seen,
                            new = outcome.new_posts,
                            "feed collected"
                        );
                    }
                    Err(IngestError::NoFeeds) => {
                        debug!("no feeds registered yet; skipping cycle");
                    }
                    Err(err) => {
                        warn!(error = %err, "ingestion cycle failed");
                    }
                }
            }
        }
    }
}
