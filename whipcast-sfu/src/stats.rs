//! Periodic transport statistics logging

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::{StatsReport, Transport};
use crate::types::MediaKind;

/// Byte counters per media kind, summed over every report of one poll
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KindTotals {
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

#[must_use]
pub fn totals_by_kind(reports: &[StatsReport]) -> HashMap<MediaKind, KindTotals> {
    let mut totals: HashMap<MediaKind, KindTotals> = HashMap::new();
    for report in reports {
        if let Some(kind) = report.kind {
            let entry = totals.entry(kind).or_default();
            entry.bytes_received += report.bytes_received;
            entry.bytes_sent += report.bytes_sent;
        }
    }
    totals
}

/// Bitrate in kbps between two cumulative byte counters
#[must_use]
pub fn kbps(previous: u64, current: u64, elapsed: Duration) -> u64 {
    let millis = elapsed.as_millis();
    if millis == 0 {
        return 0;
    }
    let bits = u128::from(current.saturating_sub(previous)) * 8;
    u64::try_from(bits / millis).unwrap_or(u64::MAX)
}

/// Log per-kind bitrates of `transport` every `period` until `cancel` fires
pub fn spawn_stats_reporter(
    owner: String,
    transport: Arc<dyn Transport>,
    period: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(period);
        timer.tick().await;
        let mut previous: HashMap<MediaKind, KindTotals> = HashMap::new();
        let mut last = Instant::now();

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = timer.tick() => {}
            }

            let reports = match transport.get_stats().await {
                Ok(reports) => reports,
                Err(e) => {
                    debug!(owner = %owner, error = %e, "Stopping stats reporter");
                    break;
                }
            };

            let now = Instant::now();
            let elapsed = now.duration_since(last);
            let current = totals_by_kind(&reports);
            for (kind, totals) in &current {
                let before = previous.get(kind).copied().unwrap_or_default();
                info!(
                    owner = %owner,
                    transport_id = %transport.id(),
                    kind = %kind,
                    recv_kbps = kbps(before.bytes_received, totals.bytes_received, elapsed),
                    send_kbps = kbps(before.bytes_sent, totals.bytes_sent, elapsed),
                    "Transport stats"
                );
            }
            previous = current;
            last = now;
        }
    });
}
