use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::dates;
use crate::engine::Engine;
use crate::model::Timestamp;
use crate::observability::{ROOMS_AVAILABLE, SWEEP_TRANSITIONS_TOTAL, WAL_COMPACTIONS_TOTAL};

/// What one sweep changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub moved_in: usize,
    pub moved_out: usize,
    pub availability_changed: usize,
}

/// Background task that advances time-driven state: request expiry,
/// move-ins, move-outs and the cached availability flags.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let report = sweep_once(&engine, dates::now()).await;
        if report != SweepReport::default() {
            info!(
                expired = report.expired,
                moved_in = report.moved_in,
                moved_out = report.moved_out,
                availability_changed = report.availability_changed,
                "sweep applied transitions"
            );
        }
    }
}

pub async fn sweep_once(engine: &Engine, now: Timestamp) -> SweepReport {
    let mut report = SweepReport::default();

    for id in engine.collect_expired_requests(now) {
        match engine.expire_request(id, now).await {
            Ok(_) => report.expired += 1,
            // Decided or expired by someone else since collection
            Err(e) => debug!("reaper skip request {id}: {e}"),
        }
    }
    for id in engine.collect_due_move_ins(now) {
        match engine.activate_occupancy(id, now).await {
            Ok(_) => report.moved_in += 1,
            Err(e) => debug!("reaper skip move-in {id}: {e}"),
        }
    }
    for id in engine.collect_due_move_outs(now) {
        match engine.end_occupancy(id, now).await {
            Ok(_) => report.moved_out += 1,
            Err(e) => debug!("reaper skip move-out {id}: {e}"),
        }
    }
    report.availability_changed = engine.refresh_all_availability(now).await;

    count(report.expired, "expired");
    count(report.moved_in, "moved_in");
    count(report.moved_out, "moved_out");
    let available = engine.list_rooms(None, true).await.len();
    metrics::gauge!(ROOMS_AVAILABLE).set(available as f64);

    report
}

fn count(n: usize, kind: &'static str) {
    if n > 0 {
        metrics::counter!(SWEEP_TRANSITIONS_TOTAL, "kind" => kind).increment(n as u64);
    }
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if engine.wal_appends_since_compact().await < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
