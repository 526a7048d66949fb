use std::sync::Arc;
use std::time::Instant;

use rawload_common::{RequestTemplate, Result, RunConfig};
use tracing::debug;

use crate::connection::ConnectionWorker;
use crate::detector::ResponseLengthCache;
use crate::metrics::{MetricsStore, WorkerSlot};

/// State shared by every worker of a run.
pub struct WorkerContext {
    pub config: RunConfig,
    pub request: Arc<RequestTemplate>,
    pub cache: Arc<ResponseLengthCache>,
    pub metrics: Arc<MetricsStore>,
    /// Captured once before any worker starts; every stop decision is relative to it.
    pub started_at: Instant,
}

impl WorkerContext {
    fn in_progress(&self) -> bool {
        self.started_at.elapsed() < self.config.duration
    }
}

/// Drive one connection until the run duration elapsed.
///
/// Measured slots time every phase of each round trip; the others only count.
/// Any connection or protocol error ends the worker immediately.
pub fn run(ctx: &WorkerContext, slot: WorkerSlot) -> Result<()> {
    let measured = ctx.metrics.is_measured(slot);
    debug!(slot = slot.index(), measured, "worker starting");

    let connect_start = Instant::now();
    let mut conn = ConnectionWorker::connect(&ctx.config, Arc::clone(&ctx.request), Arc::clone(&ctx.cache))?;
    ctx.metrics.record_connection_time(slot, connect_start.elapsed());

    if measured {
        run_measured(ctx, slot, &mut conn)?;
    } else {
        run_unmeasured(ctx, slot, &mut conn)?;
    }

    conn.close();
    debug!(slot = slot.index(), "worker finished");
    Ok(())
}

fn run_measured(ctx: &WorkerContext, slot: WorkerSlot, conn: &mut ConnectionWorker) -> Result<()> {
    let metrics = &ctx.metrics;
    while ctx.in_progress() {
        let round_trip = Instant::now();
        conn.send_request()?;
        let request_time = round_trip.elapsed();
        metrics.record_request(slot, request_time);

        let ok = conn.await_response()?;
        let responded_at = Instant::now();
        let total = responded_at.saturating_duration_since(round_trip);
        metrics.record_response(slot, responded_at, total.saturating_sub(request_time));
        metrics.record_total(slot, total);
        metrics.increment_request_count(slot);
        metrics.record_status(slot, ok);
    }
    Ok(())
}

fn run_unmeasured(ctx: &WorkerContext, slot: WorkerSlot, conn: &mut ConnectionWorker) -> Result<()> {
    while ctx.in_progress() {
        conn.send_request()?;
        let ok = conn.await_response()?;
        ctx.metrics.increment_request_count(slot);
        ctx.metrics.record_status(slot, ok);
    }
    Ok(())
}
