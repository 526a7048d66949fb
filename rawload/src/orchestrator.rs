use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use rawload_common::{LoadError, RunConfig, GRACE_PERIOD};
use tracing::{error, info, warn};

use crate::detector::ResponseLengthCache;
use crate::metrics::{MetricsStore, WorkerSlot};
use crate::report::Report;
use crate::sampler::{ProcessProbe, SampleTable, SysinfoProbe, SystemSampler};
use crate::worker::{self, WorkerContext};

/// What a finished run leaves behind.
pub struct RunOutcome {
    pub report: Report,
    pub metrics: Arc<MetricsStore>,
    pub samples: SampleTable,
    /// Workers that reached the end of the duration and signalled completion.
    pub completed_workers: usize,
}

/// Runs `thread_count` workers against the target and summarises the result.
///
/// The system sampler starts as soon as the generator is built, like the metrics
/// store it is sized from the configuration.
pub struct LoadGenerator {
    config: RunConfig,
    metrics: Arc<MetricsStore>,
    sampler: SystemSampler,
}

impl LoadGenerator {
    pub fn new(config: RunConfig) -> Self {
        Self::with_probe(config, SysinfoProbe::new())
    }

    pub fn with_probe<P: ProcessProbe>(config: RunConfig, probe: P) -> Self {
        let metrics = Arc::new(MetricsStore::new(
            config.thread_count,
            config.measured_threads(),
            config.metrics_capacity,
        ));
        let sampler = SystemSampler::start(probe, config.duration);
        Self { config, metrics, sampler }
    }

    /// Start every worker, wait for them (at most `duration + 5s`), then aggregate.
    ///
    /// Workers that fail or hang never abort the run: the report is built from
    /// whatever they recorded.
    pub fn run(self) -> RunOutcome {
        let LoadGenerator { config, metrics, sampler } = self;
        let thread_count = config.thread_count;

        let ctx = Arc::new(WorkerContext {
            request: Arc::new(config.request()),
            cache: Arc::new(ResponseLengthCache::new()),
            metrics: Arc::clone(&metrics),
            started_at: Instant::now(),
            config,
        });
        info!(
            threads = thread_count,
            measured = ctx.config.measured_threads(),
            target = %ctx.config.target,
            "starting workers"
        );

        let (done_tx, done_rx) = mpsc::channel::<WorkerSlot>();
        let mut spawned = 0;
        for index in 0..thread_count {
            let slot = WorkerSlot::new(index);
            let ctx = Arc::clone(&ctx);
            let done = done_tx.clone();
            // Handles are dropped: a hung worker is left detached past the deadline.
            let spawn = thread::Builder::new()
                .name(format!("rawload-worker-{index}"))
                .spawn(move || match worker::run(&ctx, slot) {
                    // The orchestrator may have stopped listening after its deadline.
                    Ok(()) => {
                        let _ = done.send(slot);
                    }
                    Err(e) => error!(slot = index, error = %e, "worker terminated"),
                });
            match spawn {
                Ok(_) => spawned += 1,
                Err(e) => {
                    let err = LoadError::WorkerSpawn(e.to_string());
                    error!(slot = index, error = %err, "worker not started");
                }
            }
        }
        drop(done_tx);

        let deadline = ctx
            .config
            .duration
            .checked_add(GRACE_PERIOD)
            .and_then(|wait| ctx.started_at.checked_add(wait));
        let completed = wait_for_workers(&done_rx, spawned, deadline);
        let samples = sampler.stop();
        let report = metrics.aggregate(ctx.started_at, &samples);
        info!(completed, spawned, "run finished");

        RunOutcome {
            report,
            metrics,
            samples,
            completed_workers: completed,
        }
    }
}

/// Collect completion signals until all `expected` arrived, every worker is gone,
/// or `deadline` passed. Without a representable deadline only the first two end
/// the wait.
fn wait_for_workers(done: &Receiver<WorkerSlot>, expected: usize, deadline: Option<Instant>) -> usize {
    let mut completed = 0;
    while completed < expected {
        let received = match deadline {
            Some(deadline) => done.recv_timeout(deadline.saturating_duration_since(Instant::now())),
            None => done.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(_) => completed += 1,
            Err(RecvTimeoutError::Timeout) => {
                warn!(completed, expected, "grace period elapsed with workers still running");
                break;
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!(completed, expected, "workers terminated without completing");
                break;
            }
        }
    }
    completed
}
