//! Background sampling of process CPU time and collection counts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rawload_common::SAMPLE_INTERVAL;
use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, warn};

/// Table pre-size headroom over duration / interval.
const CAPACITY_FACTOR: f64 = 1.1;
/// Upper bound on the pre-size; tables still grow past it.
const MAX_PRESIZE: usize = 1 << 20;

/// Cumulative collection counts per generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectionCounts {
    pub gen0: u64,
    pub gen1: u64,
    pub gen2: u64,
}

impl CollectionCounts {
    pub fn new(gen0: u64, gen1: u64, gen2: u64) -> Self {
        Self { gen0, gen1, gen2 }
    }

    pub fn delta_since(&self, earlier: &CollectionCounts) -> CollectionCounts {
        CollectionCounts {
            gen0: self.gen0.saturating_sub(earlier.gen0),
            gen1: self.gen1.saturating_sub(earlier.gen1),
            gen2: self.gen2.saturating_sub(earlier.gen2),
        }
    }
}

/// Source of the process figures the sampler records.
pub trait ProcessProbe: Send + 'static {
    /// Processor time consumed by the process so far.
    fn cpu_time(&mut self) -> Duration;

    /// Collections run so far, per generation. Processes without a tracing
    /// collector report zero.
    fn collection_counts(&mut self) -> CollectionCounts {
        CollectionCounts::default()
    }
}

/// Reads the current process's accumulated CPU time through `sysinfo`.
pub struct SysinfoProbe {
    system: System,
    pid: Option<Pid>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!(error = e, "cannot determine own pid; CPU time will read as zero");
                None
            }
        };
        Self { system: System::new(), pid }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for SysinfoProbe {
    fn cpu_time(&mut self) -> Duration {
        let Some(pid) = self.pid else {
            return Duration::ZERO;
        };
        self.system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        self.system
            .process(pid)
            .map(|process| Duration::from_millis(process.accumulated_cpu_time()))
            .unwrap_or_default()
    }
}

/// Append-only series of `(timestamp, value)` pairs in timestamp order.
#[derive(Debug, Clone)]
pub struct TimeSeries<T> {
    entries: Vec<(Instant, T)>,
}

impl<T> TimeSeries<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { entries: Vec::with_capacity(capacity) }
    }

    pub fn push(&mut self, at: Instant, value: T) {
        debug_assert!(self.entries.last().map_or(true, |(last, _)| *last <= at));
        self.entries.push((at, value));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(Instant, T)] {
        &self.entries
    }

    /// Entries with `from <= timestamp <= to`.
    pub fn window(&self, from: Instant, to: Instant) -> &[(Instant, T)] {
        let lo = self.entries.partition_point(|(at, _)| *at < from);
        let hi = self.entries.partition_point(|(at, _)| *at <= to);
        &self.entries[lo..hi.max(lo)]
    }
}

/// Everything the sampler recorded, read once sampling stopped.
#[derive(Debug, Clone)]
pub struct SampleTable {
    pub cpu_time: TimeSeries<Duration>,
    pub collections: TimeSeries<CollectionCounts>,
    pub processor_count: usize,
}

impl SampleTable {
    pub fn new(processor_count: usize) -> Self {
        Self::with_capacity(0, processor_count)
    }

    pub fn with_capacity(capacity: usize, processor_count: usize) -> Self {
        Self {
            cpu_time: TimeSeries::with_capacity(capacity),
            collections: TimeSeries::with_capacity(capacity),
            processor_count,
        }
    }

    pub fn record(&mut self, at: Instant, cpu_time: Duration, collections: CollectionCounts) {
        self.cpu_time.push(at, cpu_time);
        self.collections.push(at, collections);
    }

    /// CPU time spent between the first and last sample inside `[from, to]`, as a
    /// percentage of all processors over the wall-clock window.
    pub fn processor_usage(&self, from: Instant, to: Instant) -> f64 {
        let window = self.cpu_time.window(from, to);
        let (Some((_, first)), Some((_, last))) = (window.first(), window.last()) else {
            return 0.0;
        };
        let wall_secs = to.saturating_duration_since(from).as_secs_f64();
        if wall_secs <= 0.0 || self.processor_count == 0 {
            return 0.0;
        }
        last.saturating_sub(*first).as_secs_f64() / (self.processor_count as f64 * wall_secs) * 100.0
    }

    /// Collections between the first and last sample inside `[from, to]`.
    pub fn collection_delta(&self, from: Instant, to: Instant) -> CollectionCounts {
        let window = self.collections.window(from, to);
        match (window.first(), window.last()) {
            (Some((_, first)), Some((_, last))) => last.delta_since(first),
            _ => CollectionCounts::default(),
        }
    }
}

/// Samples a [`ProcessProbe`] on its own thread from construction until stopped.
///
/// Stopping is cooperative: the flag is checked once per iteration after the
/// delay, so at most one sample may land after [`stop`](Self::stop) was called.
/// Aggregation windows to the response time range, which keeps such a sample out.
pub struct SystemSampler {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<SampleTable>>,
    processor_count: usize,
}

impl SystemSampler {
    pub fn start<P: ProcessProbe>(probe: P, expected_duration: Duration) -> Self {
        Self::with_interval(probe, expected_duration, SAMPLE_INTERVAL)
    }

    pub fn with_interval<P: ProcessProbe>(probe: P, expected_duration: Duration, interval: Duration) -> Self {
        let processor_count = num_cpus::get();
        let capacity = if interval.is_zero() {
            0
        } else {
            ((expected_duration.as_secs_f64() / interval.as_secs_f64() * CAPACITY_FACTOR) as usize).min(MAX_PRESIZE)
        };
        let stop = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("rawload-sampler".to_string())
            .spawn(move || sample_loop(probe, interval, capacity, processor_count, flag));
        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "failed to start system sampler; CPU figures will read as zero");
                None
            }
        };
        debug!(interval_ms = interval.as_millis() as u64, capacity, "system sampler started");

        Self { stop, handle, processor_count }
    }

    /// Request cancellation and wait for the in-flight delay to finish.
    pub fn stop(mut self) -> SampleTable {
        self.stop.store(true, Ordering::Release);
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(table)) => table,
            Some(Err(_)) => {
                warn!("system sampler thread panicked");
                SampleTable::new(self.processor_count)
            }
            None => SampleTable::new(self.processor_count),
        }
    }
}

impl Drop for SystemSampler {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

fn sample_loop<P: ProcessProbe>(
    mut probe: P,
    interval: Duration,
    capacity: usize,
    processor_count: usize,
    stop: Arc<AtomicBool>,
) -> SampleTable {
    let mut table = SampleTable::with_capacity(capacity, processor_count);
    loop {
        let now = Instant::now();
        let cpu_time = probe.cpu_time();
        let collections = probe.collection_counts();
        table.record(now, cpu_time, collections);

        thread::sleep(interval);
        if stop.load(Ordering::Acquire) {
            break;
        }
    }
    debug!(samples = table.cpu_time.len(), "system sampler stopped");
    table
}
