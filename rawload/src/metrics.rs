use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use crate::report::Report;
use crate::sampler::{CollectionCounts, SampleTable};

/// Stable storage index of one worker, assigned once when the worker is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerSlot(usize);

impl WorkerSlot {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

/// Latency samples of one measured worker, in recording order.
#[derive(Debug, Default)]
struct SlotSamples {
    requests: Vec<Duration>,
    responses: Vec<Duration>,
    totals: Vec<Duration>,
    responded_at: Vec<Instant>,
}

impl SlotSamples {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            requests: Vec::with_capacity(capacity),
            responses: Vec::with_capacity(capacity),
            totals: Vec::with_capacity(capacity),
            responded_at: Vec::with_capacity(capacity),
        }
    }
}

struct Slot {
    connection_time: OnceLock<Duration>,
    request_count: AtomicU64,
    success_count: AtomicU64,
    /// `None` for unmeasured workers. The lock is only ever taken by the owning
    /// worker and, once, by the aggregator.
    samples: Option<Mutex<SlotSamples>>,
}

/// Point-in-time copy of one slot, for inspection after a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlotSnapshot {
    pub connection_time: Option<Duration>,
    pub request_count: u64,
    pub success_count: u64,
    pub request_durations: Vec<Duration>,
    pub response_durations: Vec<Duration>,
    pub total_durations: Vec<Duration>,
    pub response_timestamps: Vec<Instant>,
}

/// Per-worker metrics, indexed by [`WorkerSlot`].
///
/// Each slot is written only by the worker that owns it, so recording never
/// contends with another worker. Counters are relaxed atomics; sample sequences
/// exist only for measured slots (the first `measured` of `thread_count`).
pub struct MetricsStore {
    slots: Vec<Slot>,
}

impl MetricsStore {
    pub fn new(thread_count: usize, measured: usize, capacity: usize) -> Self {
        let slots = (0..thread_count)
            .map(|index| Slot {
                connection_time: OnceLock::new(),
                request_count: AtomicU64::new(0),
                success_count: AtomicU64::new(0),
                samples: (index < measured).then(|| Mutex::new(SlotSamples::with_capacity(capacity))),
            })
            .collect();
        Self { slots }
    }

    pub fn thread_count(&self) -> usize {
        self.slots.len()
    }

    pub fn is_measured(&self, slot: WorkerSlot) -> bool {
        self.slots[slot.index()].samples.is_some()
    }

    /// Set once; later calls for the same slot are ignored.
    pub fn record_connection_time(&self, slot: WorkerSlot, elapsed: Duration) {
        let _ = self.slots[slot.index()].connection_time.set(elapsed);
    }

    pub fn record_request(&self, slot: WorkerSlot, elapsed: Duration) {
        if let Some(mut samples) = self.samples(slot) {
            samples.requests.push(elapsed);
        }
    }

    pub fn record_response(&self, slot: WorkerSlot, at: Instant, elapsed: Duration) {
        if let Some(mut samples) = self.samples(slot) {
            samples.responded_at.push(at);
            samples.responses.push(elapsed);
        }
    }

    pub fn record_total(&self, slot: WorkerSlot, elapsed: Duration) {
        if let Some(mut samples) = self.samples(slot) {
            samples.totals.push(elapsed);
        }
    }

    pub fn record_status(&self, slot: WorkerSlot, ok: bool) {
        if ok {
            self.slots[slot.index()].success_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn increment_request_count(&self, slot: WorkerSlot) {
        self.slots[slot.index()].request_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, slot: WorkerSlot) -> SlotSnapshot {
        let entry = &self.slots[slot.index()];
        let mut snapshot = SlotSnapshot {
            connection_time: entry.connection_time.get().copied(),
            request_count: entry.request_count.load(Ordering::Relaxed),
            success_count: entry.success_count.load(Ordering::Relaxed),
            ..SlotSnapshot::default()
        };
        if let Some(samples) = self.samples(slot) {
            snapshot.request_durations = samples.requests.clone();
            snapshot.response_durations = samples.responses.clone();
            snapshot.total_durations = samples.totals.clone();
            snapshot.response_timestamps = samples.responded_at.clone();
        }
        snapshot
    }

    /// Summarise the run. Called once, after the workers finished or the grace
    /// period ran out; a still-running worker simply contributes what it has so far.
    ///
    /// CPU usage and collection deltas are windowed to the first and last measured
    /// response. With no measured responses every windowed figure is zero.
    pub fn aggregate(&self, started_at: Instant, samples: &SampleTable) -> Report {
        let mut connection = Mean::default();
        let mut request = Mean::default();
        let mut response = Mean::default();
        let mut total = Mean::default();
        let mut window: Option<(Instant, Instant)> = None;
        let mut requests: u64 = 0;
        let mut successes: u64 = 0;

        for (index, slot) in self.slots.iter().enumerate() {
            if let Some(elapsed) = slot.connection_time.get() {
                connection.add(*elapsed);
            }
            requests += slot.request_count.load(Ordering::Relaxed);
            successes += slot.success_count.load(Ordering::Relaxed);

            let Some(guard) = self.samples(WorkerSlot::new(index)) else {
                continue;
            };
            guard.requests.iter().for_each(|d| request.add(*d));
            guard.responses.iter().for_each(|d| response.add(*d));
            guard.totals.iter().for_each(|d| total.add(*d));
            for &at in &guard.responded_at {
                window = Some(match window {
                    None => (at, at),
                    Some((first, last)) => (first.min(at), last.max(at)),
                });
            }
        }

        let requests_per_sec = window
            .map(|(_, last)| last.saturating_duration_since(started_at).as_secs_f64())
            .filter(|secs| *secs > 0.0)
            .map_or(0.0, |secs| requests as f64 / secs);
        let processor_usage_pct = window.map_or(0.0, |(first, last)| samples.processor_usage(first, last));
        let collections = window.map_or(CollectionCounts::default(), |(first, last)| {
            samples.collection_delta(first, last)
        });

        Report {
            connection_avg_ms: connection.ms(),
            request_avg_ms: request.ms(),
            response_avg_ms: response.ms(),
            total_avg_ms: total.ms(),
            requests_per_sec,
            requests,
            successes,
            errors: requests.saturating_sub(successes),
            processor_usage_pct,
            collections,
        }
    }

    fn samples(&self, slot: WorkerSlot) -> Option<MutexGuard<'_, SlotSamples>> {
        self.slots[slot.index()]
            .samples
            .as_ref()
            .map(|samples| samples.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Running mean of durations, reported in milliseconds. Empty means zero.
#[derive(Debug, Default)]
struct Mean {
    sum_secs: f64,
    count: u64,
}

impl Mean {
    fn add(&mut self, elapsed: Duration) {
        self.sum_secs += elapsed.as_secs_f64();
        self.count += 1;
    }

    fn ms(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum_secs * 1000.0 / self.count as f64
    }
}
