//! Lock-free metrics collection and periodic reporting
//!
//! Counters are plain atomics so the reception path never waits on them.
//! `report()` swaps the periodic counters to zero; totals are monotonic.
//!
//! NOTE: Relaxed ordering throughout. These are statistics only and must not
//! drive any decision.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Ingest latency bucket bounds (microseconds)
/// Buckets: ≤5, ≤10, ≤20, ≤40, ≤80, ≤160, ≤320, ≤640, ≤1280, ≤2560, >2560
const BUCKET_BOUNDS: [u64; 10] = [5, 10, 20, 40, 80, 160, 320, 640, 1280, 2560];
const NUM_BUCKETS: usize = 11;

/// Upper bound reported for each bucket (the overflow bucket doubles the last bound)
const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] = [5, 10, 20, 40, 80, 160, 320, 640, 1280, 2560, 5120];

#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(current_max, new_value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].swap(0, Ordering::Relaxed))
}

/// Upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;
    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector shared by the intake, control and collection paths
pub struct Metrics {
    /// Advertisements handed to the collection (monotonic)
    adverts_total: AtomicU64,
    /// Advertisements since last report (reset on report)
    adverts_since_report: AtomicU64,
    /// Sightings that passed admission (monotonic)
    admitted_total: AtomicU64,
    /// Sightings rejected by the admission rules (monotonic)
    rejected_total: AtomicU64,
    /// Sightings dropped while disabled (monotonic)
    disabled_drops_total: AtomicU64,
    /// Intake lines that failed to parse (monotonic)
    parse_failures_total: AtomicU64,
    /// Intake records dropped because the queue was full (monotonic)
    adverts_dropped_total: AtomicU64,
    fingerprints_added_total: AtomicU64,
    fingerprints_evicted_total: AtomicU64,
    commands_ok_total: AtomicU64,
    commands_failed_total: AtomicU64,
    /// Lifecycle events dropped because the event queue was full (monotonic)
    events_dropped_total: AtomicU64,
    /// Ingest latency (reset on report)
    latency_sum_us: AtomicU64,
    latency_max_us: AtomicU64,
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            adverts_total: AtomicU64::new(0),
            adverts_since_report: AtomicU64::new(0),
            admitted_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
            disabled_drops_total: AtomicU64::new(0),
            parse_failures_total: AtomicU64::new(0),
            adverts_dropped_total: AtomicU64::new(0),
            fingerprints_added_total: AtomicU64::new(0),
            fingerprints_evicted_total: AtomicU64::new(0),
            commands_ok_total: AtomicU64::new(0),
            commands_failed_total: AtomicU64::new(0),
            events_dropped_total: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_advert(&self) {
        self.adverts_total.fetch_add(1, Ordering::Relaxed);
        self.adverts_since_report.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an admitted sighting and the time spent ingesting it
    #[inline]
    pub fn record_admitted(&self, latency_us: u64) {
        self.admitted_total.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_rejected(&self) {
        self.rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_disabled_drop(&self) {
        self.disabled_drops_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_parse_failure(&self) {
        self.parse_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_advert_dropped(&self) {
        self.adverts_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_fingerprint_added(&self) {
        self.fingerprints_added_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_fingerprint_evicted(&self) {
        self.fingerprints_evicted_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_command(&self, ok: bool) {
        let counter = if ok { &self.commands_ok_total } else { &self.commands_failed_total };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event_dropped(&self) {
        self.events_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn adverts_total(&self) -> u64 {
        self.adverts_total.load(Ordering::Relaxed)
    }

    pub fn admitted_total(&self) -> u64 {
        self.admitted_total.load(Ordering::Relaxed)
    }

    pub fn rejected_total(&self) -> u64 {
        self.rejected_total.load(Ordering::Relaxed)
    }

    pub fn disabled_drops_total(&self) -> u64 {
        self.disabled_drops_total.load(Ordering::Relaxed)
    }

    pub fn parse_failures_total(&self) -> u64 {
        self.parse_failures_total.load(Ordering::Relaxed)
    }

    pub fn fingerprints_added_total(&self) -> u64 {
        self.fingerprints_added_total.load(Ordering::Relaxed)
    }

    pub fn fingerprints_evicted_total(&self) -> u64 {
        self.fingerprints_evicted_total.load(Ordering::Relaxed)
    }

    pub fn events_dropped_total(&self) -> u64 {
        self.events_dropped_total.load(Ordering::Relaxed)
    }

    /// Snapshot totals and swap the periodic counters to zero
    pub fn report(&self, fingerprints: usize, counted: usize) -> MetricsSummary {
        let adverts_count = self.adverts_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.latency_buckets);
        let ingested: u64 = lat_buckets.iter().sum();

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };
        let adverts_per_sec = if elapsed.as_secs_f64() > 0.0 {
            adverts_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            adverts_total: self.adverts_total(),
            adverts_per_sec,
            admitted_total: self.admitted_total(),
            rejected_total: self.rejected_total(),
            disabled_drops_total: self.disabled_drops_total(),
            parse_failures_total: self.parse_failures_total(),
            adverts_dropped_total: self.adverts_dropped_total.load(Ordering::Relaxed),
            fingerprints_added_total: self.fingerprints_added_total(),
            fingerprints_evicted_total: self.fingerprints_evicted_total(),
            commands_ok_total: self.commands_ok_total.load(Ordering::Relaxed),
            commands_failed_total: self.commands_failed_total.load(Ordering::Relaxed),
            events_dropped_total: self.events_dropped_total(),
            avg_ingest_latency_us: if ingested > 0 { latency_sum / ingested } else { 0 },
            max_ingest_latency_us: max_latency,
            lat_buckets,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
            fingerprints,
            counted,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct MetricsSummary {
    pub adverts_total: u64,
    pub adverts_per_sec: f64,
    pub admitted_total: u64,
    pub rejected_total: u64,
    pub disabled_drops_total: u64,
    pub parse_failures_total: u64,
    pub adverts_dropped_total: u64,
    pub fingerprints_added_total: u64,
    pub fingerprints_evicted_total: u64,
    pub commands_ok_total: u64,
    pub commands_failed_total: u64,
    pub events_dropped_total: u64,
    pub avg_ingest_latency_us: u64,
    pub max_ingest_latency_us: u64,
    /// Bounds: ≤5, ≤10, ≤20, ≤40, ≤80, ≤160, ≤320, ≤640, ≤1280, ≤2560, >2560 µs
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p99_us: u64,
    /// Live fingerprints at report time
    pub fingerprints: usize,
    /// Counted devices at report time
    pub counted: usize,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            adverts_total = %self.adverts_total,
            adverts_per_sec = format!("{:.1}", self.adverts_per_sec),
            admitted = %self.admitted_total,
            rejected = %self.rejected_total,
            disabled_drops = %self.disabled_drops_total,
            parse_failures = %self.parse_failures_total,
            fingerprints = %self.fingerprints,
            counted = %self.counted,
            evicted = %self.fingerprints_evicted_total,
            avg_ingest_us = %self.avg_ingest_latency_us,
            p99_ingest_us = %self.lat_p99_us,
            events_dropped = %self.events_dropped_total,
            "metrics"
        );
    }
}
