//! Shared metrics collection for a load run.
//!
//! A single [`Collector`] is shared by every producer and consumer worker.
//! Counters are plain atomics; latency samples and per-stream sequence
//! trackers sit behind one short critical section that is never held across
//! broker I/O. [`Collector::snapshot`] produces an immutable [`Snapshot`] that
//! reporting and export code can keep without further locking.

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Identifies one integrity-tracked stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TrackerKey {
    topic: String,
    subscription: String,
    producer: String,
}

/// Observed sequence numbers for one (topic, subscription, producer) stream.
///
/// Once a value has been recorded, recording it again only bumps
/// `duplicates`; the distinct set never changes for a repeated value.
#[derive(Debug, Clone)]
pub struct SequenceTracker {
    min: u64,
    max: u64,
    seen: HashSet<u64>,
    duplicates: u64,
}

impl SequenceTracker {
    fn new(seq: u64) -> Self {
        Self {
            min: seq,
            max: seq,
            seen: HashSet::new(),
            duplicates: 0,
        }
    }

    /// Records one observation. Returns `true` when `seq` was already seen.
    pub fn record(&mut self, seq: u64) -> bool {
        self.min = self.min.min(seq);
        self.max = self.max.max(seq);
        if self.seen.insert(seq) {
            false
        } else {
            self.duplicates += 1;
            true
        }
    }

    pub fn unique_seen(&self) -> u64 {
        self.seen.len() as u64
    }

    /// Values in `[min, max]` that were never observed.
    pub fn loss(&self) -> u64 {
        (self.max - self.min)
            .saturating_add(1)
            .saturating_sub(self.unique_seen())
    }
}

#[derive(Default)]
struct Samples {
    latencies_ms: Vec<f64>,
    trackers: IndexMap<TrackerKey, SequenceTracker>,
}

/// Thread-safe metrics sink shared by all workers of a run.
pub struct Collector {
    start: Instant,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    errors: AtomicU64,
    samples: Mutex<Samples>,
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            samples: Mutex::new(Samples::default()),
        }
    }

    pub fn inc_sent(&self, n: u64) {
        self.messages_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_received(&self, n: u64) {
        self.messages_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_error(&self, n: u64) {
        self.errors.fetch_add(n, Ordering::Relaxed);
    }

    /// Appends an end-to-end latency sample in milliseconds.
    ///
    /// Callers filter out negative values (clock skew) before recording.
    pub fn record_latency(&self, ms: f64) {
        debug_assert!(ms >= 0.0, "negative latency sample {ms}");
        self.samples.lock().latencies_ms.push(ms);
    }

    /// Records an observed sequence number for a topic/subscription/producer stream.
    pub fn record_seq(&self, topic: &str, subscription: &str, producer: &str, seq: u64) {
        let key = TrackerKey {
            topic: topic.to_string(),
            subscription: subscription.to_string(),
            producer: producer.to_string(),
        };
        let mut samples = self.samples.lock();
        samples
            .trackers
            .entry(key)
            .or_insert_with(|| SequenceTracker::new(seq))
            .record(seq);
    }

    /// Builds a point-in-time view of everything collected so far.
    ///
    /// Only the copy happens under the lock; sorting and percentile work run
    /// on the private copy.
    pub fn snapshot(&self) -> Snapshot {
        let elapsed_sec = self.start.elapsed().as_secs_f64();
        let messages_sent = self.messages_sent.load(Ordering::Relaxed);
        let messages_received = self.messages_received.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);

        let (mut latencies, integrity_breakdown) = {
            let samples = self.samples.lock();
            let breakdown: Vec<IntegrityEntry> = samples
                .trackers
                .iter()
                .map(|(key, tracker)| IntegrityEntry {
                    topic: key.topic.clone(),
                    subscription: key.subscription.clone(),
                    producer: key.producer.clone(),
                    min: tracker.min,
                    max: tracker.max,
                    unique_seen: tracker.unique_seen(),
                    loss: tracker.loss(),
                    duplicates: tracker.duplicates,
                })
                .collect();
            (samples.latencies_ms.clone(), breakdown)
        };

        latencies.sort_by(|a, b| a.total_cmp(b));
        let (p50, p95, p99, max) = percentiles(&latencies);

        let duplicates = integrity_breakdown.iter().map(|e| e.duplicates).sum();
        let estimated_loss = integrity_breakdown
            .iter()
            .fold(0u64, |acc, e| acc.saturating_add(e.loss));

        Snapshot {
            elapsed_sec,
            messages_sent,
            messages_received,
            errors,
            throughput_sent: rate(messages_sent, elapsed_sec),
            throughput_recv: rate(messages_received, elapsed_sec),
            latency_p50_ms: p50,
            latency_p95_ms: p95,
            latency_p99_ms: p99,
            latency_max_ms: max,
            latency_samples: latencies.len(),
            duplicates,
            estimated_loss,
            integrity_breakdown,
        }
    }
}

/// Immutable aggregate view of a run's metrics at one instant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub elapsed_sec: f64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub errors: u64,
    pub throughput_sent: f64,
    pub throughput_recv: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub latency_max_ms: f64,
    pub latency_samples: usize,
    pub duplicates: u64,
    pub estimated_loss: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub integrity_breakdown: Vec<IntegrityEntry>,
}

/// Integrity figures for one tracked stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityEntry {
    pub topic: String,
    pub subscription: String,
    pub producer: String,
    pub min: u64,
    pub max: u64,
    pub unique_seen: u64,
    pub loss: u64,
    pub duplicates: u64,
}

impl IntegrityEntry {
    pub fn in_sla(&self) -> bool {
        self.loss == 0 && self.duplicates == 0
    }
}

fn rate(total: u64, elapsed_sec: f64) -> f64 {
    if elapsed_sec <= 0.0 {
        return 0.0;
    }
    total as f64 / elapsed_sec
}

/// Nearest-rank p50/p95/p99/max over an ascending slice.
///
/// The index for percentile `p` is `round(p * (n - 1))`, clamped to the slice.
pub fn percentiles(sorted: &[f64]) -> (f64, f64, f64, f64) {
    let n = sorted.len();
    if n == 0 {
        return (0.0, 0.0, 0.0, 0.0);
    }
    let at = |p: f64| {
        let idx = (p * (n - 1) as f64).round() as usize;
        sorted[idx.min(n - 1)]
    };
    (at(0.50), at(0.95), at(0.99), sorted[n - 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_loss_over_full_u64_range_saturates() {
        let collector = Collector::new();
        collector.record_seq("t", "s", "p", 0);
        collector.record_seq("t", "s", "p", u64::MAX);
        let snap = collector.snapshot();
        let entry = &snap.integrity_breakdown[0];
        assert_eq!(entry.min, 0);
        assert_eq!(entry.max, u64::MAX);
        assert_eq!(entry.unique_seen, 2);
        // The range holds 2^64 values; the count saturates at u64::MAX.
        assert_eq!(entry.loss, u64::MAX - 2);

        collector.record_seq("t", "s", "q", 0);
        collector.record_seq("t", "s", "q", u64::MAX);
        assert_eq!(collector.snapshot().estimated_loss, u64::MAX);
    }

    #[test]
    fn test_percentiles_empty() {
        assert_eq!(percentiles(&[]), (0.0, 0.0, 0.0, 0.0));
    }

    #[test]
    fn test_percentiles_single() {
        assert_eq!(percentiles(&[42.0]), (42.0, 42.0, 42.0, 42.0));
    }

    #[test]
    fn test_percentiles_typical() {
        let mut input = vec![10.0_f64, 1.0, 5.0, 7.0, 50.0, 20.0, 3.0, 2.0, 100.0, 8.0];
        input.sort_by(|a, b| a.total_cmp(b));
        let (p50, p95, p99, max) = percentiles(&input);

        // n = 10: p50 -> idx round(4.5) = 5, p95 -> round(8.55) = 9
        assert_eq!(p50, 8.0);
        assert_eq!(p95, 100.0);
        assert_eq!(p99, 100.0);
        assert_eq!(max, 100.0);
    }

    #[test]
    fn test_percentiles_are_monotonic() {
        let sorted: Vec<f64> = (0..1000).map(|i| (i * i) as f64 / 7.0).collect();
        let (p50, p95, p99, max) = percentiles(&sorted);
        assert!(p50 <= p95);
        assert!(p95 <= p99);
        assert!(p99 <= max);
    }

    #[test]
    fn test_record_seq_loss_and_duplicates_single_key() {
        let collector = Collector::new();
        let (topic, sub, prod) = ("/default/test", "sub", "producer-1");
        for seq in [1, 2, 3, 3, 5] {
            collector.record_seq(topic, sub, prod, seq);
        }

        let snap = collector.snapshot();
        assert_eq!(snap.estimated_loss, 1);
        assert_eq!(snap.duplicates, 1);
        assert_eq!(snap.integrity_breakdown.len(), 1);

        let entry = &snap.integrity_breakdown[0];
        assert_eq!(
            (entry.topic.as_str(), entry.subscription.as_str(), entry.producer.as_str()),
            (topic, sub, prod)
        );
        assert_eq!((entry.min, entry.max), (1, 5));
        assert_eq!(entry.unique_seen, 4);
        assert_eq!((entry.loss, entry.duplicates), (1, 1));
        assert!(!entry.in_sla());
    }

    #[test]
    fn test_record_seq_isolated_keys_do_not_interfere() {
        let collector = Collector::new();
        let (topic, sub) = ("/default/test", "sub");
        collector.record_seq(topic, sub, "producer-A", 1);
        collector.record_seq(topic, sub, "producer-A", 2);
        collector.record_seq(topic, sub, "producer-B", 10);
        collector.record_seq(topic, sub, "producer-B", 12);

        let snap = collector.snapshot();
        assert_eq!(snap.estimated_loss, 1);
        assert_eq!(snap.duplicates, 0);
        assert_eq!(snap.integrity_breakdown.len(), 2);

        let a = &snap.integrity_breakdown[0];
        assert_eq!(a.producer, "producer-A");
        assert_eq!((a.min, a.max, a.unique_seen, a.loss), (1, 2, 2, 0));
        assert!(a.in_sla());

        let b = &snap.integrity_breakdown[1];
        assert_eq!(b.producer, "producer-B");
        assert_eq!((b.min, b.max, b.unique_seen, b.loss), (10, 12, 2, 1));
    }

    #[test]
    fn test_out_of_order_sequences_widen_range() {
        let mut tracker = SequenceTracker::new(5);
        assert!(!tracker.record(5));
        assert!(!tracker.record(3));
        assert!(!tracker.record(4));
        assert!(tracker.record(3));
        assert_eq!((tracker.min, tracker.max), (3, 5));
        assert_eq!(tracker.unique_seen(), 3);
        assert_eq!(tracker.loss(), 0);
        assert_eq!(tracker.duplicates, 1);
    }

    #[test]
    fn test_snapshot_latency_statistics() {
        let collector = Collector::new();
        for ms in [4.0, 1.0, 3.0, 2.0] {
            collector.record_latency(ms);
        }
        let snap = collector.snapshot();
        assert_eq!(snap.latency_samples, 4);
        assert_eq!(snap.latency_max_ms, 4.0);
        // n = 4: p50 -> idx round(1.5) = 2
        assert_eq!(snap.latency_p50_ms, 3.0);
        assert!(snap.latency_p50_ms <= snap.latency_p95_ms);
    }

    #[test]
    fn test_snapshot_json_keys() {
        let value = serde_json::to_value(Snapshot::default()).unwrap();
        let object = value.as_object().unwrap();

        let required = [
            "elapsed_sec",
            "messages_sent",
            "messages_received",
            "errors",
            "throughput_sent",
            "throughput_recv",
            "latency_p50_ms",
            "latency_p95_ms",
            "latency_p99_ms",
            "latency_max_ms",
            "latency_samples",
            "duplicates",
            "estimated_loss",
        ];
        for key in required {
            assert!(object.contains_key(key), "missing json key: {key}");
        }
        assert_eq!(object.len(), required.len());
        assert!(!object.contains_key("integrity_breakdown"));
    }

    #[test]
    fn test_snapshot_json_includes_breakdown_when_tracked() {
        let collector = Collector::new();
        collector.record_seq("t", "s", "p-0", 1);
        let value = serde_json::to_value(collector.snapshot()).unwrap();
        let breakdown = value["integrity_breakdown"].as_array().unwrap();
        assert_eq!(breakdown.len(), 1);
        assert_eq!(breakdown[0]["producer"], "p-0");
        assert_eq!(breakdown[0]["unique_seen"], 1);
    }

    #[test]
    fn test_concurrent_counter_increments_are_not_lost() {
        let collector = Arc::new(Collector::new());
        let workers: Vec<_> = (0..8)
            .map(|i| {
                let collector = Arc::clone(&collector);
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        collector.inc_sent(1);
                        collector.inc_received(2);
                    }
                    collector.inc_error(i);
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let snap = collector.snapshot();
        assert_eq!(snap.messages_sent, 80_000);
        assert_eq!(snap.messages_received, 160_000);
        assert_eq!(snap.errors, (0..8).sum::<u64>());
    }

    #[test]
    fn test_snapshot_during_concurrent_recording() {
        let collector = Arc::new(Collector::new());
        let writer = {
            let collector = Arc::clone(&collector);
            std::thread::spawn(move || {
                for seq in 1..=5_000u64 {
                    collector.record_latency(seq as f64);
                    collector.record_seq("t", "s", "p", seq);
                }
            })
        };
        for _ in 0..50 {
            let snap = collector.snapshot();
            assert!(snap.latency_p50_ms <= snap.latency_max_ms);
            assert_eq!(snap.estimated_loss, 0);
        }
        writer.join().unwrap();

        let snap = collector.snapshot();
        assert_eq!(snap.latency_samples, 5_000);
        assert_eq!(snap.integrity_breakdown[0].unique_seen, 5_000);
    }
}
