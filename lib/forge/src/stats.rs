use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Operation families tracked separately for latency.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OpKind {
    Get = 0,
    Set = 1,
    Delta = 2,
    Delete = 3,
    Touch = 4,
    Other = 5,
}

const OP_KINDS: usize = 6;
const HISTOGRAM_BUCKETS: usize = 64;

/// Running latency summary for one operation kind, in microseconds.
/// Welford mean plus min/max and the raw squared sum.
#[derive(Debug, Clone, Copy)]
pub struct Latency {
    pub count: u64,
    pub mean: f64,
    m2: f64,
    pub sq_sum: f64,
    pub min: u64,
    pub max: u64,
}

impl Default for Latency {
    fn default() -> Latency {
        Latency {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            sq_sum: 0.0,
            min: u64::max_value(),
            max: 0,
        }
    }
}

impl Latency {
    fn record(&mut self, micros: u64) {
        let value = micros as f64;

        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        self.sq_sum += value * value;
        self.min = self.min.min(micros);
        self.max = self.max.max(micros);
    }

    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Process-wide statistics block. Counters grow monotonically under relaxed
/// atomics; latency summaries are updated under a brief exclusive lock and
/// read as snapshots.
pub struct Stats {
    pub cmd_get: AtomicU64,
    pub cmd_set: AtomicU64,
    pub get_misses: AtomicU64,
    /// Bytes of values written and read.
    pub vset: AtomicU64,
    pub vget: AtomicU64,
    pub pkt_drop: AtomicU64,
    pub udp_timeout: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,

    latency: Mutex<[Latency; OP_KINDS]>,
    histogram: [AtomicU64; HISTOGRAM_BUCKETS],
}

impl Stats {
    pub fn new() -> Stats {
        Stats {
            cmd_get: AtomicU64::new(0),
            cmd_set: AtomicU64::new(0),
            get_misses: AtomicU64::new(0),
            vset: AtomicU64::new(0),
            vget: AtomicU64::new(0),
            pkt_drop: AtomicU64::new(0),
            udp_timeout: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            latency: Mutex::new([Latency::default(); OP_KINDS]),
            histogram: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    #[inline]
    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    /// Records one finished operation with its wall latency.
    pub fn record_op(&self, kind: OpKind, micros: u64) {
        {
            let mut latency = self.latency.lock().expect("latency lock poisoned");
            latency[kind as usize].record(micros);
        }

        let bucket = (64 - micros.leading_zeros() as usize).min(HISTOGRAM_BUCKETS - 1);
        self.histogram[bucket].fetch_add(1, Ordering::Relaxed);
    }

    /// Latency snapshot for one operation kind.
    pub fn latency(&self, kind: OpKind) -> Latency {
        self.latency.lock().expect("latency lock poisoned")[kind as usize]
    }

    /// Approximate percentile from the log2 histogram, as the upper bound of
    /// the bucket holding the `p`-quantile sample.
    pub fn percentile(&self, p: f64) -> u64 {
        let counts: Vec<u64> = self
            .histogram
            .iter()
            .map(|bucket| bucket.load(Ordering::Relaxed))
            .collect();
        let total: u64 = counts.iter().sum();
        if total == 0 {
            return 0;
        }

        let rank = ((total as f64) * p).ceil() as u64;
        let mut seen = 0;
        for (bucket, count) in counts.iter().enumerate() {
            seen += count;
            if seen >= rank {
                return if bucket >= 63 {
                    u64::max_value()
                } else {
                    (1u64 << bucket) - 1
                };
            }
        }

        u64::max_value()
    }

    pub fn total_ops(&self) -> u64 {
        self.cmd_get.load(Ordering::Relaxed) + self.cmd_set.load(Ordering::Relaxed)
    }
}

/// Per-connection transactions-per-second pacing. Once the quota for the
/// current second is spent the connection stalls until the next tick.
#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    quota: u64,
    issued: u64,
    second: u64,
}

impl Pacer {
    /// Quota 0 disables pacing.
    pub fn new(quota: u64) -> Pacer {
        Pacer {
            quota,
            issued: 0,
            second: 0,
        }
    }

    /// True if another operation may be issued during `now_secs`.
    pub fn ready(&mut self, now_secs: u64) -> bool {
        if self.quota == 0 {
            return true;
        }

        if now_secs != self.second {
            self.second = now_secs;
            self.issued = 0;
        }

        self.issued < self.quota
    }

    #[inline]
    pub fn consume(&mut self) {
        self.issued += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_welford_summary() {
        let mut latency = Latency::default();
        for value in &[2u64, 4, 4, 4, 5, 5, 7, 9] {
            latency.record(*value);
        }

        assert_eq!(latency.count, 8);
        assert!((latency.mean - 5.0).abs() < 1e-9);
        assert_eq!(latency.min, 2);
        assert_eq!(latency.max, 9);
        // Sample variance of the classic data set is 32/7.
        assert!((latency.variance() - 32.0 / 7.0).abs() < 1e-9);
        assert!((latency.sq_sum - 212.0).abs() < 1e-9);
    }

    #[test]
    fn test_counters_and_totals() {
        let stats = Stats::new();

        Stats::add(&stats.cmd_get, 3);
        Stats::add(&stats.cmd_set, 2);
        Stats::add(&stats.get_misses, 1);

        assert_eq!(stats.total_ops(), 5);
        assert!(stats.get_misses.load(Ordering::Relaxed) <= stats.cmd_get.load(Ordering::Relaxed));
    }

    #[test]
    fn test_record_op_feeds_histogram_and_latency() {
        let stats = Stats::new();

        stats.record_op(OpKind::Get, 100);
        stats.record_op(OpKind::Get, 200);
        stats.record_op(OpKind::Set, 1000);

        let get = stats.latency(OpKind::Get);
        assert_eq!(get.count, 2);
        assert_eq!(get.min, 100);
        assert_eq!(get.max, 200);

        let set = stats.latency(OpKind::Set);
        assert_eq!(set.count, 1);

        assert!(stats.percentile(0.5) >= 100);
        assert!(stats.percentile(0.99) >= stats.percentile(0.5));
    }

    #[test]
    fn test_percentile_empty() {
        let stats = Stats::new();
        assert_eq!(stats.percentile(0.5), 0);
    }

    #[test]
    fn test_pacer_quota_per_second() {
        let mut pacer = Pacer::new(2);

        assert!(pacer.ready(10));
        pacer.consume();
        assert!(pacer.ready(10));
        pacer.consume();
        assert!(!pacer.ready(10));

        // The next second resets the budget.
        assert!(pacer.ready(11));
    }

    #[test]
    fn test_pacer_unlimited() {
        let mut pacer = Pacer::new(0);
        for _ in 0..1000 {
            assert!(pacer.ready(5));
            pacer.consume();
        }
    }
}
