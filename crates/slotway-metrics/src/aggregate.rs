//! Rollup aggregation: turns stored rollups back into query answers.
//!
//! Raw samples no longer exist once flushed, so queries work from the
//! rollups alone: counts add up, latency figures are the request-weighted
//! mean of the stored per-window values, and user/session counts take the
//! maximum of any single window (sessions overlap across windows, summing
//! would double count).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use slotway_state::MetricRollup;

/// Inclusive time range in unix milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: u64,
    pub to: u64,
}

impl TimeRange {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    /// The window of length `window` ending at `now`.
    pub fn trailing(window: Duration, now: u64) -> Self {
        let window_ms = window.as_millis() as u64;
        Self {
            from: now.saturating_sub(window_ms),
            to: now,
        }
    }

    /// The last `minutes` minutes up to the present.
    pub fn last_minutes(minutes: u64) -> Self {
        Self::trailing(Duration::from_secs(minutes.saturating_mul(60)), now_ms())
    }
}

/// Metrics of one deployment (optionally one slot) over a time range.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedMetrics {
    pub deployment_id: String,
    pub slot: Option<String>,
    /// Number of rollups that went into this answer.
    pub rollups: usize,
    pub request_count: u64,
    pub error_count: u64,
    /// error_count / request_count, 0 when there were no requests.
    pub error_rate: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub latency_avg_ms: f64,
    pub active_users: u64,
    pub active_sessions: u64,
    /// Most recent resource snapshot in range, if any.
    pub memory_bytes: Option<u64>,
    pub cpu_percent: Option<f64>,
}

/// One fixed-width bucket of a time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    /// Bucket start, unix milliseconds.
    pub timestamp: u64,
    pub request_count: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub latency_p50_ms: f64,
    pub latency_p99_ms: f64,
    pub latency_avg_ms: f64,
    pub active_users: u64,
}

/// Latency figures of one window, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencySummary {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub avg: f64,
}

/// Compute p50/p95/p99/avg of raw latency samples.
///
/// Percentiles use the nearest-rank index `len * q`, clamped to the last
/// sample. Empty input yields zeros.
pub fn latency_summary(latencies: &[f64]) -> LatencySummary {
    if latencies.is_empty() {
        return LatencySummary::default();
    }

    let mut sorted = latencies.to_vec();
    sorted.sort_unstable_by(f64::total_cmp);

    let at = |q: f64| {
        let idx = (sorted.len() as f64 * q) as usize;
        sorted[idx.min(sorted.len() - 1)]
    };
    let avg = sorted.iter().sum::<f64>() / sorted.len() as f64;

    LatencySummary {
        p50: at(0.50),
        p95: at(0.95),
        p99: at(0.99),
        avg,
    }
}

/// Re-aggregate stored rollups.
pub fn aggregate(
    deployment_id: &str,
    slot: Option<&str>,
    rollups: &[MetricRollup],
) -> AggregatedMetrics {
    let mut out = AggregatedMetrics {
        deployment_id: deployment_id.to_string(),
        slot: slot.map(str::to_string),
        rollups: rollups.len(),
        ..Default::default()
    };

    let mut weighted = LatencySummary::default();
    let mut latest_resource_at = 0u64;

    for r in rollups {
        out.request_count += r.request_count;
        out.error_count += r.error_count;
        out.active_users = out.active_users.max(r.active_users);
        out.active_sessions = out.active_sessions.max(r.active_sessions);

        let n = r.request_count as f64;
        weighted.p50 += r.latency_p50_ms * n;
        weighted.p95 += r.latency_p95_ms * n;
        weighted.p99 += r.latency_p99_ms * n;
        weighted.avg += r.latency_avg_ms * n;

        if (r.memory_bytes.is_some() || r.cpu_percent.is_some()) && r.window_end >= latest_resource_at
        {
            latest_resource_at = r.window_end;
            out.memory_bytes = r.memory_bytes.or(out.memory_bytes);
            out.cpu_percent = r.cpu_percent.or(out.cpu_percent);
        }
    }

    if out.request_count > 0 {
        let total = out.request_count as f64;
        out.error_rate = out.error_count as f64 / total;
        out.latency_p50_ms = weighted.p50 / total;
        out.latency_p95_ms = weighted.p95 / total;
        out.latency_p99_ms = weighted.p99 / total;
        out.latency_avg_ms = weighted.avg / total;
    }
    out
}

/// Sort rollups into fixed-width buckets covering the whole range.
///
/// Every bucket is present, empty ones carry zeros, so charts keep a
/// regular x-axis.
pub fn bucketize(range: TimeRange, bucket: Duration, rollups: &[MetricRollup]) -> Vec<TimeSeriesPoint> {
    let bucket_ms = (bucket.as_millis() as u64).max(1);
    if range.to < range.from {
        return Vec::new();
    }
    let count = ((range.to - range.from) / bucket_ms + 1) as usize;

    let mut grouped: Vec<Vec<MetricRollup>> = vec![Vec::new(); count];
    for r in rollups {
        if r.window_end < range.from || r.window_end > range.to {
            continue;
        }
        let idx = ((r.window_end - range.from) / bucket_ms) as usize;
        grouped[idx.min(count - 1)].push(r.clone());
    }

    grouped
        .iter()
        .enumerate()
        .map(|(i, group)| {
            let agg = aggregate("", None, group);
            TimeSeriesPoint {
                timestamp: range.from + i as u64 * bucket_ms,
                request_count: agg.request_count,
                error_count: agg.error_count,
                error_rate: agg.error_rate,
                latency_p50_ms: agg.latency_p50_ms,
                latency_p99_ms: agg.latency_p99_ms,
                latency_avg_ms: agg.latency_avg_ms,
                active_users: agg.active_users,
            }
        })
        .collect()
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rollup(window_end: u64, requests: u64, errors: u64, p99: f64) -> MetricRollup {
        MetricRollup {
            deployment_id: "cart".to_string(),
            slot: None,
            window_start: window_end.saturating_sub(1_000),
            window_end,
            request_count: requests,
            error_count: errors,
            latency_p50_ms: p99 / 4.0,
            latency_p95_ms: p99 / 2.0,
            latency_p99_ms: p99,
            latency_avg_ms: p99 / 3.0,
            active_users: requests / 10,
            active_sessions: requests / 5,
            memory_bytes: None,
            cpu_percent: None,
        }
    }

    #[test]
    fn percentiles_empty() {
        assert_eq!(latency_summary(&[]), LatencySummary::default());
    }

    #[test]
    fn percentiles_single_value() {
        let s = latency_summary(&[5.0]);
        assert_eq!(s.p50, 5.0);
        assert_eq!(s.p99, 5.0);
        assert_eq!(s.avg, 5.0);
    }

    #[test]
    fn percentiles_distribution() {
        // 100 samples: 1ms to 100ms.
        let latencies: Vec<f64> = (1..=100).map(f64::from).collect();
        let s = latency_summary(&latencies);

        assert!((49.0..=51.0).contains(&s.p50), "p50 was {}", s.p50);
        assert!((94.0..=96.0).contains(&s.p95), "p95 was {}", s.p95);
        assert!((98.0..=100.0).contains(&s.p99), "p99 was {}", s.p99);
        assert!((s.avg - 50.5).abs() < 1e-9);
    }

    #[test]
    fn aggregate_sums_counts_across_rollups() {
        let rollups = vec![rollup(1_000, 100, 5, 80.0), rollup(2_000, 150, 3, 120.0)];
        let agg = aggregate("cart", None, &rollups);

        assert_eq!(agg.request_count, 250);
        assert_eq!(agg.error_count, 8);
        assert!((agg.error_rate - 0.032).abs() < 1e-9);
        assert_eq!(agg.rollups, 2);
    }

    #[test]
    fn aggregate_weights_latency_by_requests() {
        let rollups = vec![rollup(1_000, 100, 0, 100.0), rollup(2_000, 300, 0, 200.0)];
        let agg = aggregate("cart", None, &rollups);
        assert!((agg.latency_p99_ms - 175.0).abs() < 1e-9);
    }

    #[test]
    fn aggregate_uses_max_for_users_and_sessions() {
        let rollups = vec![rollup(1_000, 100, 0, 10.0), rollup(2_000, 300, 0, 10.0)];
        let agg = aggregate("cart", None, &rollups);
        assert_eq!(agg.active_users, 30);
        assert_eq!(agg.active_sessions, 60);
    }

    #[test]
    fn aggregate_empty_has_zero_error_rate() {
        let agg = aggregate("cart", Some("green"), &[]);
        assert_eq!(agg.request_count, 0);
        assert_eq!(agg.error_rate, 0.0);
        assert_eq!(agg.slot.as_deref(), Some("green"));
    }

    #[test]
    fn aggregate_keeps_latest_resource_snapshot() {
        let mut older = rollup(1_000, 0, 0, 0.0);
        older.memory_bytes = Some(100);
        older.cpu_percent = Some(10.0);
        let mut newer = rollup(2_000, 0, 0, 0.0);
        newer.memory_bytes = Some(200);
        newer.cpu_percent = Some(20.0);

        let agg = aggregate("cart", None, &[older, newer]);
        assert_eq!(agg.memory_bytes, Some(200));
        assert_eq!(agg.cpu_percent, Some(20.0));
    }

    #[test]
    fn bucketize_covers_range_with_empty_buckets() {
        let rollups = vec![
            rollup(10_500, 10, 1, 50.0),
            rollup(10_900, 30, 0, 50.0),
            rollup(12_100, 5, 5, 50.0),
        ];
        let points = bucketize(
            TimeRange::new(10_000, 12_999),
            Duration::from_secs(1),
            &rollups,
        );

        assert_eq!(points.len(), 3);
        assert_eq!(points[0].timestamp, 10_000);
        assert_eq!(points[0].request_count, 40);
        assert_eq!(points[1].request_count, 0);
        assert_eq!(points[2].error_rate, 1.0);
    }

    #[test]
    fn trailing_range() {
        let r = TimeRange::trailing(Duration::from_secs(60), 100_000);
        assert_eq!(r, TimeRange::new(40_000, 100_000));
    }
}
