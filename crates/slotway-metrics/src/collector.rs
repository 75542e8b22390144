//! Metrics collector: buffers per-request samples and flushes them as rollups.
//!
//! Samples are appended to a sharded concurrent map keyed by
//! `(deployment, slot)`. Recording never touches persistence; a flush swaps
//! each buffer out under its shard lock, aggregates it and writes one rollup.
//! A buffer whose write fails is merged back so the next cycle retries it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use slotway_state::{MetricRollup, StateStore};

use crate::aggregate::{
    aggregate, bucketize, latency_summary, now_ms, AggregatedMetrics, TimeRange, TimeSeriesPoint,
};

/// Upper bound on the number of points a single time-series query may return.
pub const MAX_TIME_SERIES_BUCKETS: u64 = 10_000;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// A time-series query that cannot be answered as asked.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("bucket size must be at least one second")]
    ZeroBucket,

    #[error("time range ends before it starts")]
    InvertedRange,

    #[error("time series would have {buckets} buckets, limit is {limit}")]
    TooManyBuckets { buckets: u64, limit: u64 },
}

/// One observed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub deployment_id: String,
    #[serde(default)]
    pub slot: Option<String>,
    pub status_code: u16,
    pub latency_ms: f64,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Unix milliseconds. 0 means "now" and is filled in on record.
    #[serde(default)]
    pub timestamp: u64,
}

impl MetricSample {
    pub fn new(deployment_id: &str, slot: Option<&str>, status_code: u16, latency_ms: f64) -> Self {
        Self {
            deployment_id: deployment_id.to_string(),
            slot: slot.map(str::to_string),
            status_code,
            latency_ms,
            user_id: None,
            session_id: None,
            timestamp: 0,
        }
    }

    /// 4xx and 5xx responses count as errors.
    pub fn is_error(&self) -> bool {
        self.status_code >= 400
    }
}

/// A low-frequency resource usage snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub deployment_id: String,
    #[serde(default)]
    pub slot: Option<String>,
    #[serde(default)]
    pub memory_bytes: Option<u64>,
    #[serde(default)]
    pub cpu_percent: Option<f64>,
    #[serde(default)]
    pub timestamp: u64,
}

/// Persistence used by the collector.
///
/// Implemented by `StateStore`; tests substitute stores that fail on demand.
pub trait RollupStore: Send + Sync {
    fn put_rollup(&self, rollup: &MetricRollup) -> anyhow::Result<()>;
    fn list_rollups(
        &self,
        deployment_id: &str,
        from_ms: u64,
        to_ms: u64,
    ) -> anyhow::Result<Vec<MetricRollup>>;
    fn delete_rollups_before(&self, cutoff_ms: u64) -> anyhow::Result<usize>;
}

impl RollupStore for StateStore {
    fn put_rollup(&self, rollup: &MetricRollup) -> anyhow::Result<()> {
        Ok(StateStore::put_rollup(self, rollup)?)
    }

    fn list_rollups(
        &self,
        deployment_id: &str,
        from_ms: u64,
        to_ms: u64,
    ) -> anyhow::Result<Vec<MetricRollup>> {
        Ok(StateStore::list_rollups(self, deployment_id, from_ms, to_ms)?)
    }

    fn delete_rollups_before(&self, cutoff_ms: u64) -> anyhow::Result<usize> {
        Ok(StateStore::delete_rollups_before(self, cutoff_ms)?)
    }
}

type BufferKey = (String, Option<String>);

struct Runner {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Buffers request samples and periodically flushes them to the rollup store.
pub struct MetricsCollector {
    buffers: DashMap<BufferKey, Vec<MetricSample>>,
    store: Arc<dyn RollupStore>,
    interval: Duration,
    runner: Mutex<Option<Runner>>,
}

impl MetricsCollector {
    /// Create a collector persisting to the state store.
    pub fn new(state: StateStore, interval: Duration) -> Self {
        Self::with_store(Arc::new(state), interval)
    }

    pub fn with_store(store: Arc<dyn RollupStore>, interval: Duration) -> Self {
        Self {
            buffers: DashMap::new(),
            store,
            interval,
            runner: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Buffer one request sample.
    pub fn record_request(&self, mut sample: MetricSample) {
        if sample.timestamp == 0 {
            sample.timestamp = now_ms();
        }
        let key = (sample.deployment_id.clone(), sample.slot.clone());
        self.buffers.entry(key).or_default().push(sample);
    }

    /// Persist a resource snapshot as a request-less rollup.
    pub fn record_resource_usage(&self, sample: ResourceSample) -> anyhow::Result<MetricRollup> {
        let at = if sample.timestamp == 0 {
            now_ms()
        } else {
            sample.timestamp
        };
        let rollup = MetricRollup {
            deployment_id: sample.deployment_id,
            slot: sample.slot,
            window_start: at,
            window_end: at,
            request_count: 0,
            error_count: 0,
            latency_p50_ms: 0.0,
            latency_p95_ms: 0.0,
            latency_p99_ms: 0.0,
            latency_avg_ms: 0.0,
            active_users: 0,
            active_sessions: 0,
            memory_bytes: sample.memory_bytes,
            cpu_percent: sample.cpu_percent,
        };
        self.store
            .put_rollup(&rollup)
            .context("failed to persist resource sample")?;
        debug!(deployment = %rollup.deployment_id, "resource usage recorded");
        Ok(rollup)
    }

    /// Number of samples waiting for the next flush.
    pub fn buffered_samples(&self) -> usize {
        self.buffers.iter().map(|e| e.value().len()).sum()
    }

    /// Drain every buffer into one rollup each.
    ///
    /// Buffers that fail to persist are restored ahead of any samples that
    /// arrived meanwhile, and the call returns an error after all buffers
    /// were attempted.
    pub async fn flush(&self) -> anyhow::Result<Vec<MetricRollup>> {
        let keys: Vec<BufferKey> = self.buffers.iter().map(|e| e.key().clone()).collect();
        let now = now_ms();
        let mut batch = Vec::new();
        for key in keys {
            let Some((key, samples)) = self.buffers.remove(&key) else {
                continue;
            };
            if samples.is_empty() {
                continue;
            }
            let rollup = build_rollup(&key, &samples, now);
            batch.push((key, samples, rollup));
        }
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let store = Arc::clone(&self.store);
        let results = tokio::task::spawn_blocking(move || {
            batch
                .into_iter()
                .map(|(key, samples, rollup)| {
                    let result = store.put_rollup(&rollup);
                    (key, samples, rollup, result)
                })
                .collect::<Vec<_>>()
        })
        .await
        .context("rollup write task failed")?;

        let mut written = Vec::new();
        let mut failed = 0usize;
        let mut last_error = None;
        for (key, samples, rollup, result) in results {
            match result {
                Ok(()) => written.push(rollup),
                Err(e) => {
                    warn!(
                        deployment = %key.0,
                        slot = ?key.1,
                        samples = samples.len(),
                        error = %e,
                        "rollup write failed, samples kept for retry"
                    );
                    let mut entry = self.buffers.entry(key).or_default();
                    let newer = std::mem::replace(entry.value_mut(), samples);
                    entry.value_mut().extend(newer);
                    failed += 1;
                    last_error = Some(e);
                }
            }
        }

        debug!(rollups = written.len(), failed, "metrics flushed");
        if let Some(e) = last_error {
            return Err(e.context(format!("{failed} rollup write(s) failed")));
        }
        Ok(written)
    }

    /// Spawn the periodic flush loop. A second call while running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut runner = self.runner.lock().await;
        if runner.is_some() {
            return;
        }
        let (shutdown, rx) = watch::channel(false);
        let collector = Arc::clone(self);
        let handle = tokio::spawn(async move { collector.run(rx).await });
        *runner = Some(Runner { shutdown, handle });
    }

    /// Stop the flush loop, waiting for its final flush.
    pub async fn stop(&self) {
        let runner = self.runner.lock().await.take();
        if let Some(runner) = runner {
            let _ = runner.shutdown.send(true);
            if let Err(e) = runner.handle.await {
                error!(error = %e, "metrics flush loop panicked");
            }
        }
    }

    /// Run the flush loop until shutdown signal.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "metrics collector started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.flush().await {
                        warn!(error = %e, "metrics flush failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("metrics collector shutting down");
                    if let Err(e) = self.flush().await {
                        error!(error = %e, "final metrics flush failed");
                    }
                    break;
                }
            }
        }
    }

    /// Aggregate a deployment's rollups over `range`, across all slots.
    pub async fn get_metrics(
        &self,
        deployment_id: &str,
        range: TimeRange,
    ) -> anyhow::Result<AggregatedMetrics> {
        let rollups = self.store.list_rollups(deployment_id, range.from, range.to)?;
        Ok(aggregate(deployment_id, None, &rollups))
    }

    /// Aggregate one slot's rollups over `range`.
    pub async fn get_slot_metrics(
        &self,
        deployment_id: &str,
        slot: &str,
        range: TimeRange,
    ) -> anyhow::Result<AggregatedMetrics> {
        let rollups: Vec<MetricRollup> = self
            .store
            .list_rollups(deployment_id, range.from, range.to)?
            .into_iter()
            .filter(|r| r.slot.as_deref() == Some(slot))
            .collect();
        Ok(aggregate(deployment_id, Some(slot), &rollups))
    }

    /// Metrics for the trailing `minutes`.
    pub async fn get_recent_metrics(
        &self,
        deployment_id: &str,
        minutes: u64,
    ) -> anyhow::Result<AggregatedMetrics> {
        self.get_metrics(deployment_id, TimeRange::last_minutes(minutes))
            .await
    }

    pub async fn get_time_series(
        &self,
        deployment_id: &str,
        range: TimeRange,
        bucket_secs: u64,
    ) -> anyhow::Result<Vec<TimeSeriesPoint>> {
        if bucket_secs == 0 {
            return Err(QueryError::ZeroBucket.into());
        }
        if range.to < range.from {
            return Err(QueryError::InvertedRange.into());
        }
        let bucket_ms = bucket_secs.saturating_mul(1000);
        let buckets = (range.to - range.from) / bucket_ms + 1;
        if buckets > MAX_TIME_SERIES_BUCKETS {
            return Err(QueryError::TooManyBuckets {
                buckets,
                limit: MAX_TIME_SERIES_BUCKETS,
            }
            .into());
        }

        let rollups = self.store.list_rollups(deployment_id, range.from, range.to)?;
        Ok(bucketize(range, Duration::from_millis(bucket_ms), &rollups))
    }

    /// Delete rollups older than `retention_days`. Returns the count removed.
    pub async fn cleanup(&self, retention_days: u64) -> anyhow::Result<usize> {
        let cutoff = now_ms().saturating_sub(retention_days.saturating_mul(DAY_MS));
        let store = Arc::clone(&self.store);
        let removed = tokio::task::spawn_blocking(move || store.delete_rollups_before(cutoff))
            .await
            .context("rollup cleanup task failed")??;
        if removed > 0 {
            info!(removed, retention_days, "old metric rollups removed");
        }
        Ok(removed)
    }
}

fn build_rollup(key: &BufferKey, samples: &[MetricSample], now: u64) -> MetricRollup {
    let latencies: Vec<f64> = samples.iter().map(|s| s.latency_ms).collect();
    let summary = latency_summary(&latencies);

    let users: HashSet<&str> = samples.iter().filter_map(|s| s.user_id.as_deref()).collect();
    let sessions: HashSet<&str> = samples
        .iter()
        .filter_map(|s| s.session_id.as_deref())
        .collect();

    let window_start = samples.iter().map(|s| s.timestamp).min().unwrap_or(now);
    let window_end = samples.iter().map(|s| s.timestamp).max().unwrap_or(now).max(now);

    MetricRollup {
        deployment_id: key.0.clone(),
        slot: key.1.clone(),
        window_start,
        window_end,
        request_count: samples.len() as u64,
        error_count: samples.iter().filter(|s| s.is_error()).count() as u64,
        latency_p50_ms: summary.p50,
        latency_p95_ms: summary.p95,
        latency_p99_ms: summary.p99,
        latency_avg_ms: summary.avg,
        active_users: users.len() as u64,
        active_sessions: sessions.len() as u64,
        memory_bytes: None,
        cpu_percent: None,
    }
}
