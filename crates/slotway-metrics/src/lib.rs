//! slotway-metrics: request telemetry for plugin deployments.
//!
//! Buffers per-request samples in memory, flushes them as immutable rollups
//! to the state store, and answers the range queries the rollout controller
//! uses to gate traffic shifts.
//!
//! # Architecture
//!
//! ```text
//! MetricsCollector
//!   ├── record_request()        ← called per proxied request, never blocks on I/O
//!   ├── record_resource_usage() → written straight to the rollup store
//!   ├── flush()                 → one MetricRollup per (deployment, slot) buffer
//!   ├── start() / stop()        → periodic flush loop, final flush on stop
//!   └── get_metrics() / get_time_series() / cleanup()
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics endpoint
//! ```

pub mod aggregate;
pub mod collector;
pub mod prometheus;

pub use aggregate::{AggregatedMetrics, TimeRange, TimeSeriesPoint};
pub use collector::{
    MAX_TIME_SERIES_BUCKETS, MetricSample, MetricsCollector, QueryError, ResourceSample,
    RollupStore,
};
pub use prometheus::render_prometheus;
