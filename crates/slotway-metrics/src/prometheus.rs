//! Prometheus text exposition format.
//!
//! Renders aggregated deployment metrics into the Prometheus text exposition
//! format for scraping by a Prometheus server or compatible agent.

use std::fmt::Write;

use crate::aggregate::AggregatedMetrics;

struct Family {
    name: &'static str,
    help: &'static str,
    value: fn(&AggregatedMetrics) -> Option<String>,
}

const FAMILIES: &[Family] = &[
    Family {
        name: "slotway_requests",
        help: "Requests observed in the reporting window.",
        value: |m| Some(m.request_count.to_string()),
    },
    Family {
        name: "slotway_errors",
        help: "Responses with status >= 400 in the reporting window.",
        value: |m| Some(m.error_count.to_string()),
    },
    Family {
        name: "slotway_error_rate",
        help: "Error rate (0.0-1.0).",
        value: |m| Some(format!("{:.4}", m.error_rate)),
    },
    Family {
        name: "slotway_latency_p50_ms",
        help: "P50 latency in milliseconds.",
        value: |m| Some(format!("{:.2}", m.latency_p50_ms)),
    },
    Family {
        name: "slotway_latency_p95_ms",
        help: "P95 latency in milliseconds.",
        value: |m| Some(format!("{:.2}", m.latency_p95_ms)),
    },
    Family {
        name: "slotway_latency_p99_ms",
        help: "P99 latency in milliseconds.",
        value: |m| Some(format!("{:.2}", m.latency_p99_ms)),
    },
    Family {
        name: "slotway_active_users",
        help: "Distinct users in the busiest rollup window.",
        value: |m| Some(m.active_users.to_string()),
    },
    Family {
        name: "slotway_active_sessions",
        help: "Distinct sessions in the busiest rollup window.",
        value: |m| Some(m.active_sessions.to_string()),
    },
    Family {
        name: "slotway_memory_bytes",
        help: "Most recent reported memory usage in bytes.",
        value: |m| m.memory_bytes.map(|b| b.to_string()),
    },
    Family {
        name: "slotway_cpu_percent",
        help: "Most recent reported CPU usage in percent.",
        value: |m| m.cpu_percent.map(|c| format!("{c:.2}")),
    },
];

/// Render aggregated metrics into Prometheus text format.
///
/// Every family is a GAUGE labelled with `deployment`, plus `slot` when the
/// metrics are slot-scoped. Resource gauges are omitted for entries that
/// carry no resource sample.
pub fn render_prometheus(metrics: &[AggregatedMetrics]) -> String {
    let mut out = String::new();

    for family in FAMILIES {
        let _ = writeln!(out, "# HELP {} {}", family.name, family.help);
        let _ = writeln!(out, "# TYPE {} gauge", family.name);
        for m in metrics {
            if let Some(value) = (family.value)(m) {
                let _ = writeln!(out, "{}{{{}}} {}", family.name, labels(m), value);
            }
        }
    }

    out
}

fn labels(m: &AggregatedMetrics) -> String {
    match &m.slot {
        Some(slot) => format!(
            "deployment=\"{}\",slot=\"{}\"",
            escape(&m.deployment_id),
            escape(slot)
        ),
        None => format!("deployment=\"{}\"", escape(&m.deployment_id)),
    }
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
