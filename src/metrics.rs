#![forbid(unsafe_code)]

// Orchestrator metrics - lock-free AtomicU64 counters and a Prometheus-compatible histogram.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Fixed histogram bucket boundaries (in microseconds for internal storage).
const BUCKET_BOUNDS_US: [u64; 8] = [
    10_000,     // 10ms
    50_000,     // 50ms
    100_000,    // 100ms
    250_000,    // 250ms
    500_000,    // 500ms
    1_000_000,  // 1s
    2_500_000,  // 2.5s
    10_000_000, // 10s
];

const BUCKET_LABELS: [&str; 8] = ["0.01", "0.05", "0.1", "0.25", "0.5", "1", "2.5", "10"];

/// Prometheus-compatible cumulative histogram with fixed buckets.
pub struct Histogram {
    /// Cumulative bucket counters: bucket[i] counts observations <= BUCKET_BOUNDS_US[i]
    buckets: [AtomicU64; 8],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    /// Record a duration observation.
    pub fn observe(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (i, &bound) in BUCKET_BOUNDS_US.iter().enumerate() {
            if us <= bound {
                self.buckets[i].fetch_add(1, Relaxed);
            }
        }
    }

    fn count(&self) -> u64 {
        self.count.load(Relaxed)
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (i, label) in BUCKET_LABELS.iter().enumerate() {
            let val = self.buckets[i].load(Relaxed);
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {val}");
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Orchestrator-wide metrics, cheap to clone and share between tasks.
#[derive(Clone)]
pub struct OrchestratorMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    joins_started_total: AtomicU64,
    joins_canceled_total: AtomicU64,
    joins_failed_total: AtomicU64,
    generations_total: AtomicU64,
    stage_refreshes_total: AtomicU64,
    rest_failures_total: AtomicU64,
    events_folded_total: AtomicU64,
    stale_events_dropped_total: AtomicU64,

    rest_latency: Histogram,
}

impl Default for OrchestratorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                joins_started_total: AtomicU64::new(0),
                joins_canceled_total: AtomicU64::new(0),
                joins_failed_total: AtomicU64::new(0),
                generations_total: AtomicU64::new(0),
                stage_refreshes_total: AtomicU64::new(0),
                rest_failures_total: AtomicU64::new(0),
                events_folded_total: AtomicU64::new(0),
                stale_events_dropped_total: AtomicU64::new(0),
                rest_latency: Histogram::new(),
            }),
        }
    }

    // --- Counter increments ---

    pub fn inc_joins_started(&self) {
        self.inner.joins_started_total.fetch_add(1, Relaxed);
    }

    pub fn inc_joins_canceled(&self) {
        self.inner.joins_canceled_total.fetch_add(1, Relaxed);
    }

    pub fn inc_joins_failed(&self) {
        self.inner.joins_failed_total.fetch_add(1, Relaxed);
    }

    pub fn inc_generations(&self) {
        self.inner.generations_total.fetch_add(1, Relaxed);
    }

    pub fn inc_stage_refreshes(&self) {
        self.inner.stage_refreshes_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rest_failures(&self) {
        self.inner.rest_failures_total.fetch_add(1, Relaxed);
    }

    pub fn inc_events_folded(&self) {
        self.inner.events_folded_total.fetch_add(1, Relaxed);
    }

    pub fn inc_stale_events_dropped(&self) {
        self.inner.stale_events_dropped_total.fetch_add(1, Relaxed);
    }

    pub fn observe_rest_call(&self, duration: Duration) {
        self.inner.rest_latency.observe(duration);
    }

    // --- Readers (used by tests and the poll binary) ---

    pub fn joins_started(&self) -> u64 {
        self.inner.joins_started_total.load(Relaxed)
    }

    pub fn joins_canceled(&self) -> u64 {
        self.inner.joins_canceled_total.load(Relaxed)
    }

    pub fn stale_events_dropped(&self) -> u64 {
        self.inner.stale_events_dropped_total.load(Relaxed)
    }

    pub fn rest_calls(&self) -> u64 {
        self.inner.rest_latency.count()
    }

    /// Render all metrics in Prometheus text exposition format.
    /// `stages_known` is passed in from the repository (on-demand gauge).
    pub fn render_prometheus(&self, stages_known: usize) -> String {
        let mut out = String::with_capacity(2048);
        let i = &self.inner;

        render_counter(&mut out, "stagehand_joins_started_total", "Total join attempts started", i.joins_started_total.load(Relaxed));
        render_counter(&mut out, "stagehand_joins_canceled_total", "Join attempts superseded before completing", i.joins_canceled_total.load(Relaxed));
        render_counter(&mut out, "stagehand_joins_failed_total", "Join attempts that returned a failure", i.joins_failed_total.load(Relaxed));
        render_counter(&mut out, "stagehand_generations_total", "Session generations created", i.generations_total.load(Relaxed));
        render_counter(&mut out, "stagehand_stage_refreshes_total", "Stage list snapshots merged", i.stage_refreshes_total.load(Relaxed));
        render_counter(&mut out, "stagehand_rest_failures_total", "REST calls converted to typed failures", i.rest_failures_total.load(Relaxed));
        render_counter(&mut out, "stagehand_events_folded_total", "Session events folded into the stage list", i.events_folded_total.load(Relaxed));
        render_counter(&mut out, "stagehand_stale_events_dropped_total", "Events dropped because their generation was superseded", i.stale_events_dropped_total.load(Relaxed));

        render_gauge(&mut out, "stagehand_stages_known", "Stages currently in the local list", stages_known as u64);

        i.rest_latency.render(
            "stagehand_rest_call_seconds",
            "REST call latency in seconds",
            &mut out,
        );

        out
    }
}

fn render_counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn render_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}
