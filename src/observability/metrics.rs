// Grading metrics
//
// Counters, gauges, and histograms for:
// - Sandboxed run outcomes (normal, fault, timeout, illegal operation, out of memory)
// - Loader rewrites (gated call sites, instrumented loops, contexts created)
// - Abandoned and killed workers
// - Run and repetition latency

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::sandbox::ResultKind;

/// Counter metric (monotonically increasing)
#[derive(Debug)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Gauge metric (can go up or down)
#[derive(Debug)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

/// Histogram bucket for latency tracking
#[derive(Debug)]
pub struct HistogramBucket {
    pub le: f64, // upper bound in seconds
    pub count: AtomicU64,
}

/// Histogram metric for latency/duration tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<HistogramBucket>,
    sum: AtomicU64, // microseconds
    count: AtomicU64,
}

impl Histogram {
    /// Create histogram with standard latency buckets (in seconds)
    pub fn new_latency() -> Self {
        let bucket_bounds = vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ];

        let buckets = bucket_bounds
            .into_iter()
            .map(|le| HistogramBucket {
                le,
                count: AtomicU64::new(0),
            })
            .collect();

        Self {
            buckets,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: Duration) {
        let seconds = value.as_secs_f64();
        let micros = value.as_micros() as u64;

        self.sum.fetch_add(micros, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for bucket in &self.buckets {
            if seconds <= bucket.le {
                bucket.count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn get_sum_micros(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn get_bucket_count(&self, le: f64) -> u64 {
        self.buckets
            .iter()
            .find(|b| (b.le - le).abs() < 0.0001)
            .map(|b| b.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn export(&self, name: &str, help: &str, output: &mut String) {
        output.push_str(&format!("# HELP {} {}\n", name, help));
        output.push_str(&format!("# TYPE {} histogram\n", name));
        for bucket in &self.buckets {
            output.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                name,
                bucket.le,
                bucket.count.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!(
            "{}_sum {}\n",
            name,
            self.get_sum_micros() as f64 / 1_000_000.0
        ));
        output.push_str(&format!("{}_count {}\n", name, self.get_count()));
    }
}

/// Global metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    // Run outcome counters
    pub runs_total: Counter,
    pub runs_normal: Counter,
    pub runs_fault: Counter,
    pub runs_timeout: Counter,
    pub runs_illegal: Counter,
    pub runs_oom: Counter,

    // Loader counters
    pub contexts_created: Counter,
    pub call_sites_gated: Counter,
    pub loops_instrumented: Counter,

    // Worker counters
    pub workers_abandoned: Counter,
    pub workers_killed: Counter,
    pub active_runs: Gauge,

    // Harness counters
    pub repetitions_total: Counter,
    pub verdicts_incomplete: Counter,
    pub verdicts_non_deterministic: Counter,

    // Latency histograms
    pub run_duration: Histogram,
    pub test_duration: Histogram,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            runs_total: Counter::new(),
            runs_normal: Counter::new(),
            runs_fault: Counter::new(),
            runs_timeout: Counter::new(),
            runs_illegal: Counter::new(),
            runs_oom: Counter::new(),

            contexts_created: Counter::new(),
            call_sites_gated: Counter::new(),
            loops_instrumented: Counter::new(),

            workers_abandoned: Counter::new(),
            workers_killed: Counter::new(),
            active_runs: Gauge::new(),

            repetitions_total: Counter::new(),
            verdicts_incomplete: Counter::new(),
            verdicts_non_deterministic: Counter::new(),

            run_duration: Histogram::new_latency(),
            test_duration: Histogram::new_latency(),
        }
    }

    /// Record a classified sandboxed run
    pub fn record_run(&self, kind: ResultKind, elapsed: Duration) {
        self.runs_total.inc();
        self.run_duration.observe(elapsed);

        match kind {
            ResultKind::Normal => self.runs_normal.inc(),
            ResultKind::Fault => self.runs_fault.inc(),
            ResultKind::Timeout => self.runs_timeout.inc(),
            ResultKind::IllegalOperation => self.runs_illegal.inc(),
            ResultKind::OutOfMemory => self.runs_oom.inc(),
        }
    }

    /// Record a finished test operation
    pub fn record_verdict(&self, repetitions: u32, incomplete: bool, non_deterministic: bool, elapsed: Duration) {
        self.repetitions_total.add(u64::from(repetitions));
        self.test_duration.observe(elapsed);
        if incomplete {
            self.verdicts_incomplete.inc();
        }
        if non_deterministic {
            self.verdicts_non_deterministic.inc();
        }
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP gradebox_runs_total Total number of sandboxed runs\n");
        output.push_str("# TYPE gradebox_runs_total counter\n");
        output.push_str(&format!("gradebox_runs_total {}\n", self.runs_total.get()));

        output.push_str("# HELP gradebox_runs_by_result Sandboxed runs by result\n");
        output.push_str("# TYPE gradebox_runs_by_result counter\n");
        for (label, counter) in [
            ("normal", &self.runs_normal),
            ("fault", &self.runs_fault),
            ("timeout", &self.runs_timeout),
            ("illegal_operation", &self.runs_illegal),
            ("out_of_memory", &self.runs_oom),
        ] {
            output.push_str(&format!(
                "gradebox_runs_by_result{{result=\"{}\"}} {}\n",
                label,
                counter.get()
            ));
        }

        output.push_str("# HELP gradebox_loader_rewrites_total Loader rewrites by kind\n");
        output.push_str("# TYPE gradebox_loader_rewrites_total counter\n");
        output.push_str(&format!(
            "gradebox_loader_rewrites_total{{kind=\"call_site_gated\"}} {}\n",
            self.call_sites_gated.get()
        ));
        output.push_str(&format!(
            "gradebox_loader_rewrites_total{{kind=\"loop_instrumented\"}} {}\n",
            self.loops_instrumented.get()
        ));

        output.push_str("# HELP gradebox_contexts_created_total Isolation contexts created\n");
        output.push_str("# TYPE gradebox_contexts_created_total counter\n");
        output.push_str(&format!(
            "gradebox_contexts_created_total {}\n",
            self.contexts_created.get()
        ));

        output.push_str("# HELP gradebox_workers_total Workers stopped by the supervisor\n");
        output.push_str("# TYPE gradebox_workers_total counter\n");
        output.push_str(&format!(
            "gradebox_workers_total{{outcome=\"abandoned\"}} {}\n",
            self.workers_abandoned.get()
        ));
        output.push_str(&format!(
            "gradebox_workers_total{{outcome=\"killed\"}} {}\n",
            self.workers_killed.get()
        ));

        output.push_str("# HELP gradebox_active_runs Currently active sandboxed runs\n");
        output.push_str("# TYPE gradebox_active_runs gauge\n");
        output.push_str(&format!("gradebox_active_runs {}\n", self.active_runs.get()));

        output.push_str("# HELP gradebox_repetitions_total Repetitions executed\n");
        output.push_str("# TYPE gradebox_repetitions_total counter\n");
        output.push_str(&format!(
            "gradebox_repetitions_total {}\n",
            self.repetitions_total.get()
        ));

        self.run_duration.export(
            "gradebox_run_duration_seconds",
            "Wall-clock duration of sandboxed runs",
            &mut output,
        );
        self.test_duration.export(
            "gradebox_test_duration_seconds",
            "Wall-clock duration of all repetitions of a test",
            &mut output,
        );

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
static METRICS: once_cell::sync::Lazy<Arc<MetricsRegistry>> =
    once_cell::sync::Lazy::new(|| Arc::new(MetricsRegistry::new()));

/// Get global metrics registry
pub fn get_metrics() -> Arc<MetricsRegistry> {
    Arc::clone(&METRICS)
}
