//! Gateway metrics: request/start/idle-stop counters and duration
//! histograms, rendered in the Prometheus text exposition format for the
//! `/_metrics` endpoint.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::LazyLock;
use std::time::Duration;

/// Default latency buckets (seconds) for proxied requests.
const REQUEST_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Buckets (seconds) sized for container wake-ups: docker start + probe.
const START_BUCKETS: &[f64] = &[0.5, 1.0, 2.5, 5.0, 10.0, 15.0, 30.0, 60.0, 120.0];

static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::new);

/// Process-wide metrics handle.
pub fn metrics() -> &'static Metrics {
    &METRICS
}

pub struct Metrics {
    inner: Mutex<State>,
}

#[derive(Default)]
struct State {
    // BTreeMaps keep the exposition output deterministic.
    requests_total: BTreeMap<(String, String), u64>,
    request_duration: BTreeMap<String, Histogram>,
    starts_total: BTreeMap<(String, String), u64>,
    start_duration: BTreeMap<String, Histogram>,
    idle_stops_total: BTreeMap<String, u64>,
}

struct Histogram {
    buckets: &'static [f64],
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn new(buckets: &'static [f64]) -> Self {
        Self {
            buckets,
            counts: vec![0; buckets.len()],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        for (i, le) in self.buckets.iter().enumerate() {
            if value <= *le {
                self.counts[i] += 1;
            }
        }
        self.sum += value;
        self.count += 1;
    }
}

impl Metrics {
    fn new() -> Self {
        Self {
            inner: Mutex::new(State::default()),
        }
    }

    /// Bumps the request counter and latency histogram for one handled
    /// request, labelled by container and final status code.
    pub fn record_request(&self, container: &str, status_code: u16, duration: Duration) {
        let mut state = self.inner.lock();
        *state
            .requests_total
            .entry((container.to_string(), status_code.to_string()))
            .or_insert(0) += 1;
        state
            .request_duration
            .entry(container.to_string())
            .or_insert_with(|| Histogram::new(REQUEST_BUCKETS))
            .observe(duration.as_secs_f64());
    }

    /// Bumps the start counter; the duration histogram is only fed on
    /// success so failed attempts don't skew wake latencies.
    pub fn record_start(&self, container: &str, success: bool, duration: Duration) {
        let mut state = self.inner.lock();
        let result = if success { "success" } else { "error" };
        *state
            .starts_total
            .entry((container.to_string(), result.to_string()))
            .or_insert(0) += 1;
        if success {
            state
                .start_duration
                .entry(container.to_string())
                .or_insert_with(|| Histogram::new(START_BUCKETS))
                .observe(duration.as_secs_f64());
        }
    }

    pub fn record_idle_stop(&self, container: &str) {
        let mut state = self.inner.lock();
        *state
            .idle_stops_total
            .entry(container.to_string())
            .or_insert(0) += 1;
    }

    /// Renders all metrics in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let state = self.inner.lock();
        let mut out = String::new();

        out.push_str(
            "# HELP wakegate_requests_total Total HTTP requests processed, including holding pages.\n",
        );
        out.push_str("# TYPE wakegate_requests_total counter\n");
        for ((container, code), count) in &state.requests_total {
            let _ = writeln!(
                out,
                "wakegate_requests_total{{container=\"{container}\",status_code=\"{code}\"}} {count}"
            );
        }

        out.push_str("# HELP wakegate_request_duration_seconds Duration of handled requests.\n");
        out.push_str("# TYPE wakegate_request_duration_seconds histogram\n");
        for (container, hist) in &state.request_duration {
            render_histogram(&mut out, "wakegate_request_duration_seconds", container, hist);
        }

        out.push_str("# HELP wakegate_starts_total Total container start attempts.\n");
        out.push_str("# TYPE wakegate_starts_total counter\n");
        for ((container, result), count) in &state.starts_total {
            let _ = writeln!(
                out,
                "wakegate_starts_total{{container=\"{container}\",result=\"{result}\"}} {count}"
            );
        }

        out.push_str(
            "# HELP wakegate_start_duration_seconds Time for a wake-up to complete successfully.\n",
        );
        out.push_str("# TYPE wakegate_start_duration_seconds histogram\n");
        for (container, hist) in &state.start_duration {
            render_histogram(&mut out, "wakegate_start_duration_seconds", container, hist);
        }

        out.push_str(
            "# HELP wakegate_idle_stops_total Containers stopped due to idle timeout.\n",
        );
        out.push_str("# TYPE wakegate_idle_stops_total counter\n");
        for (container, count) in &state.idle_stops_total {
            let _ = writeln!(out, "wakegate_idle_stops_total{{container=\"{container}\"}} {count}");
        }

        out
    }
}

fn render_histogram(out: &mut String, name: &str, container: &str, hist: &Histogram) {
    for (i, le) in hist.buckets.iter().enumerate() {
        let _ = writeln!(
            out,
            "{name}_bucket{{container=\"{container}\",le=\"{le}\"}} {}",
            hist.counts[i]
        );
    }
    let _ = writeln!(
        out,
        "{name}_bucket{{container=\"{container}\",le=\"+Inf\"}} {}",
        hist.count
    );
    let _ = writeln!(out, "{name}_sum{{container=\"{container}\"}} {}", hist.sum);
    let _ = writeln!(out, "{name}_count{{container=\"{container}\"}} {}", hist.count);
}
