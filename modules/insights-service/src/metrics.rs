//! Process metrics: counters, gauges, and request-latency histograms,
//! rendered in Prometheus text exposition format at GET /metrics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::circuit_breaker::CircuitState;

const LATENCY_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Default)]
struct Histogram {
    bucket_counts: [u64; LATENCY_BUCKETS.len()],
    sum: f64,
    count: u64,
}

impl Histogram {
    fn observe(&mut self, value: f64) {
        for (i, bound) in LATENCY_BUCKETS.iter().enumerate() {
            if value <= *bound {
                self.bucket_counts[i] += 1;
            }
        }
        self.sum += value;
        self.count += 1;
    }
}

pub struct Metrics {
    started_at: Instant,

    llm_success_total: AtomicU64,
    llm_error_total: AtomicU64,
    llm_tokens_total: AtomicU64,
    /// Accumulated in micro-dollars so it fits an atomic integer.
    llm_cost_micros_total: AtomicU64,

    backpressure_events_total: AtomicU64,
    insights_analyzed_total: AtomicU64,
    insights_cached_total: AtomicU64,
    insights_skipped_total: AtomicU64,
    /// Items the analyzer finished, whatever the outcome. Drives the
    /// queue drain estimate behind Retry-After.
    processed_total: AtomicU64,

    request_durations: Mutex<HashMap<(String, String), Histogram>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            llm_success_total: AtomicU64::new(0),
            llm_error_total: AtomicU64::new(0),
            llm_tokens_total: AtomicU64::new(0),
            llm_cost_micros_total: AtomicU64::new(0),
            backpressure_events_total: AtomicU64::new(0),
            insights_analyzed_total: AtomicU64::new(0),
            insights_cached_total: AtomicU64::new(0),
            insights_skipped_total: AtomicU64::new(0),
            processed_total: AtomicU64::new(0),
            request_durations: Mutex::new(HashMap::new()),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn record_llm_success(&self, tokens: i64, cost: f64) {
        self.llm_success_total.fetch_add(1, Ordering::Relaxed);
        if tokens > 0 {
            self.llm_tokens_total
                .fetch_add(tokens as u64, Ordering::Relaxed);
        }
        if cost > 0.0 {
            self.llm_cost_micros_total
                .fetch_add((cost * 1_000_000.0) as u64, Ordering::Relaxed);
        }
    }

    pub fn record_llm_error(&self) {
        self.llm_error_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backpressure(&self) {
        self.backpressure_events_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insight_analyzed(&self) {
        self.insights_analyzed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insight_cached(&self) {
        self.insights_cached_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insight_skipped(&self) {
        self.insights_skipped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.processed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request(&self, method: &str, path: &str, seconds: f64) {
        let mut map = self.request_durations.lock().unwrap();
        map.entry((method.to_string(), path.to_string()))
            .or_default()
            .observe(seconds);
    }

    pub fn llm_success_count(&self) -> u64 {
        self.llm_success_total.load(Ordering::Relaxed)
    }

    /// Analyzer throughput in items/sec since boot, floored so the drain
    /// estimate never divides by zero.
    pub fn observed_throughput(&self) -> f64 {
        let elapsed = self.started_at.elapsed().as_secs_f64().max(1.0);
        (self.processed_total.load(Ordering::Relaxed) as f64 / elapsed).max(0.1)
    }

    /// Render the Prometheus text exposition.
    pub fn render(&self, queue_depth: usize, circuit_state: CircuitState) -> String {
        let mut out = String::with_capacity(2048);

        out.push_str("# TYPE request_duration_seconds histogram\n");
        {
            let map = self.request_durations.lock().unwrap();
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            for key in keys {
                let (method, path) = key;
                let h = &map[key];
                for (i, bound) in LATENCY_BUCKETS.iter().enumerate() {
                    out.push_str(&format!(
                        "request_duration_seconds_bucket{{method=\"{}\",path=\"{}\",le=\"{}\"}} {}\n",
                        method, path, bound, h.bucket_counts[i]
                    ));
                }
                out.push_str(&format!(
                    "request_duration_seconds_bucket{{method=\"{}\",path=\"{}\",le=\"+Inf\"}} {}\n",
                    method, path, h.count
                ));
                out.push_str(&format!(
                    "request_duration_seconds_sum{{method=\"{}\",path=\"{}\"}} {}\n",
                    method, path, h.sum
                ));
                out.push_str(&format!(
                    "request_duration_seconds_count{{method=\"{}\",path=\"{}\"}} {}\n",
                    method, path, h.count
                ));
            }
        }

        out.push_str("# TYPE llm_requests_total counter\n");
        out.push_str(&format!(
            "llm_requests_total{{status=\"success\"}} {}\n",
            self.llm_success_total.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "llm_requests_total{{status=\"error\"}} {}\n",
            self.llm_error_total.load(Ordering::Relaxed)
        ));

        out.push_str("# TYPE llm_tokens_total counter\n");
        out.push_str(&format!(
            "llm_tokens_total {}\n",
            self.llm_tokens_total.load(Ordering::Relaxed)
        ));
        out.push_str("# TYPE llm_cost_estimate_total counter\n");
        out.push_str(&format!(
            "llm_cost_estimate_total {}\n",
            self.llm_cost_micros_total.load(Ordering::Relaxed) as f64 / 1_000_000.0
        ));

        out.push_str("# TYPE queue_depth gauge\n");
        out.push_str(&format!("queue_depth {}\n", queue_depth));

        out.push_str("# TYPE backpressure_events_total counter\n");
        out.push_str(&format!(
            "backpressure_events_total {}\n",
            self.backpressure_events_total.load(Ordering::Relaxed)
        ));

        out.push_str("# TYPE circuit_state gauge\n");
        for state in ["closed", "open", "half_open"] {
            let value = if circuit_state.as_str() == state { 1 } else { 0 };
            out.push_str(&format!("circuit_state{{state=\"{}\"}} {}\n", state, value));
        }

        out.push_str("# TYPE insights_written_total counter\n");
        out.push_str(&format!(
            "insights_written_total{{kind=\"analyzed\"}} {}\n",
            self.insights_analyzed_total.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "insights_written_total{{kind=\"cached\"}} {}\n",
            self.insights_cached_total.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "insights_written_total{{kind=\"skipped\"}} {}\n",
            self.insights_skipped_total.load(Ordering::Relaxed)
        ));

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_are_cumulative() {
        let mut h = Histogram::default();
        h.observe(0.003);
        h.observe(0.04);
        h.observe(7.0);
        // 0.005 bucket holds only the first observation.
        assert_eq!(h.bucket_counts[0], 1);
        // 0.05 bucket holds the first two.
        assert_eq!(h.bucket_counts[3], 2);
        // 10.0 bucket holds all three.
        assert_eq!(h.bucket_counts[10], 3);
        assert_eq!(h.count, 3);
    }

    #[test]
    fn render_includes_all_families() {
        let m = Metrics::new();
        m.record_request("POST", "/api/v1/conversations", 0.02);
        m.record_llm_success(150, 0.0025);
        m.record_llm_error();
        m.record_backpressure();
        m.record_insight_analyzed();

        let text = m.render(3, CircuitState::Open);
        assert!(text.contains("request_duration_seconds_bucket{method=\"POST\",path=\"/api/v1/conversations\",le=\"0.025\"} 1"));
        assert!(text.contains("llm_requests_total{status=\"success\"} 1"));
        assert!(text.contains("llm_requests_total{status=\"error\"} 1"));
        assert!(text.contains("queue_depth 3"));
        assert!(text.contains("backpressure_events_total 1"));
        assert!(text.contains("circuit_state{state=\"open\"} 1"));
        assert!(text.contains("circuit_state{state=\"closed\"} 0"));
        assert!(text.contains("llm_tokens_total 150"));
        assert!(text.contains("insights_written_total{kind=\"analyzed\"} 1"));
    }

    #[test]
    fn throughput_is_floored() {
        let m = Metrics::new();
        assert!(m.observed_throughput() >= 0.1);
    }
}
