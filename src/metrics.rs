//! Aggregate pipeline counters for the `/metrics` scrape endpoint.
//!
//! Broker events already carry per-request latencies; this module keeps the
//! cheap cross-request aggregates (invocation counts, failure counters,
//! latency accumulators) that Prometheus wants as plain text.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Mutex;

#[derive(Debug, Default, Clone)]
struct StageStats {
    invocations: u64,
    failures: u64,
    total_latency_seconds: f64,
    last_latency_seconds: f64,
}

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    stages: Mutex<BTreeMap<String, StageStats>>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observed collaborator call latency.
    pub fn observe_latency(&self, stage: &str, seconds: f64) {
        let mut stages = self.stages.lock().expect("metrics lock poisoned");
        let stats = stages.entry(stage.to_string()).or_default();
        stats.invocations += 1;
        stats.total_latency_seconds += seconds;
        stats.last_latency_seconds = seconds;
    }

    /// Record one hard collaborator failure.
    pub fn record_failure(&self, stage: &str) {
        let mut stages = self.stages.lock().expect("metrics lock poisoned");
        stages.entry(stage.to_string()).or_default().failures += 1;
    }

    #[cfg(test)]
    pub fn failure_count(&self, stage: &str) -> u64 {
        self.stages
            .lock()
            .expect("metrics lock poisoned")
            .get(stage)
            .map(|stats| stats.failures)
            .unwrap_or(0)
    }

    /// Render the Prometheus text exposition format (version 0.0.4).
    pub fn render_prometheus(&self) -> String {
        let stages = self.stages.lock().expect("metrics lock poisoned").clone();
        let mut out = String::new();

        out.push_str("# TYPE pipeline_invocations_total counter\n");
        for (stage, stats) in &stages {
            let _ = writeln!(
                out,
                "pipeline_invocations_total{{stage=\"{stage}\"}} {}",
                stats.invocations
            );
        }
        out.push_str("# TYPE pipeline_failures_total counter\n");
        for (stage, stats) in &stages {
            let _ = writeln!(
                out,
                "pipeline_failures_total{{stage=\"{stage}\"}} {}",
                stats.failures
            );
        }
        out.push_str("# TYPE pipeline_latency_seconds_sum counter\n");
        for (stage, stats) in &stages {
            let _ = writeln!(
                out,
                "pipeline_latency_seconds_sum{{stage=\"{stage}\"}} {:.6}",
                stats.total_latency_seconds
            );
        }
        out.push_str("# TYPE pipeline_last_latency_seconds gauge\n");
        for (stage, stats) in &stages {
            let _ = writeln!(
                out,
                "pipeline_last_latency_seconds{{stage=\"{stage}\"}} {:.6}",
                stats.last_latency_seconds
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_all_series_for_a_stage() {
        let metrics = PipelineMetrics::new();
        metrics.observe_latency("policy", 0.25);
        metrics.observe_latency("policy", 0.75);
        metrics.record_failure("tts");

        let text = metrics.render_prometheus();
        assert!(text.contains("pipeline_invocations_total{stage=\"policy\"} 2"));
        assert!(text.contains("pipeline_latency_seconds_sum{stage=\"policy\"} 1.000000"));
        assert!(text.contains("pipeline_last_latency_seconds{stage=\"policy\"} 0.750000"));
        assert!(text.contains("pipeline_failures_total{stage=\"tts\"} 1"));
    }

    #[test]
    fn empty_registry_renders_only_headers() {
        let text = PipelineMetrics::new().render_prometheus();
        assert!(text.contains("# TYPE pipeline_invocations_total counter"));
        assert!(!text.contains("stage="));
    }
}
