//! Prometheus metrics exporter.
//!
//! Exports metrics in Prometheus text format.

use std::fmt::Write;
use std::sync::Arc;

use super::collector::MetricsCollector;

/// Prometheus metrics exporter.
pub struct PrometheusExporter {
    collector: Arc<MetricsCollector>,
    namespace: String,
}

impl PrometheusExporter {
    /// Create a new Prometheus exporter.
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        Self::with_namespace(collector, "quake_scheduler")
    }

    /// Create a new Prometheus exporter with custom namespace.
    pub fn with_namespace(collector: Arc<MetricsCollector>, namespace: impl Into<String>) -> Self {
        Self {
            collector,
            namespace: namespace.into(),
        }
    }

    /// Export metrics in Prometheus text format.
    pub fn export(&self) -> String {
        let snapshot = self.collector.snapshot();
        let mut output = String::new();

        // Attempt metrics
        self.write_counter(
            &mut output,
            "attempts_total",
            "Total task invocation attempts",
            snapshot.attempts_total as f64,
        );

        let mut failures: Vec<_> = snapshot.attempt_failures.iter().collect();
        failures.sort();
        self.write_family(
            &mut output,
            "attempt_failures_total",
            "Failed attempts by error kind",
            "counter",
            "kind",
            failures
                .into_iter()
                .map(|(kind, count)| (kind.as_str(), *count as f64)),
        );

        // Execution metrics
        self.write_counter(
            &mut output,
            "executions_total",
            "Total finalized executions",
            snapshot.executions_total as f64,
        );
        self.write_counter(
            &mut output,
            "execution_failures_total",
            "Executions that ended in failure",
            snapshot.executions_failed as f64,
        );
        self.write_counter(
            &mut output,
            "executions_cancelled_total",
            "Executions interrupted by shutdown",
            snapshot.executions_cancelled as f64,
        );
        self.write_gauge(
            &mut output,
            "execution_duration_avg_ms",
            "Average execution duration in milliseconds",
            snapshot.execution_duration_avg_ms,
        );
        self.write_counter(
            &mut output,
            "items_produced_total",
            "Items reported by successful executions",
            snapshot.items_produced_total as f64,
        );
        self.write_counter(
            &mut output,
            "skipped_ticks_total",
            "Ticks skipped after an empty execution",
            snapshot.skipped_ticks as f64,
        );

        // Guard metrics
        self.write_counter(
            &mut output,
            "circuit_rejections_total",
            "Attempts rejected by an open circuit breaker",
            snapshot.circuit_rejections as f64,
        );
        self.write_counter(
            &mut output,
            "rate_limit_waits_total",
            "Attempts that waited for a rate limiter permit",
            snapshot.rate_limit_waits as f64,
        );
        self.write_counter(
            &mut output,
            "rate_limit_wait_seconds_total",
            "Time spent waiting for rate limiter permits",
            snapshot.rate_limit_wait_total_ms as f64 / 1000.0,
        );

        // Process metrics
        self.write_gauge(
            &mut output,
            "process_memory_bytes",
            "Resident memory of the scheduler process",
            snapshot.process_memory_bytes as f64,
        );
        self.write_gauge(
            &mut output,
            "process_cpu_percent",
            "CPU usage of the scheduler process",
            snapshot.process_cpu_percent,
        );

        output
    }

    fn write_header(&self, output: &mut String, full_name: &str, help: &str, kind: &str) {
        let _ = writeln!(output, "# HELP {} {}", full_name, help);
        let _ = writeln!(output, "# TYPE {} {}", full_name, kind);
    }

    fn write_gauge(&self, output: &mut String, name: &str, help: &str, value: f64) {
        let full_name = format!("{}_{}", self.namespace, name);
        self.write_header(output, &full_name, help, "gauge");
        let _ = writeln!(output, "{} {}", full_name, value);
    }

    fn write_counter(&self, output: &mut String, name: &str, help: &str, value: f64) {
        let full_name = format!("{}_{}", self.namespace, name);
        self.write_header(output, &full_name, help, "counter");
        let _ = writeln!(output, "{} {}", full_name, value);
    }

    /// One header followed by a sample per label value. Nothing is written
    /// for an empty family.
    fn write_family<'a>(
        &self,
        output: &mut String,
        name: &str,
        help: &str,
        kind: &str,
        label: &str,
        samples: impl Iterator<Item = (&'a str, f64)>,
    ) {
        let full_name = format!("{}_{}", self.namespace, name);
        let mut header_written = false;

        for (label_value, value) in samples {
            if !header_written {
                self.write_header(output, &full_name, help, kind);
                header_written = true;
            }
            let _ = writeln!(
                output,
                "{}{{{}=\"{}\"}} {}",
                full_name,
                label,
                escape_label(label_value),
                value
            );
        }
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
