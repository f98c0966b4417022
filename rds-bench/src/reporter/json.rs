use std::{io::Write, time::Duration};

use rds_bench_lib::{
    runner::RunSummary,
    stats::{ActionReport, WindowReport},
};

use super::{Reporter, flush_line};

pub struct JsonlReporter<W> {
    out: W,
}

impl<W: Write + Send + 'static> JsonlReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    #[cfg(test)]
    pub(super) fn into_inner(self) -> W {
        self.out
    }
}

fn micros(latency: Duration) -> u64 {
    u64::try_from(latency.as_micros()).unwrap_or(u64::MAX)
}

fn action_json(action: &ActionReport) -> serde_json::Value {
    let failures: serde_json::Map<String, serde_json::Value> = action
        .failures
        .iter()
        .map(|(kind, count)| (kind.as_str().to_owned(), (*count).into()))
        .collect();

    serde_json::json!({
        "action": action.action.as_str(),
        "attempted": action.attempted,
        "succeeded": action.succeeded,
        "failed": action.failed,
        "failures": failures,
        "expected_misses": action.expected_misses,
        "skipped": action.skipped,
        "latency_us": action.latency.map(|latency| serde_json::json!({
            "min": micros(latency.min),
            "p50": micros(latency.p50),
            "p90": micros(latency.p90),
            "p99": micros(latency.p99),
            "p999": micros(latency.p999),
            "max": micros(latency.max),
        })),
    })
}

fn report_json(kind: &str, report: &WindowReport) -> serde_json::Value {
    serde_json::json!({
        "type": kind,
        "window": report.window,
        "start_ms": report.start.as_millis(),
        "end_ms": report.end.as_millis(),
        "attempted": report.attempted(),
        "succeeded": report.succeeded(),
        "failed": report.failed(),
        "skipped": report.skipped(),
        "throughput": report.throughput(),
        "bytes_sent": report.bytes_sent,
        "bytes_received": report.bytes_received,
        "existing": report.existing,
        "actions": report.actions.iter().map(action_json).collect::<Vec<_>>(),
    })
}

impl<W: Write + Send + 'static> Reporter for JsonlReporter<W> {
    fn on_window(&mut self, report: &WindowReport) -> std::io::Result<()> {
        let line = report_json("window", report);
        flush_line(&mut self.out, format_args!("{line}"))
    }

    fn finish(&mut self, summary: &RunSummary) -> std::io::Result<()> {
        let mut line = report_json("final", &summary.total);
        if let Some(fields) = line.as_object_mut() {
            fields.insert("windows".to_owned(), summary.windows.into());
            fields.insert("completed".to_owned(), summary.completed.into());
            fields.insert(
                "elapsed_ms".to_owned(),
                serde_json::json!(summary.elapsed.as_millis()),
            );
        }
        flush_line(&mut self.out, format_args!("{line}"))
    }
}
