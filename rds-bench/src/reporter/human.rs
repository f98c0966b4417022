use std::{io::Write, time::Duration};

use rds_bench_lib::{runner::RunSummary, stats::WindowReport};

use super::{Reporter, flush_line};

pub struct HumanReporter<W> {
    out: W,
}

impl<W: Write + Send + 'static> HumanReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    #[cfg(test)]
    pub(super) fn into_inner(self) -> W {
        self.out
    }

    fn write_report(&mut self, title: &str, report: &WindowReport) -> std::io::Result<()> {
        flush_line(
            &mut self.out,
            format_args!(
                "{title} [{}..{}] attempted={} ({:.1}/s) ok={} fail={} skipped={} tx={}B rx={}B",
                humantime::format_duration(report.start),
                humantime::format_duration(report.end),
                report.attempted(),
                report.throughput(),
                report.succeeded(),
                report.failed(),
                report.skipped(),
                report.bytes_sent,
                report.bytes_received,
            ),
        )?;

        for action in &report.actions {
            let mut line = format!(
                "  {:<9} attempted={} ok={} fail={} miss={} skipped={}",
                action.action.as_str(),
                action.attempted,
                action.succeeded,
                action.failed,
                action.expected_misses,
                action.skipped,
            );
            for (kind, count) in action.failures {
                if count > 0 {
                    line.push_str(&format!(" {}={count}", kind.as_str()));
                }
            }
            if let Some(latency) = action.latency {
                line.push_str(&format!(
                    " min={} p50={} p90={} p99={} p999={} max={}",
                    micros(latency.min),
                    micros(latency.p50),
                    micros(latency.p90),
                    micros(latency.p99),
                    micros(latency.p999),
                    micros(latency.max),
                ));
            }
            flush_line(&mut self.out, format_args!("{line}"))?;
        }

        for (keyspace, existing) in report.existing.iter().enumerate() {
            if let Some(existing) = existing {
                flush_line(
                    &mut self.out,
                    format_args!("  keyspace {keyspace}: {existing} structures"),
                )?;
            }
        }

        Ok(())
    }
}

fn micros(latency: Duration) -> String {
    format!("{}us", latency.as_micros())
}

impl<W: Write + Send + 'static> Reporter for HumanReporter<W> {
    fn on_window(&mut self, report: &WindowReport) -> std::io::Result<()> {
        self.write_report(&format!("window {}", report.window), report)
    }

    fn finish(&mut self, summary: &RunSummary) -> std::io::Result<()> {
        let title = format!(
            "done windows={} completed={} elapsed={}",
            summary.windows,
            summary.completed,
            humantime::format_duration(summary.elapsed),
        );
        self.write_report(&title, &summary.total)
    }
}
