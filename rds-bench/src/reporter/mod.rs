//! Presentation of window reports.

use std::io::Write;

use rds_bench_lib::{runner::RunSummary, stats::WindowReport};

mod human;
mod json;

pub use self::{human::HumanReporter, json::JsonlReporter};


pub trait Reporter: Send + 'static {
    fn on_window(&mut self, report: &WindowReport) -> std::io::Result<()>;
    fn finish(&mut self, summary: &RunSummary) -> std::io::Result<()>;
}

/// Reporter writing to stdout in the requested format.
pub fn stdout_reporter(json: bool) -> Box<dyn Reporter> {
    let out = std::io::stdout();
    if json {
        Box::new(JsonlReporter::new(out))
    } else {
        Box::new(HumanReporter::new(out))
    }
}

fn flush_line<W: Write>(out: &mut W, line: std::fmt::Arguments<'_>) -> std::io::Result<()> {
    out.write_fmt(line)?;
    out.write_all(b"\n")?;
    out.flush()
}
