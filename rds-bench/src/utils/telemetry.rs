use std::{io::IsTerminal as _, path::Path};

use rama::{
    error::{BoxError, ErrorContext as _},
    telemetry::tracing,
};
use tracing_subscriber::{EnvFilter, filter::LevelFilter, fmt::writer::BoxMakeWriter};

use crate::Args;

/// Shape of the log lines written next to the reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Full,
    Pretty,
    /// one JSON object per event, matching `--json` reports
    Json,
}

impl LogFormat {
    fn for_args(args: &Args) -> Self {
        if args.json {
            Self::Json
        } else if args.pretty {
            Self::Pretty
        } else {
            Self::Full
        }
    }
}

/// Configures structured logging with runtime control via `RUST_LOG` environment variable.
///
/// Defaults to INFO level, DEBUG with `--verbose`. Logs go to stderr (or
/// `--output`) so stdout only carries reports.
pub fn init_tracing(args: &Args) -> Result<(), BoxError> {
    let level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let format = LogFormat::for_args(args);
    let ansi = format != LogFormat::Json
        && args.output.is_none()
        && std::io::stderr().is_terminal();

    let subscriber = tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(filter)
        .with_writer(log_writer(args.output.as_deref())?);

    match format {
        LogFormat::Full => subscriber.try_init()?,
        LogFormat::Pretty => subscriber.pretty().try_init()?,
        LogFormat::Json => subscriber.json().flatten_event(true).try_init()?,
    }

    tracing::debug!(?format, "tracing is set up");
    Ok(())
}

fn log_writer(output: Option<&Path>) -> Result<BoxMakeWriter, BoxError> {
    let Some(path) = output else {
        return Ok(BoxMakeWriter::new(std::io::stderr));
    };
    let file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .with_context(|| format!("open log file {}", path.display()))?;
    Ok(BoxMakeWriter::new(file))
}

#[cfg(test)]
mod tests {
    use clap::Parser as _;

    use super::*;

    fn format(flags: &[&str]) -> LogFormat {
        let args = Args::try_parse_from(
            ["rds-bench", "rds.toml"].iter().chain(flags).copied(),
        )
        .unwrap();
        LogFormat::for_args(&args)
    }

    #[test]
    fn test_log_format_follows_report_format() {
        assert_eq!(format(&[]), LogFormat::Full);
        assert_eq!(format(&["--pretty"]), LogFormat::Pretty);
        assert_eq!(format(&["--json"]), LogFormat::Json);
        assert_eq!(format(&["--json", "--pretty"]), LogFormat::Json);
    }

    #[test]
    fn test_log_file_is_created() {
        let path = std::env::temp_dir().join(format!("rds-bench-log-{}.log", std::process::id()));
        let _ = std::fs::remove_file(&path);
        log_writer(Some(&path)).unwrap();
        assert!(path.exists());
        std::fs::remove_file(&path).unwrap();
    }
}
