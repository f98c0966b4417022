use std::{path::PathBuf, time::Duration};

use rama::{
    error::{BoxError, ErrorContext as _, OpaqueError},
    graceful::{self, ShutdownGuard},
    telemetry::tracing,
};

use clap::Parser;
use rds_bench_lib::{
    codec,
    config::Config,
    pool::TcpConnector,
    runner::Runner,
    stats::WindowReport,
};
use tokio::sync::mpsc;

#[cfg(target_family = "unix")]
use rds_bench_lib::utils::os;

use self::reporter::Reporter;

pub mod reporter;
pub mod utils;

#[cfg(target_family = "unix")]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[cfg(target_os = "windows")]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Load generator for rich data structure servers.
#[derive(Debug, Clone, Parser)]
#[command(name = "rds-bench")]
#[command(bin_name = "rds-bench")]
#[command(version, about, long_about = None)]
pub struct Args {
    /// workload configuration (TOML)
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// endpoint (host:port) to load, in addition to the configured ones
    #[arg(long = "endpoint", short = 'e', value_name = "HOST:PORT")]
    pub endpoints: Vec<String>,

    /// report (and log) json lines instead of a human-friendly format
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// debug logging as default instead of Info; use RUST_LOG env for more options
    #[arg(long, short = 'v', default_value_t = false)]
    pub verbose: bool,

    /// enable pretty logging (format for humans)
    #[arg(long, default_value_t = false)]
    pub pretty: bool,

    /// write the tracing output to the provided (log) file instead of stderr
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,

    #[arg(long, value_name = "SECONDS", default_value_t = 0.)]
    /// the graceful shutdown timeout (<= 0.0 = no timeout)
    pub graceful: f64,

    #[cfg(target_family = "unix")]
    /// Set the limit of max open file descriptors for this process and its children.
    #[arg(long, value_name = "N", default_value_t = 262_144)]
    pub ulimit: os::rlim_t,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();

    self::utils::telemetry::init_tracing(&args)?;

    let base_shutdown_signal = graceful::default_signal();
    if let Err(err) = run_with_args(base_shutdown_signal, args).await {
        eprintln!("🚩 exit with error: {err}");
        std::process::exit(1);
    }

    Ok(())
}

/// run the benchmark described by the given args
async fn run_with_args<F>(base_shutdown_signal: F, args: Args) -> Result<(), BoxError>
where
    F: Future<Output: Send + 'static> + Send + 'static,
{
    let graceful_timeout = (args.graceful > 0.).then(|| Duration::from_secs_f64(args.graceful));

    let (error_tx, error_rx) = tokio::sync::oneshot::channel::<OpaqueError>();
    let graceful = graceful::Shutdown::new(new_shutdown_signal(error_rx, base_shutdown_signal));

    let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
    graceful.spawn_task_fn(async move |guard| match exec(guard, args).await {
        Ok(()) => {
            let _ = done_tx.send(());
        }
        Err(err) => {
            let _ = error_tx.send(err);
        }
    });

    let delay = match graceful_timeout {
        Some(duration) => graceful.shutdown_with_limit(duration).await?,
        None => graceful.shutdown().await,
    };
    tracing::debug!("gracefully shutdown with a delay of: {delay:?}");

    done_rx
        .await
        .map_err(|_| OpaqueError::from_display("benchmark run failed"))?;
    Ok(())
}

async fn exec(guard: ShutdownGuard, args: Args) -> Result<(), OpaqueError> {
    let config = Config::load(&args.config)
        .with_context(|| format!("load config from {}", args.config.display()))?
        .with_endpoints(args.endpoints)
        .context("add endpoints from command line")?;

    #[cfg(target_family = "unix")]
    {
        let limit = os::raise_nofile(args.ulimit).context("set file descriptor limit")?;
        let required = os::required_nofile(&config);
        if (limit as u64) < required {
            tracing::warn!(
                limit,
                required,
                "open files limit is below the number of pooled connections",
            );
        }
    }

    let codec = codec::for_protocol(config.general().protocol);
    let connector = TcpConnector::new(config.general().tcp_nodelay);
    let runner = Runner::try_new(config, codec, connector).context("prepare run")?;

    let (report_tx, report_rx) = mpsc::channel(4);
    let report_task = tokio::spawn(report_worker(
        reporter::stdout_reporter(args.json),
        report_rx,
    ));

    let summary = runner
        .run(report_tx, guard.clone_weak().into_cancelled())
        .await
        .context("run workload")?;

    let mut reporter = report_task
        .await
        .context("join report worker")?
        .context("write window report")?;
    reporter.finish(&summary).context("write run summary")?;

    Ok(())
}

async fn report_worker(
    mut reporter: Box<dyn Reporter>,
    mut report_rx: mpsc::Receiver<WindowReport>,
) -> std::io::Result<Box<dyn Reporter>> {
    while let Some(report) = report_rx.recv().await {
        reporter.on_window(&report)?;
    }
    tracing::debug!("exit report worker: run finished");
    Ok(reporter)
}

fn new_shutdown_signal(
    error_rx: tokio::sync::oneshot::Receiver<OpaqueError>,
    base_shutdown_signal: impl Future<Output: Send + 'static> + Send + 'static,
) -> impl Future + Send + 'static {
    async move {
        tokio::select! {
            _ = base_shutdown_signal => {
                tracing::debug!("default signal triggered: init graceful shutdown");
            }
            result = error_rx => {
                match result {
                    Ok(err) => {
                        tracing::error!("fatal err received: {err}; abort");
                    },
                    Err(_) => {
                        tracing::debug!("benchmark is finished without error, return control");
                    },
                }
            }
        }
    }
}
