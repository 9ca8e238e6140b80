use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use host_monitoring::{
    config::Config,
    monitors::collector::{ProcessCache, SysinfoProbe},
    service::MonitorService,
};
use tokio::sync::watch;
use tracing::{error, info, trace};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, fmt, fmt::MakeWriter, fmt::time::ChronoUtc, layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Debug, Clone, Parser)]
#[command(about = "Tails logs, samples host metrics and ships alerts to a collector")]
struct Args {
    /// Machine-wide config file (JSON or TOML)
    #[arg(long)]
    global: Option<PathBuf>,

    /// Local overrides, merged over the global file
    #[arg(long)]
    local: Option<PathBuf>,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Upload metric samples every cycle
    #[arg(long)]
    upload_metrics: bool,
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,host_monitoring=debug"))
}

fn json_layer<S, W>(writer: W) -> impl Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    fmt::layer()
        .json()
        .with_timer(ChronoUtc::rfc_3339())
        .with_ansi(false)
        .with_writer(writer)
}

fn init(log_dir: &Path) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(log_dir, "agent.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter())
        .with(json_layer(std::io::stderr))
        .with(json_layer(non_blocking))
        .try_init()
        .context("failed to initialize logging")?;

    Ok(guard)
}

/// Route panics through tracing so they land in the JSON logs.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|location| format!("{}:{}:{}", location.file(), location.line(), location.column()))
            .unwrap_or_default();
        let backtrace = std::backtrace::Backtrace::force_capture();
        error!(%location, %backtrace, "panic: {info}");
    }));
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    match Config::load_layered(args.global.as_deref(), args.local.as_deref()) {
        Ok(mut config) => {
            if args.upload_metrics {
                config.monitor.upload_metrics = true;
            }
            Ok(config)
        }
        Err(e) => {
            error!("cannot load configuration: {e:?}");
            Err(e).context("failed to load configuration")
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    install_panic_hook();

    // stderr only until the config names the log directory
    let config = {
        let _stderr = tracing_subscriber::registry()
            .with(filter())
            .with(json_layer(std::io::stderr))
            .set_default();
        load_config(&args)?
    };

    let _guard = init(&config.paths.logs)?;
    trace!("started with args: {args:?}");

    let probe = SysinfoProbe::new(
        ProcessCache::new(Duration::from_secs(config.monitor.process_cache_ttl_secs)),
        config.monitor.top_processes,
        config.monitor.process_cpu_floor,
    );

    let mut service = match MonitorService::new(config, Box::new(probe)) {
        Ok(service) => service,
        Err(e) => {
            error!("cannot start: {e:?}");
            return Err(e).context("failed to start monitor service");
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, stopping after the current cycle");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                error!("cannot listen for interrupts: {e}");
                // a dropped sender reads as shutdown
                std::future::pending::<()>().await;
            }
        }
    });

    service.run(args.once, shutdown_rx).await;
    Ok(())
}
