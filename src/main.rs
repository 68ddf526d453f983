use anyhow::Context;
use clap::Parser;
use pg_outbox::{worker, Config, Mode};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-outbox")]
#[command(about = "Transactional outbox over PostgreSQL logical replication", long_about = None)]
struct Args {
    #[arg(short, long, value_enum, default_value_t = Mode::Produce)]
    mode: Mode,

    /// Optional TOML, YAML or JSON file; PG_OUTBOX_* environment variables
    /// (e.g. PG_OUTBOX_POSTGRES__HOST) override it
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!(mode = %args.mode, "Starting pg-outbox");

    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;

    info!(
        postgres_host = %config.postgres.host,
        postgres_port = %config.postgres.port,
        postgres_database = %config.postgres.database,
        publication = %config.outbox.publication,
        slot = %config.outbox.slot_name,
        "Configuration summary"
    );

    let cancel = CancellationToken::new();
    install_shutdown_handler(cancel.clone()).context("failed to install signal handlers")?;

    if let Err(e) = worker::run(args.mode, &config, cancel).await {
        error!(error = %e, "Worker failed");
        return Err(e).with_context(|| format!("{} worker failed", args.mode));
    }

    info!("Shutdown complete");
    Ok(())
}

/// Cancels `cancel` on the first SIGTERM or SIGINT.
#[cfg(unix)]
fn install_shutdown_handler(cancel: CancellationToken) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
            _ = sigint.recv() => info!("Received SIGINT (Ctrl+C), initiating graceful shutdown"),
        }
        cancel.cancel();
    });
    Ok(())
}

#[cfg(not(unix))]
fn install_shutdown_handler(cancel: CancellationToken) -> std::io::Result<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
        }
        cancel.cancel();
    });
    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_outbox=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pg_outbox=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
