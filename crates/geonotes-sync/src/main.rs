//! GeoNotes sync - note ingestion, sync daemon and region verification

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use geonotes_common::logging::{init_logging, LogConfig, LogGuard, LogLevel};
use geonotes_sync::config::SyncConfig;
use geonotes_sync::controller::{
    run_once, Collaborators, ConfigLoader, ControllerFactory, Daemon, ReloadHandle, SyncController,
};
use geonotes_sync::convert::CsvNoteConverter;
use geonotes_sync::error::ExitStatus;
use geonotes_sync::retry::{RetryExecutor, RetryPolicy};
use geonotes_sync::scheduler::{CapacityProbe, HttpCapacityProbe, TicketQueue, UnlimitedCapacity, BOUNDARY_QUEUE};
use geonotes_sync::source::{HttpBoundarySource, HttpBulkSource, HttpNoteFeed};
use geonotes_sync::store::{process_holder_id, PgStore, ProgressStore, Store};
use geonotes_sync::verify::{BoundaryRefresher, VerificationEngine, VerificationPass};
use geonotes_sync::SyncError;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "geonotes-sync")]
#[command(author, version, about = "Geographic note sync engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Configuration file (defaults to ./geonotes.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run exactly one sync cycle and exit
    Once,

    /// Run sync cycles until stopped
    Daemon,

    /// Run a region verification pass
    Verify {
        /// Which pass to run
        #[arg(long, default_value = "verify")]
        pass: VerificationPass,

        /// Start a new full pass instead of resuming
        #[arg(long)]
        reset: bool,
    },

    /// Fetch region boundaries and store them
    RefreshBoundaries,

    /// Print the persisted sync status as JSON
    Status,

    /// Apply database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match init_tracing(cli.verbose) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e:#}");
            return ExitStatus::FatalConfiguration.into();
        },
    };

    match run(cli).await {
        Ok(status) => status.into(),
        Err(e) => {
            let status = e
                .downcast_ref::<SyncError>()
                .map(ExitStatus::for_error)
                .unwrap_or(ExitStatus::FatalConfiguration);
            error!(error = %format!("{e:#}"), exit_code = status.code(), "Command failed");
            status.into()
        },
    }
}

fn init_tracing(verbose: bool) -> Result<LogGuard> {
    let level = if verbose { LogLevel::Debug } else { LogLevel::Info };
    let config = LogConfig::builder()
        .level(level)
        .log_file_prefix("geonotes-sync")
        .build()
        .with_env_overrides()?;
    Ok(init_logging(&config)?)
}

async fn run(cli: Cli) -> Result<ExitStatus> {
    let config_path = cli.config.clone();
    let config = SyncConfig::load(config_path.as_deref()).context("Failed to load configuration")?;

    let pg = PgStore::connect(&config.database)
        .await
        .context("Failed to connect to database")?;
    if let Command::Migrate = cli.command {
        pg.migrate().await?;
        info!("Migrations applied");
        return Ok(ExitStatus::Success);
    }
    let store: Arc<dyn Store> = Arc::new(pg);
    let holder = process_holder_id();
    let cancel = CancellationToken::new();

    match cli.command {
        Command::Once => {
            tokio::spawn(shutdown_signal(cancel.clone(), None));
            let controller = build_controller(&config, store.clone(), &holder, cancel)?;
            Ok(run_once(&controller, store.as_ref(), &holder).await)
        },
        Command::Daemon => {
            let loader: ConfigLoader = Box::new(move || SyncConfig::load(config_path.as_deref()));
            let factory_store = store.clone();
            let factory_holder = holder.clone();
            let factory: ControllerFactory = Box::new(move |config: &SyncConfig, cancel: CancellationToken| {
                build_controller(config, factory_store.clone(), &factory_holder, cancel)
            });

            let daemon = Daemon::new(config, loader, factory, store, holder, cancel.clone());
            tokio::spawn(shutdown_signal(cancel, Some(daemon.reload_handle())));
            match daemon.run().await {
                Ok(()) => Ok(ExitStatus::Success),
                Err(e) => Ok(ExitStatus::for_error(&e)),
            }
        },
        Command::Verify { pass, reset } => {
            tokio::spawn(shutdown_signal(cancel.clone(), None));
            let retry = RetryExecutor::new(RetryPolicy::from_config(&config.retry), cancel.clone());
            let engine = VerificationEngine::new(store, retry, &config.verify, cancel)?;
            let report = engine.run(pass, reset).await?;
            Ok(match report.failed_chunks.first() {
                Some(failure) => ExitStatus::for_class(failure.class),
                None if report.interrupted => ExitStatus::TransientFailure,
                None => ExitStatus::Success,
            })
        },
        Command::RefreshBoundaries => {
            tokio::spawn(shutdown_signal(cancel.clone(), None));
            let capacity: Arc<dyn CapacityProbe> = match &config.scheduler.capacity_url {
                Some(url) => Arc::new(HttpCapacityProbe::new(url, config.feed.request_timeout())?),
                None => Arc::new(UnlimitedCapacity),
            };
            let queue = TicketQueue::new(BOUNDARY_QUEUE, store.clone(), capacity, &config.scheduler, &holder, cancel.clone());
            let retry = RetryExecutor::new(RetryPolicy::from_config(&config.retry), cancel);
            let source = Arc::new(HttpBoundarySource::new(&config.verify, config.feed.request_timeout())?);
            BoundaryRefresher::new(source, queue, retry, store).refresh().await?;
            Ok(ExitStatus::Success)
        },
        Command::Status => {
            match store.read_status(&config.sync.instance_name).await? {
                Some(status) => println!("{}", serde_json::to_string_pretty(&status)?),
                None => warn!(instance = %config.sync.instance_name, "No status recorded yet"),
            }
            Ok(ExitStatus::Success)
        },
        Command::Migrate => Ok(ExitStatus::Success),
    }
}

fn build_controller(
    config: &SyncConfig,
    store: Arc<dyn Store>,
    holder: &str,
    cancel: CancellationToken,
) -> geonotes_sync::Result<SyncController> {
    let collaborators = Collaborators {
        store,
        feed: Arc::new(HttpNoteFeed::new(&config.feed)?),
        bulk: Arc::new(HttpBulkSource::new(&config.bulk, config.bulk.download_timeout())?),
        feed_capacity: Arc::new(UnlimitedCapacity),
        dump_capacity: Arc::new(UnlimitedCapacity),
        converter: Arc::new(CsvNoteConverter::new()),
    };
    Ok(SyncController::new(collaborators, config, holder, cancel))
}

/// Cancel on SIGINT/SIGTERM; request a reload on SIGHUP when `reload` is set
async fn shutdown_signal(cancel: CancellationToken, reload: Option<ReloadHandle>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    #[cfg(unix)]
    let hangup = async {
        let Some(reload) = reload else {
            return std::future::pending::<()>().await;
        };
        match signal::unix::signal(signal::unix::SignalKind::hangup()) {
            Ok(mut signal) => {
                while signal.recv().await.is_some() {
                    info!("Received SIGHUP, reloading configuration after this cycle");
                    reload.request();
                }
            },
            Err(e) => {
                error!("Failed to install SIGHUP handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let hangup = {
        drop(reload);
        std::future::pending::<()>()
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, finishing current work before shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, finishing current work before shutdown");
        },
        _ = hangup => {},
    }
    cancel.cancel();
}
