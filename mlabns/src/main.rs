mod config;

use clap::{Parser, Subcommand};
use config::{Config, ConfigError, LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use rate_table::config::Config as RateTableConfig;
use rate_table::store::{CACHE_NAMESPACE, FastCache, MokaCache, PersistentStore, StoreError};
use rate_table::{RateTable, RateTableService, SyncError, Synchronizer};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "mlabns", about = "Measurement target lookup service")]
struct Cli {
    #[arg(long, default_value = "mlabns.yaml")]
    config_file_path: PathBuf,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Serve the query API, synchronizing the rate table when configured to
    Locate,
    /// Run one synchronization cycle and exit
    SyncOnce,
}

#[derive(thiserror::Error, Debug)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("missing config section: {0}")]
    MissingSection(&'static str),
    #[error("invalid rate_table config: {0}")]
    RateTableConfig(#[from] rate_table::config::ValidationError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("analytics: {0}")]
    Fetch(#[from] rate_table::analytics::FetchError),
    #[error("synchronization: {0}")]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Locate(#[from] locate::LocateError),
    #[error("statsd exporter: {0}")]
    Metrics(String),
}

fn init_logging(logging: Option<&LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    let guard = logging.map(|logging| {
        sentry::init((
            logging.sentry_dsn.as_str(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    guard
}

fn init_metrics(metrics: &MetricsConfig) -> Result<(), StartupError> {
    let recorder = StatsdBuilder::from(metrics.statsd_host.as_str(), metrics.statsd_port)
        .build(Some("mlabns"))
        .map_err(|e| StartupError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder)
        .map_err(|_| StartupError::Metrics("a metrics recorder is already installed".into()))?;

    shared::metrics_defs::describe_all(rate_table::metrics_defs::ALL_METRICS);
    shared::metrics_defs::describe_all(locate::metrics_defs::ALL_METRICS);
    Ok(())
}

fn build_synchronizer(
    config: &RateTableConfig,
    store: Arc<dyn PersistentStore>,
    cache: Arc<dyn FastCache>,
) -> Result<Arc<Synchronizer>, StartupError> {
    let source = rate_table::get_source(&config.analytics)?;
    Ok(Arc::new(Synchronizer::new(
        source,
        store,
        cache,
        config.cycle_timeout(),
    )))
}

async fn run_locate(config: Config) -> Result<(), StartupError> {
    let locate_config = config.locate.ok_or(StartupError::MissingSection("locate"))?;
    let rate_table_config = config
        .rate_table
        .ok_or(StartupError::MissingSection("rate_table"))?;
    rate_table_config.validate()?;

    let cache: Arc<dyn FastCache> = Arc::new(MokaCache::new(CACHE_NAMESPACE));
    let store = rate_table::get_store(&rate_table_config.store)?;
    let table = RateTable::new(
        store.clone(),
        cache.clone(),
        locate_config.cache_read_timeout(),
    );

    if !rate_table_config.synchronize {
        tracing::info!("synchronizer disabled, serving the table as published elsewhere");
        locate::run(locate_config, table, || true).await?;
        return Ok(());
    }

    let synchronizer = build_synchronizer(&rate_table_config, store, cache)?;
    let service = Arc::new(RateTableService::new(
        synchronizer,
        rate_table_config.interval(),
    ));
    let readiness = service.clone();
    let result = locate::run(locate_config, table, move || readiness.is_ready()).await;
    service.shutdown().await;
    Ok(result?)
}

async fn run_sync_once(config: Config) -> Result<(), StartupError> {
    let rate_table_config = config
        .rate_table
        .ok_or(StartupError::MissingSection("rate_table"))?;
    rate_table_config.validate()?;

    // The in-process cache dies with this command; only the store matters.
    let synchronizer = build_synchronizer(
        &rate_table_config,
        rate_table::get_store(&rate_table_config.store)?,
        Arc::new(MokaCache::new(CACHE_NAMESPACE)),
    )?;
    let report = synchronizer.run_cycle().await?;
    tracing::info!(
        cycle = report.cycle,
        new = report.new,
        changed = report.changed,
        unchanged = report.unchanged,
        evicted = report.evicted,
        "synchronization complete"
    );
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let config = match Config::from_file(&cli.config_file_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    };

    let sentry_guard = init_logging(config.common.logging.as_ref());
    if let Some(metrics) = &config.common.metrics
        && let Err(e) = init_metrics(metrics)
    {
        tracing::error!(error = %e, "metrics disabled");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "could not start the tokio runtime");
            process::exit(1);
        }
    };

    let result = runtime.block_on(async move {
        match cli.command {
            CliCommand::Locate => {
                tracing::info!("starting locate");
                run_locate(config).await
            }
            CliCommand::SyncOnce => {
                tracing::info!("running one synchronization cycle");
                run_sync_once(config).await
            }
        }
    });

    if let Err(e) = result {
        tracing::error!(error = %e, "mlabns exited with an error");
        drop(sentry_guard);
        process::exit(1);
    }
}
