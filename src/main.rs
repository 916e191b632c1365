use clap::Parser;
use hallmonitor::aggregator::Aggregator;
use hallmonitor::backoff::BackoffTracker;
use hallmonitor::config::{BackendKind, Config, LogFormat, LoggingConfig};
use hallmonitor::executors::ProbeContext;
use hallmonitor::manager::{MonitorManager, MonitorSet};
use hallmonitor::metrics::Metrics;
use hallmonitor::pool::{WorkerPool, DEFAULT_POOL_SIZE};
use hallmonitor::routes::{self, AppState};
use hallmonitor::scheduler::Scheduler;
use hallmonitor::store::{
    InfluxStore, NoopStore, PostgresStore, ResultStore, RetentionPolicy, SledStore, StorageBackend,
};
use rocket::{catchers, routes};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hallmonitor", about = "Lightweight uptime monitoring engine", version)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(
        short,
        long,
        env = "HALLMONITOR_CONFIG",
        default_value = "hallmonitor.yaml"
    )]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check_config: bool,
}

#[rocket::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("hallmonitor: {}", err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(&cli.config)?;
    let monitors = config.resolve_monitors()?;
    if cli.check_config {
        println!(
            "configuration OK: {} monitors in {} groups",
            monitors.len(),
            config.monitoring.groups.len()
        );
        return Ok(());
    }

    init_logging(&config.logging)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        monitors = monitors.len(),
        "starting hallmonitor"
    );

    let backend: Arc<dyn StorageBackend> = match config.storage.backend {
        BackendKind::None => Arc::new(NoopStore::new()),
        BackendKind::Sled => {
            let sled_config = config.storage.sled.clone().unwrap_or_default();
            Arc::new(SledStore::open(&sled_config.path)?)
        }
        BackendKind::Postgres => {
            let pg_config = config.storage.postgres.clone().unwrap_or_default();
            Arc::new(PostgresStore::connect(&pg_config).await?)
        }
        BackendKind::Influxdb => {
            let influx_config = config.storage.influxdb.clone().unwrap_or_default();
            Arc::new(InfluxStore::new(&influx_config)?)
        }
    };
    info!(backend = backend.name(), "storage backend initialized");

    let metrics = Arc::new(Metrics::new(prometheus::Registry::new())?);
    if config.metrics.include_process_metrics {
        metrics.register_process_collector()?;
    }

    let store = ResultStore::new(backend.clone(), metrics.dropped_writes.clone());
    let backoff = Arc::new(BackoffTracker::new());
    let manager = Arc::new(MonitorManager::new(MonitorSet::new(monitors)));
    let mut ctx = ProbeContext::new()?;
    ctx.ssl_expiry_warning_days = config.monitoring.default_ssl_cert_expiry_warning_days;
    let ctx = Arc::new(ctx);
    let pool = WorkerPool::start(
        DEFAULT_POOL_SIZE,
        store.clone(),
        backoff.clone(),
        metrics.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::new(manager.clone(), pool, backoff, ctx);
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx.clone()));
    let aggregator = Aggregator::new(
        backend,
        RetentionPolicy {
            retention_days: config.storage.retention_days.0,
        },
    );
    let aggregator_task = tokio::spawn(aggregator.run(shutdown_rx));

    let rocket_config = rocket::Config {
        address: config.server.host.parse()?,
        port: config.server.port,
        ..rocket::Config::default()
    };
    let state = AppState {
        config: RwLock::new(config.clone()),
        config_path: cli.config.clone(),
        manager,
        store: store.clone(),
        metrics,
        started_at: Instant::now(),
    };

    let mut rocket = rocket::custom(rocket_config)
        .manage(state)
        .mount("/", routes![routes::health, routes::ready])
        .mount(
            "/api/v1",
            routes![
                routes::list_monitors,
                routes::get_monitor,
                routes::monitor_history,
                routes::monitor_uptime,
                routes::list_groups,
                routes::get_group,
                routes::get_config,
                routes::reload,
            ],
        )
        .register(
            "/",
            catchers![
                routes::unparseable_request,
                routes::unknown_route,
                routes::handler_fault,
            ],
        );

    if config.metrics.enabled {
        let mut path = config.metrics.path.clone();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        rocket = rocket.mount(path, routes![routes::metrics_endpoint]);
    }
    if !config.server.cors_origins.is_empty() {
        let cors = rocket_cors::CorsOptions {
            allowed_origins: rocket_cors::AllowedOrigins::some_exact(&config.server.cors_origins),
            ..Default::default()
        }
        .to_cors()?;
        rocket = rocket.attach(cors);
    }

    rocket.launch().await?;

    // server stopped (signal or fatal error): stop probing, drain, flush
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    scheduler_task.await?;
    aggregator_task.await?;
    store.close().await?;
    info!("shutdown complete");
    Ok(())
}

fn init_logging(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if config.output == "stdout" {
        match config.format {
            LogFormat::Json => builder.json().init(),
            LogFormat::Text => builder.init(),
        }
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.output)?;
        let writer = Arc::new(file);
        match config.format {
            LogFormat::Json => builder.json().with_writer(writer).init(),
            LogFormat::Text => builder.with_writer(writer).init(),
        }
    }
    Ok(())
}
