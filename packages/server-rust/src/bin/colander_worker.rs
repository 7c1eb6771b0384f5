//! `colander-worker`: runs the task executor, priority lanes, background
//! sweeper, report scheduler, and dashboard API in one process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use colander_core::{QuotaStore, ResponseCache, SystemClock};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};

use colander_server::adapter::{HttpAdapter, HttpAdapterConfig};
use colander_server::cache::{MemoryCacheConfig, MemoryResponseCache};
use colander_server::catalog::{catalog_registry, load_limits};
use colander_server::limiter::RateLimiter;
use colander_server::logging::{init_logging, LogFormat};
use colander_server::network::{NetworkConfig, NetworkModule};
use colander_server::pipeline::Dispatcher;
use colander_server::quota::MemoryQuotaStore;
use colander_server::retry::RetryPolicy;
use colander_server::scheduler::{ScheduledJob, Scheduler, REPORT_POLL_INTERVAL};
use colander_server::service::middleware::build_operation_pipeline;
use colander_server::service::{BackgroundWorker, LaneConfig, Sweeper, TaskExecutor, WorkerConfig};
use colander_server::workflows::register_workflows;

#[derive(Debug, Parser)]
#[command(name = "colander-worker", version, about = "Quota-aware task worker")]
struct Args {
    /// Shared Redis for quota and cache. In-memory stores when absent.
    #[arg(long, env = "COLANDER_REDIS_URL")]
    redis_url: Option<String>,

    /// Base URL of the external API.
    #[arg(long, env = "COLANDER_API_BASE_URL", default_value = "http://127.0.0.1:8080/api")]
    api_base_url: String,

    #[arg(long, env = "COLANDER_BIND", default_value = "0.0.0.0")]
    bind: String,

    #[arg(long, env = "COLANDER_PORT", default_value_t = 8600)]
    port: u16,

    /// JSON limits table overlaid on the built-in catalog.
    #[arg(long, env = "COLANDER_LIMITS_FILE")]
    limits_file: Option<PathBuf>,

    #[arg(long, default_value_t = 4)]
    low_workers: usize,

    #[arg(long, default_value_t = 4)]
    medium_workers: usize,

    #[arg(long, default_value_t = 4)]
    high_workers: usize,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Serve Prometheus metrics on this port.
    #[arg(long, env = "COLANDER_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Report request ids to poll until they finish.
    #[arg(long, value_delimiter = ',')]
    await_reports: Vec<String>,
}

struct Stores {
    quota: Arc<dyn QuotaStore>,
    cache: Arc<dyn ResponseCache>,
    /// Set when quota lives in memory and needs sweeping.
    sweepable: Option<Arc<MemoryQuotaStore>>,
}

fn build_stores(redis_url: Option<&str>, idle_expiry: Duration) -> anyhow::Result<Stores> {
    match redis_url {
        None => {
            let memory = Arc::new(MemoryQuotaStore::new(Arc::new(SystemClock), idle_expiry));
            Ok(Stores {
                quota: memory.clone(),
                cache: Arc::new(MemoryResponseCache::new(
                    &MemoryCacheConfig::default(),
                    Arc::new(SystemClock),
                )),
                sweepable: Some(memory),
            })
        }
        #[cfg(feature = "redis")]
        Some(url) => {
            use colander_server::cache::RedisResponseCache;
            use colander_server::quota::redis::RedisQuotaConfig;
            use colander_server::quota::RedisQuotaStore;

            let config = RedisQuotaConfig {
                idle_expiry,
                ..RedisQuotaConfig::default()
            };
            Ok(Stores {
                quota: Arc::new(RedisQuotaStore::new(url, config)?),
                cache: Arc::new(RedisResponseCache::new(url)?),
                sweepable: None,
            })
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => anyhow::bail!("--redis-url requires a build with the `redis` feature"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);

    if let Some(port) = args.metrics_port {
        PrometheusBuilder::new()
            .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
            .install()
            .context("installing Prometheus exporter")?;
        info!(port, "metrics exporter listening");
    }

    let config = WorkerConfig {
        lanes: LaneConfig {
            low_workers: args.low_workers,
            medium_workers: args.medium_workers,
            high_workers: args.high_workers,
            ..LaneConfig::default()
        },
        ..WorkerConfig::default()
    };

    let stores = build_stores(args.redis_url.as_deref(), config.usage_idle_expiry)?;
    let limits = load_limits(args.limits_file.as_deref())?;

    let adapter = HttpAdapter::new(&HttpAdapterConfig {
        base_url: args.api_base_url.clone(),
        ..HttpAdapterConfig::default()
    })?;
    let registry = catalog_registry(&adapter);
    register_workflows(&registry);
    info!(operations = registry.len(), "operation registry built");

    let limiter = Arc::new(
        RateLimiter::new(stores.quota, Arc::new(limits)).with_wait_adjust(config.wait_adjust),
    );
    let executor = TaskExecutor::new(registry, limiter, stores.cache, RetryPolicy::default());
    let dispatcher = Dispatcher::start(build_operation_pipeline(executor, &config), &config);

    let mut sweeper = Sweeper::new(config.finished_task_retention)
        .with_task_table(dispatcher.tasks().clone());
    if let Some(memory) = stores.sweepable {
        sweeper = sweeper.with_quota_store(memory);
    }
    let mut sweep_worker = BackgroundWorker::start(sweeper, config.sweep_interval);

    let mut scheduler = BackgroundWorker::start(
        Scheduler::new(dispatcher.clone()),
        Duration::from_secs(1),
    );
    for id in &args.await_reports {
        scheduler
            .submit(ScheduledJob::await_reports(&[id.as_str()], REPORT_POLL_INTERVAL))
            .await?;
    }

    let mut dashboard = NetworkModule::new(
        NetworkConfig {
            host: args.bind.clone(),
            port: args.port,
            ..NetworkConfig::default()
        },
        dispatcher.clone(),
    );
    let port = dashboard.start().await?;
    info!(port, "colander worker started");

    dashboard.serve(shutdown_signal()).await?;

    dispatcher.shutdown();
    scheduler.stop().await;
    sweep_worker.stop().await;
    info!("colander worker stopped");
    Ok(())
}
