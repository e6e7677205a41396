//! RAID Lifecycle Manager
//!
//! Daemon entry point: wires the engine, store, host and device registry
//! together, runs boot recovery, then serves the REST API together with
//! health and metrics endpoints until SIGINT/SIGTERM.

use anyhow::Context;
use clap::Parser;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use raid_lifecycle_manager::controlplane::{
    ApiServer, ApiServerConfig, BootRecoveryChecker, EngineConfig, EngineFactory, HostConfig,
    ManagerConfig, OperationOrchestrator, ProgressEventBus, RaidMetrics, RecordingHost,
    SimulatedBays, SimulatedEngineConfig, SystemHost, ZfsConfig,
};
use raid_lifecycle_manager::domain::{DeviceProberRef, HostControlRef};
use raid_lifecycle_manager::hardware::{parse_bay_map, BayScanner, DeviceRegistry, ScannerConfig};
use raid_lifecycle_manager::store::{FileStateStore, StateStoreRef};

// =============================================================================
// CLI Arguments
// =============================================================================

/// RAID Lifecycle Manager - pool setup, expansion, replacement and failsafe transition
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: SocketAddr,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Directory holding the pool descriptor and operation records
    #[arg(long, env = "STATE_DIR", default_value = "/var/lib/raid-manager")]
    state_dir: PathBuf,

    /// Key of the managed pool inside the state directory
    #[arg(long, env = "POOL_KEY", default_value = "default")]
    pool_key: String,

    /// Pool engine (zfs, simulated)
    #[arg(long, env = "ENGINE", default_value = "zfs")]
    engine: String,

    /// Number of bays populated in simulated mode
    #[arg(long, env = "SIM_DEVICES", default_value = "4")]
    sim_devices: u8,

    /// Raw device size in simulated mode
    #[arg(long, env = "SIM_DEVICE_BYTES", default_value = "4000787030016")]
    sim_device_bytes: u64,

    /// Engine poll interval while an operation runs
    #[arg(long, env = "POLL_INTERVAL_MS", default_value = "2000")]
    poll_interval_ms: u64,

    /// Interval of the background rebuild monitor
    #[arg(long, env = "POOL_MONITOR_INTERVAL_MS", default_value = "1000")]
    pool_monitor_interval_ms: u64,

    /// Pause before requesting the reboot during a failsafe transition
    #[arg(long, env = "REBOOT_DELAY_SECS", default_value = "5")]
    reboot_delay_secs: u64,

    /// Marker left by the boot layer when the pool did not mount
    #[arg(long, env = "MOUNT_ERROR_MARKER", default_value = "/run/raid-manager/mount-error")]
    mount_error_marker: PathBuf,

    /// Marker present once a user account exists
    #[arg(long, env = "ACCOUNT_MARKER", default_value = "/var/lib/raid-manager/account")]
    account_marker: PathBuf,

    /// PCI address to bay number, e.g. `0000:01:00.0=1,0000:02:00.0=2`
    #[arg(long, env = "BAY_MAP", default_value = "")]
    bay_map: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn simulated(&self) -> bool {
        matches!(self.engine.to_lowercase().as_str(), "simulated" | "sim")
    }

    fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            reboot_delay: Duration::from_secs(self.reboot_delay_secs),
            pool_monitor_interval: Duration::from_millis(self.pool_monitor_interval_ms),
            ..Default::default()
        }
    }

    fn scanner_config(&self) -> anyhow::Result<ScannerConfig> {
        Ok(ScannerConfig {
            bay_map: parse_bay_map(&self.bay_map).context("invalid bay map")?,
            ..Default::default()
        })
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            zfs: ZfsConfig {
                state_dir: self.state_dir.clone(),
                ..Default::default()
            },
            simulated: SimulatedEngineConfig::default(),
        }
    }

    fn host_config(&self) -> HostConfig {
        HostConfig {
            mount_error_marker: self.mount_error_marker.clone(),
            account_marker: self.account_marker.clone(),
            ..Default::default()
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting RAID Lifecycle Manager");
    info!("  Version: {}", raid_lifecycle_manager::VERSION);
    info!("  REST API: {}", args.api_addr);
    info!("  Engine: {}", args.engine);
    info!("  State dir: {}", args.state_dir.display());

    let metrics = RaidMetrics::new()?;
    let store: StateStoreRef = Arc::new(
        FileStateStore::open(&args.state_dir, &args.pool_key)
            .await
            .context("failed to open state store")?,
    );
    let engine = EngineFactory::create(&args.engine, args.engine_config())?;

    let (prober, host): (DeviceProberRef, HostControlRef) = if args.simulated() {
        warn!(devices = args.sim_devices, "Running against simulated bays");
        (
            Arc::new(SimulatedBays::uniform(args.sim_devices, args.sim_device_bytes)),
            Arc::new(RecordingHost::new()),
        )
    } else {
        (
            Arc::new(BayScanner::new(args.scanner_config()?)),
            Arc::new(SystemHost::new(args.host_config())),
        )
    };

    let registry = DeviceRegistry::new(prober);
    let orchestrator = OperationOrchestrator::new(
        args.manager_config(),
        registry.clone(),
        store.clone(),
        engine.clone(),
        host.clone(),
        ProgressEventBus::new(256),
        metrics.clone(),
    );
    let recovery = BootRecoveryChecker::new(
        orchestrator.clone(),
        registry.clone(),
        store,
        engine,
        host,
        metrics.clone(),
    );

    let report = recovery
        .run_startup()
        .await
        .context("boot recovery failed")?;
    info!(
        pool_exists = report.pool_exists,
        mount_failure = report.mount_failure,
        resumed = report.resumed.as_ref().map(|r| r.kind_name()),
        "Boot recovery complete"
    );
    orchestrator.spawn_rebuild_monitor();

    // Start health server
    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr).await {
            error!("Health server error: {:#}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, metrics).await {
            error!("Metrics server error: {:#}", e);
        }
    });

    let api_server = Arc::new(ApiServer::new(
        ApiServerConfig {
            rest_addr: args.api_addr,
            ..Default::default()
        },
        orchestrator.clone(),
        recovery,
        registry,
    ));

    let signal_server = api_server.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown requested");
        orchestrator.shutdown();
        signal_server.shutdown();
    });

    api_server.run().await?;

    info!("RAID Lifecycle Manager stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
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
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        level @ ("trace" | "debug" | "info" | "warn" | "error") => level.to_string(),
        _ => "info".to_string(),
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("{},hyper=warn,tower=warn,axum=info", level)))
        .context("invalid log filter")?;

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

fn plain_response(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: SocketAddr) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => plain_response(StatusCode::OK, "ok"),
                _ => plain_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, Infallible>(response)
        }))
    });

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .with_context(|| format!("failed to bind health server on {}", addr))?
        .serve(make_svc)
        .await
        .context("health server failed")?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

fn metrics_response(metrics: &RaidMetrics, path: &str) -> hyper::Response<hyper::Body> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::StatusCode;

    if path != "/metrics" {
        return plain_response(StatusCode::NOT_FOUND, "not found");
    }

    match metrics.encode() {
        Ok((content_type, buffer)) => {
            let mut response = plain_response(StatusCode::OK, buffer);
            if let Ok(value) = HeaderValue::from_str(&content_type) {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => {
            warn!("Metrics encoding failed: {}", e);
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn run_metrics_server(addr: SocketAddr, metrics: Arc<RaidMetrics>) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move { Ok::<_, Infallible>(metrics_response(&metrics, req.uri().path())) }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .with_context(|| format!("failed to bind metrics server on {}", addr))?
        .serve(make_svc)
        .await
        .context("metrics server failed")?;

    Ok(())
}
