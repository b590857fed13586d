//! EFS CSI Driver
//!
//! Kubernetes CSI driver serving Identity, Controller and Node services for
//! access-point backed volumes.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

use efs_csi_driver::cloud::TlsConfig;
use efs_csi_driver::config::{DriverConfig, Endpoint, Mode, VolumeMetricsConfig, parse_tags};
use efs_csi_driver::driver;
use efs_csi_driver::identity::BuildInfo;
use efs_csi_driver::metrics;

/// CLI arguments for the CSI driver
#[derive(Parser, Debug)]
#[command(name = "efs-csi-driver")]
#[command(about = "EFS CSI Driver for Kubernetes")]
#[command(disable_version_flag = true)]
struct Args {
    /// Services to run: controller, node or all
    mode: Option<String>,

    /// Print build information as JSON and exit
    #[arg(long)]
    version: bool,

    /// CSI endpoint (unix:///path or tcp://host:port)
    #[arg(long, default_value = "unix:///tmp/csi.sock")]
    endpoint: String,

    /// Node ID for this CSI node
    #[arg(long, env = "CSI_NODE_ID")]
    node_id: Option<String>,

    /// Control-plane agent gRPC endpoint; memory:// uses an in-process fake
    #[arg(long, env = "CLOUD_ENDPOINT", default_value = "http://127.0.0.1:50052")]
    cloud_endpoint: String,

    /// Client certificate for the agent connection (PEM format)
    #[arg(long, env = "CLOUD_TLS_CERT_PATH")]
    cloud_tls_cert: Option<PathBuf>,

    /// Client private key for the agent connection (PEM format)
    #[arg(long, env = "CLOUD_TLS_KEY_PATH")]
    cloud_tls_key: Option<PathBuf>,

    /// CA certificate the agent's server certificate must chain to
    #[arg(long, env = "CLOUD_TLS_CA_PATH")]
    cloud_tls_ca: Option<PathBuf>,

    /// Expected server name of the agent certificate
    #[arg(long, env = "CLOUD_TLS_DOMAIN", default_value = "localhost")]
    cloud_tls_domain: String,

    /// efs-utils configuration directory
    #[arg(long = "efs-utils-config-dir-path", default_value = "/var/amazon/efs")]
    efs_utils_config_dir: PathBuf,

    /// Legacy efs-utils configuration directory, preferred when populated
    #[arg(long = "efs-utils-config-legacy-dir-path", default_value = "/etc/amazon/efs-legacy")]
    efs_utils_config_legacy_dir: PathBuf,

    /// Pristine efs-utils static files
    #[arg(long = "efs-utils-static-files-path", default_value = "/etc/amazon/efs-static-files/")]
    efs_utils_static_files_dir: PathBuf,

    /// Delete an access point's root directory on DeleteVolume
    #[arg(long)]
    delete_access_point_root_dir: bool,

    /// Space separated key:value tags added to created access points
    #[arg(long, default_value = "")]
    tags: String,

    /// Report per-volume usage from NodeGetVolumeStats
    #[arg(long)]
    vol_metrics_opt_in: bool,

    /// Minutes between two usage walks of the same volume
    #[arg(long, default_value = "240")]
    vol_metrics_refresh_period: f64,

    /// Concurrent usage walks per file system
    #[arg(long, default_value = "5")]
    vol_metrics_fs_rate_limit: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9809)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.version {
        println!("{}", BuildInfo::current().to_json()?);
        return Ok(());
    }

    // Initialize tracing with configured log level
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    // Initialize Prometheus metrics endpoint if configured
    if let Some(ref addr_str) = args.metrics_addr {
        let addr = addr_str
            .parse()
            .map_err(|e| format!("Invalid metrics address '{}': {}", addr_str, e))?;
        if let Err(e) = metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    if let Err(e) = driver::run(config, shutdown_signal()).await {
        error!(error = %e, "Driver failed");
        std::process::exit(1);
    }

    Ok(())
}

fn build_config(args: &Args) -> Result<DriverConfig, Box<dyn std::error::Error>> {
    let mode: Mode = match &args.mode {
        Some(mode) => mode.parse()?,
        None => Mode::default(),
    };

    let node_id = match &args.node_id {
        Some(id) => id.clone(),
        None => hostname::get()?.to_string_lossy().to_string(),
    };

    if !args.vol_metrics_refresh_period.is_finite() || args.vol_metrics_refresh_period <= 0.0 {
        return Err(format!(
            "invalid --vol-metrics-refresh-period {}: must be a positive number of minutes",
            args.vol_metrics_refresh_period
        )
        .into());
    }

    let mut config = DriverConfig::new(mode, node_id);
    config.endpoint = args.endpoint.parse::<Endpoint>()?;
    config.cloud_endpoint = args.cloud_endpoint.clone();
    config.cloud_tls = match (&args.cloud_tls_cert, &args.cloud_tls_key, &args.cloud_tls_ca) {
        (Some(cert), Some(key), Some(ca)) => Some(TlsConfig {
            cert_path: cert.clone(),
            key_path: key.clone(),
            ca_path: ca.clone(),
            domain: args.cloud_tls_domain.clone(),
        }),
        (None, None, None) => None,
        _ => {
            return Err(
                "--cloud-tls-cert, --cloud-tls-key and --cloud-tls-ca must be given together".into(),
            );
        }
    };
    config.efs_utils_config_dir = args.efs_utils_config_dir.clone();
    config.efs_utils_config_legacy_dir = args.efs_utils_config_legacy_dir.clone();
    config.efs_utils_static_files_dir = args.efs_utils_static_files_dir.clone();
    config.delete_access_point_root_dir = args.delete_access_point_root_dir;
    config.tags = parse_tags(&args.tags);
    config.volume_metrics = VolumeMetricsConfig {
        opt_in: args.vol_metrics_opt_in,
        refresh_period: Duration::from_secs_f64(args.vol_metrics_refresh_period * 60.0),
        fs_rate_limit: args.vol_metrics_fs_rate_limit,
    };
    Ok(config)
}

/// Wait for shutdown signal (SIGTERM, SIGINT, or SIGHUP)
async fn shutdown_signal() {
    use signal::unix::{SignalKind, signal};

    // Install signal handlers, logging errors but continuing with available handlers
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            None
        }
    };

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => Some(s),
        Err(e) => {
            error!("Failed to install SIGINT handler: {}", e);
            None
        }
    };

    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => Some(s),
        Err(e) => {
            error!("Failed to install SIGHUP handler: {}", e);
            None
        }
    };

    tokio::select! {
        Some(_) = async { sigterm.as_mut()?.recv().await } => {
            info!("Received SIGTERM");
        }
        Some(_) = async { sigint.as_mut()?.recv().await } => {
            info!("Received SIGINT");
        }
        Some(_) = async { sighup.as_mut()?.recv().await } => {
            info!("Received SIGHUP, shutting down");
        }
        else => {
            error!("No shutdown signal handler installed; running until killed");
            std::future::pending::<()>().await;
        }
    }
}
