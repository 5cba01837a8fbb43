//! fulcrum entry point: parse arguments, load the config, advertise the
//! PID, and hand control to the reactor loop.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fulcrum::config::Config;
use fulcrum::metrics::Registry;
use fulcrum::server::ProxyServer;
use fulcrum::signals;

#[derive(Parser)]
#[command(name = "fulcrum", about = "Event-driven L4/7 reverse proxy and load balancer")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "fulcrum.json")]
    config: PathBuf,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "FULCRUM_LOG_LEVEL")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    log_config(&config);

    let flags = signals::install().context("failed to install signal handlers")?;

    if let Some(pid_file) = config.pid_file.clone() {
        if let Some(old_pid) = signals::advertise_pid(&pid_file)
            .with_context(|| format!("failed to write {}", pid_file.display()))?
        {
            info!(old_pid, "signalling previous instance to drain");
            signals::signal_drain(old_pid);
        }
    }

    let metrics = Arc::new(Registry::new());
    metrics.register_defaults();

    let mut server = ProxyServer::new(config, metrics, flags)?;
    server.run()
}

fn log_config(config: &Config) {
    info!(
        listen = %format!("{}:{}", config.bind_address, config.listen_port),
        algorithm = config.algorithm.as_str(),
        backends = config.backends.len(),
        pool = config.pool_enabled(),
        rate_limit = config.rate_limit_enabled(),
        metrics_port = ?config.metrics_port,
        "configuration loaded"
    );
    for (i, b) in config.backends.iter().enumerate() {
        info!(
            index = i,
            backend = %format!("{}:{}", b.host, b.port),
            weight = b.weight,
            max_connections = b.max_connections,
            "configured backend"
        );
    }
}
