use std::{sync::Arc, time::Duration};

use clap::Parser;
use lanhop::{DEFAULT_ALLOW, Proxy, ProxyConfig};
use n0_error::{Result, anyerr};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Explicit forward HTTP proxy for LAN clients.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:8888")]
    listen: String,
    /// Allowed client CIDRs/addresses (comma-separated), or "*".
    #[arg(long, default_value = DEFAULT_ALLOW)]
    allow: String,
    /// Upstream connect timeout in seconds.
    #[arg(long, default_value_t = 15)]
    connect_timeout: u64,
    /// Idle timeout for tunnels in seconds (0 disables).
    #[arg(long, default_value_t = 0)]
    idle_timeout: u64,
    /// Per-exchange diagnostic logging.
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "lanhop=debug"
    } else {
        "lanhop=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ProxyConfig {
        allow: cli.allow.clone(),
        connect_timeout: Duration::from_secs(cli.connect_timeout),
        idle_timeout: Duration::from_secs(cli.idle_timeout),
        ..ProxyConfig::default()
    };
    let proxy = Arc::new(Proxy::new(config).map_err(|err| anyerr!(err))?);

    let listener = TcpListener::bind(&cli.listen).await?;
    info!(listen = %cli.listen, allow = %cli.allow, "lanhop listening");

    tokio::select! {
        res = proxy.serve(listener) => res?,
        _ = tokio::signal::ctrl_c() => {}
    }
    Ok(())
}
