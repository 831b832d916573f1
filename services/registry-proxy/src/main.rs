//! Registry pull-through proxy server
//!
//! Run with: cargo run -p registry-proxy --features cli -- --config proxy.toml

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use eyre::WrapErr as _;
use registry_proxy::{ProxyBuilder, ProxyConfig};
use token_store::MemoryTokenStore;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Pull-through proxy for a container image registry
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the configuration file
    #[arg(long, short)]
    listen: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value_t)]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn load_config(path: Option<&PathBuf>) -> eyre::Result<ProxyConfig> {
    let Some(path) = path else {
        return Ok(ProxyConfig::default());
    };

    let contents = tokio::fs::read_to_string(path)
        .await
        .wrap_err_with(|| format!("reading configuration from {}", path.display()))?;
    toml_edit::de::from_str(&contents)
        .wrap_err_with(|| format!("parsing configuration from {}", path.display()))
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "Unable to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let mut config = load_config(args.config.as_ref()).await?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    let addr = config.listen;
    tracing::info!(
        registry = %config.upstream.registry,
        auth = %config.upstream.auth,
        "Proxying registry"
    );

    let app = ProxyBuilder::new()
        .config(config)
        .store(MemoryTokenStore::new().into())
        .build();

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;

    tracing::info!("Registry proxy listening on http://{}", addr);
    tracing::info!("Try: curl http://{}/v2/", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .wrap_err("serving")?;

    Ok(())
}
