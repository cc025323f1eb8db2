//! `hq-edge` binary: load configuration, wire the bundled collaborator
//! implementations, and run the supervisor until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use hq_edge::certs::{CertManager, DirCertManager};
use hq_edge::config::Config;
use hq_edge::mesh::overlay::{LoopbackOverlay, Overlay};
use hq_edge::secrets::FileSecretStore;
use hq_edge::supervisor::{Collaborators, Supervisor};

/// Edge connectivity core for HQ: reverse tunnel to an ingress relay plus
/// mesh overlay client.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, env = "HQ_EDGE_CONFIG", default_value = "hq-edge.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "HQ_EDGE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "HQ_EDGE_LOG_JSON", default_value_t = false)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls CryptoProvider"))?;

    let cli = Cli::parse();
    init_tracing(&cli);

    let config = Config::load(&cli.config)
        .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", cli.config.display()))?;
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "hq-edge starting"
    );

    let secrets = Arc::new(FileSecretStore::new(
        config.mesh.state_dir.join("secrets.toml"),
    ));
    let cert_manager: Option<Arc<dyn CertManager>> = config
        .tunnel
        .acme
        .enabled
        .then(|| Arc::new(DirCertManager::new(config.cert_dir())) as Arc<dyn CertManager>);
    let overlay: Option<Arc<dyn Overlay>> = if config.mesh.enabled {
        // The production overlay library is injected by the embedding
        // server; standalone runs get the loopback development backend.
        warn!("using the bundled loopback overlay backend; no real peers will be reachable");
        Some(Arc::new(LoopbackOverlay::new()) as Arc<dyn Overlay>)
    } else {
        None
    };

    let supervisor = Supervisor::new(
        config,
        Collaborators {
            overlay,
            cert_manager,
            secrets: Some(secrets),
        },
    );
    supervisor.start().await?;

    wait_for_shutdown().await;
    info!("shutdown signal received, cleaning up...");
    supervisor.stop().await;

    info!("hq-edge stopped");
    Ok(())
}

fn init_tracing(cli: &Cli) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
