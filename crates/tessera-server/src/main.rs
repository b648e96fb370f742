//! Tessera node binary.
//!
//! Reads configuration from environment variables (see [`Config`]), builds
//! and opens a [`Server`], then runs until interrupted. The first
//! interrupt or terminate triggers a graceful shutdown; a second forces
//! an immediate exit.
//!
//! ## Quick start
//!
//! ```bash
//! # Development (local data dir, single node)
//! TESSERA_DATA_DIR=./data cargo run --bin tessera-server --release
//!
//! # Two-node static cluster, replica count 2
//! TESSERA_BIND=http://10.0.0.1:10101 \
//! TESSERA_CLUSTER_DISABLED=true \
//! TESSERA_CLUSTER_HOSTS=http://10.0.0.1:10101,http://10.0.0.2:10101 \
//! TESSERA_CLUSTER_REPLICAS=2 \
//!   cargo run --bin tessera-server --release
//! ```

use std::sync::Mutex;

use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use tessera_server::{Config, ServerBuilder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();
    init_tracing(&config)?;

    let server = ServerBuilder::from_config(&config)?.build()?;
    server.open()?;
    info!(uri = %server.node().uri, "listening");

    wait_for_shutdown_signal().await;
    info!("received shutdown signal, closing gracefully");

    // A second signal forces a hard exit.
    tokio::spawn(async {
        wait_for_shutdown_signal().await;
        std::process::exit(1);
    });

    server.close().await?;
    Ok(())
}

fn init_tracing(config: &Config) -> anyhow::Result<()> {
    let default = if config.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    if config.log_path.is_empty() {
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .compact()
            .init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_path)?;
        fmt()
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .with_target(true)
            .compact()
            .init();
    }
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
