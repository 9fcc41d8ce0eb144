//! teepoold — the teepool daemon.
//!
//! Single binary that assembles the pool:
//! - Configuration (TOML file plus `TEEPOOL_*` overrides)
//! - Provisioning backend (local processes/containers or a remote fleet API)
//! - Orchestrator + autoscaler control loop
//! - REST API
//!
//! # Usage
//!
//! ```text
//! teepoold serve --config /etc/teepool/teepool.toml --port 8400
//! teepoold check-config --config /etc/teepool/teepool.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use teepool_core::{BackendConfig, TeepoolConfig};
use teepool_orchestrator::Orchestrator;
use teepool_provision::{LocalProcessBackend, ProvisioningBackend, RemoteBackend};

#[derive(Parser)]
#[command(name = "teepoold", about = "teepool daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator and serve the REST API.
    Serve {
        /// Path to teepool.toml. Defaults plus environment overrides when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on.
        #[arg(long, default_value = "8400")]
        port: u16,

        #[arg(long, value_enum, default_value = "text")]
        log_format: LogFormat,
    },
    /// Load and validate a configuration, then exit.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            port,
            log_format,
        } => {
            init_tracing(log_format);
            let config = load_config(config.as_deref())?;
            serve(config, port).await
        }
        Command::CheckConfig { config } => {
            init_tracing(LogFormat::Text);
            let config = load_config(Some(&config))?;
            println!(
                "config ok: backend={} templates={} max_nodes={} min_warm_nodes={}",
                config.backend.name(),
                config.templates.len(),
                config.policy.max_nodes,
                config.policy.min_warm_nodes,
            );
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,teepoold=debug,teepool=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<TeepoolConfig> {
    let mut config = match path {
        Some(path) => TeepoolConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TeepoolConfig::default(),
    };
    config.apply_env().context("applying environment overrides")?;
    config.validate()?;
    Ok(config)
}

fn build_backend(config: &BackendConfig) -> anyhow::Result<Arc<dyn ProvisioningBackend>> {
    let backend: Arc<dyn ProvisioningBackend> = match config {
        BackendConfig::Local(local) => Arc::new(LocalProcessBackend::new(local.clone())),
        BackendConfig::Remote(remote) => Arc::new(
            RemoteBackend::from_config(remote).context("building remote fleet backend")?,
        ),
    };
    Ok(backend)
}

async fn serve(config: TeepoolConfig, port: u16) -> anyhow::Result<()> {
    info!("teepool daemon starting");

    // ── Initialize subsystems ──────────────────────────────────

    let backend = build_backend(&config.backend)?;
    info!(backend = backend.name(), "provisioning backend initialized");

    let policy = config.policy.to_policy();
    info!(
        min_warm_nodes = policy.min_warm_nodes,
        max_nodes = policy.max_nodes,
        templates = config.templates.len(),
        "pool policy loaded"
    );

    let orchestrator = Arc::new(
        Orchestrator::new(backend, policy, config.templates)
            .with_fallback(config.fallback_endpoint),
    );
    orchestrator.spawn_control_loop();

    // ── Start API server ───────────────────────────────────────

    let router = teepool_api::build_router(orchestrator.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    let report = orchestrator.shutdown().await;
    info!(
        rejected = report.rejected,
        destroyed = report.destroyed,
        "teepool daemon stopped"
    );
    Ok(())
}
