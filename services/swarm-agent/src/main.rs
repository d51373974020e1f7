//! Swarm Agent
//!
//! Joins the peer overlay, translates the application topology into
//! orchestrator manifests and applies them, then reports status until
//! stopped.
//!
//! ## Architecture
//!
//! - **Start sequence**: role-specific stage pipeline, see `swarm_agent::lifecycle`
//! - **Status Loop**: logs the agent status periodically while running
//! - **Signals**: interrupt/terminate stop the agent and exit cleanly

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use swarm_agent::agent::{Agent, DEFAULT_STAGING_DIR};
use swarm_agent::config::AgentConfig;
use swarm_agent::{logging, status};

#[derive(Debug, Parser)]
#[command(name = "swarm-agent", version, about = "Swarm agent")]
struct Args {
    /// Agent config file.
    config_path: Option<PathBuf>,

    /// Application topology (TOSCA) file.
    topology_path: Option<PathBuf>,

    /// Directory for translated manifests.
    #[arg(long, env = "SWARM_STAGING_DIR", default_value = DEFAULT_STAGING_DIR)]
    staging_dir: PathBuf,

    /// Seconds between status reports.
    #[arg(long, env = "SWARM_STATUS_INTERVAL_SECS", default_value_t = 30)]
    status_interval_secs: u64,

    /// JSON log file; empty disables file logging.
    #[arg(long, env = "SWARM_LOG_FILE", default_value = "swarm_agent.log")]
    log_file: String,

    /// Mount root holding per-node config and topology files.
    #[arg(long, env = "SWARM_CONFIG_ROOT", default_value = "/config")]
    config_root: PathBuf,
}

/// Resolve the config and topology paths.
///
/// With a node name, defaults live under `<root>/config` and `<root>/tosca`.
fn default_paths(root: &Path, node_name: Option<&str>) -> (PathBuf, PathBuf) {
    match node_name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(node) => (
            root.join("config").join(format!("config-{}.yaml", node)),
            root.join("tosca").join(format!("tosca-{}.yaml", node)),
        ),
        None => (PathBuf::from("config.yaml"), PathBuf::from("tosca.yaml")),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to install terminate handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_file = Some(args.log_file.trim())
        .filter(|f| !f.is_empty())
        .map(Path::new);
    logging::init(log_file)?;

    let node_name = std::env::var("NODE_NAME").ok();
    let (default_config, default_topology) = default_paths(&args.config_root, node_name.as_deref());
    let config_path = args.config_path.unwrap_or(default_config);
    let topology_path = args.topology_path.unwrap_or(default_topology);

    info!(
        config = %config_path.display(),
        topology = %topology_path.display(),
        staging_dir = %args.staging_dir.display(),
        "Starting swarm agent"
    );

    let config = AgentConfig::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

    let agent = Arc::new(Agent::new(config, topology_path).with_staging_dir(args.staging_dir));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::select! {
        result = agent.start() => {
            if let Err(e) = result {
                error!(reason = e.reason_code(), error = %e, "Swarm agent failed to start");
                return Err(e.into());
            }
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal during start");
            agent.stop();
            return Ok(());
        }
    }

    let status_handle = tokio::spawn(status::run_status_loop(
        Arc::clone(&agent),
        Duration::from_secs(args.status_interval_secs.max(1)),
        shutdown_rx,
    ));

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
        }
        result = status_handle => {
            match result {
                Ok(reports) => info!(reports, "Status loop exited"),
                Err(e) => error!(error = %e, "Status task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);
    agent.stop();

    info!("Swarm agent shutdown complete");
    Ok(())
}
