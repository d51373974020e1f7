//! Steady-state status reporting.
//!
//! Once running, the agent logs its status periodically until shutdown is
//! signalled or the agent stops.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use crate::agent::Agent;

/// Report status every `interval` until shutdown. Returns the number of
/// reports emitted.
pub async fn run_status_loop(
    agent: Arc<Agent>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> usize {
    info!(
        agent_id = %agent.config().agent_id,
        interval_secs = interval.as_secs(),
        "Starting status loop"
    );

    let mut reports = 0usize;
    let mut interval_timer = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                let status = agent.status();
                if !status.is_running {
                    info!(stage = %status.stage, "Agent no longer running, status loop exiting");
                    break;
                }

                reports += 1;
                info!(
                    agent_id = %status.agent_id,
                    role = %status.role,
                    stage = %status.stage,
                    application_id = %status.application_id,
                    connected_peers = agent.connected_peers().len(),
                    "Agent status"
                );
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Status loop shutting down");
                    break;
                }
            }
        }
    }

    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;

    fn agent() -> Arc<Agent> {
        let config = AgentConfig::from_yaml_str(
            r#"
SA_id: sa-status
password: secret
universe_id: uni
api_ip: 127.0.0.1
api_port: 8080
p2p_public_ip: 127.0.0.1
p2p_public_port: 0
p2p_listen_ip: 127.0.0.1
p2p_listen_port: 0
app_id: app
resource_id: res
SA_role: worker
"#,
        )
        .unwrap();
        Arc::new(Agent::new(config, "tosca.yaml"))
    }

    #[tokio::test]
    async fn test_exits_when_agent_not_running() {
        let (_tx, rx) = watch::channel(false);
        let reports = run_status_loop(agent(), Duration::from_millis(10), rx).await;
        assert_eq!(reports, 0);
    }
}
