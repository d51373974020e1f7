//! Error types for the swarm agent.

use std::path::PathBuf;

use swarm_overlay::OverlayError;
use swarm_topology::TopologyError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::lifecycle::Stage;

/// Agent errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Configuration missing or invalid.
    #[error("config_invalid: {0}")]
    Config(#[from] ConfigError),

    /// The overlay session could not be created or started.
    #[error("network_init_failed: {0}")]
    NetworkInit(#[source] OverlayError),

    /// A message could not be dispatched.
    #[error("send_failed: {tag} to {to}: {source}")]
    Send {
        tag: String,
        to: String,
        #[source]
        source: OverlayError,
    },

    /// The topology could not be parsed or rendered.
    #[error("topology_failed: {0}")]
    Topology(#[from] TopologyError),

    /// The staging directory could not be prepared or written.
    #[error("staging_failed: {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `start()` was called from a stage other than `Created`.
    #[error("invalid_state: cannot start from stage {0}")]
    InvalidState(Stage),

    /// The agent was stopped while starting.
    #[error("stopped during start")]
    Stopped,
}

impl AgentError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            AgentError::Config(_) => "config_invalid",
            AgentError::NetworkInit(_) => "network_init_failed",
            AgentError::Send { .. } => "send_failed",
            AgentError::Topology(_) => "topology_failed",
            AgentError::Staging { .. } => "staging_failed",
            AgentError::InvalidState(_) => "invalid_state",
            AgentError::Stopped => "stopped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        let err = AgentError::Config(ConfigError::InvalidRole("x".into()));
        assert_eq!(err.reason_code(), "config_invalid");
        assert!(err.to_string().starts_with("config_invalid"));

        let err = AgentError::Send {
            tag: "MSG_RESOURCE_REQUEST".into(),
            to: "authority".into(),
            source: OverlayError::PeerUnreachable("authority".into()),
        };
        assert_eq!(err.reason_code(), "send_failed");
        assert!(err.to_string().contains("MSG_RESOURCE_REQUEST"));

        let err = AgentError::Topology(TopologyError::MissingNodeTemplates);
        assert_eq!(err.reason_code(), "topology_failed");
    }
}
