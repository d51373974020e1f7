//! Agent lifecycle stages and the per-role pipelines.
//!
//! ```text
//! Created ─▶ Initializing ─▶ NetworkJoining ─┬─▶ ProcessingTopology ─▶ RequestingResources ─▶ Broadcasting ─┐
//!                                            │   (leader only)                                            │
//!                                            └──────────────────────────────────────────────────────────┬─┘
//!                                                                                                       ▼
//!                                                         TranslatingTopology ─▶ Deploying ─▶ Running
//! ```
//!
//! `Stopped` is reachable from every stage.

use std::fmt;

use serde::Serialize;

use crate::config::Role;

/// One lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Created,
    Initializing,
    NetworkJoining,
    ProcessingTopology,
    RequestingResources,
    Broadcasting,
    TranslatingTopology,
    Deploying,
    Running,
    Stopped,
}

const LEADER_PIPELINE: &[Stage] = &[
    Stage::Initializing,
    Stage::NetworkJoining,
    Stage::ProcessingTopology,
    Stage::RequestingResources,
    Stage::Broadcasting,
    Stage::TranslatingTopology,
    Stage::Deploying,
    Stage::Running,
];

const WORKER_PIPELINE: &[Stage] = &[
    Stage::Initializing,
    Stage::NetworkJoining,
    Stage::TranslatingTopology,
    Stage::Deploying,
    Stage::Running,
];

/// The ordered stages `start()` walks for a role.
pub fn pipeline(role: Role) -> &'static [Stage] {
    match role {
        Role::Leader => LEADER_PIPELINE,
        Role::Worker => WORKER_PIPELINE,
    }
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Created => "created",
            Stage::Initializing => "initializing",
            Stage::NetworkJoining => "network_joining",
            Stage::ProcessingTopology => "processing_topology",
            Stage::RequestingResources => "requesting_resources",
            Stage::Broadcasting => "broadcasting",
            Stage::TranslatingTopology => "translating_topology",
            Stage::Deploying => "deploying",
            Stage::Running => "running",
            Stage::Stopped => "stopped",
        }
    }

    /// Stages only the leader passes through.
    pub fn is_leader_only(&self) -> bool {
        matches!(
            self,
            Stage::ProcessingTopology | Stage::RequestingResources | Stage::Broadcasting
        )
    }

    /// Whether no further transition other than a stop can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Stopped)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
