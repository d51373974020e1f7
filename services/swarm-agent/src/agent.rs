//! The swarm agent: role-driven lifecycle over the overlay session.
//!
//! `start()` walks the role's stage pipeline in order. Joining and the
//! resource request are hard prerequisites; broadcast and per-file apply
//! failures are logged and tolerated. A failed join leaves the agent
//! degraded but running.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use swarm_overlay::{join_host_port, Overlay, OverlayError, OverlayHandle, PeerConfig};
use swarm_topology::{ManifestConverter, ToscaConverter};
use tracing::{error, info, warn};

use crate::config::{AgentConfig, Role};
use crate::deploy::{self, ApplyReport};
use crate::error::AgentError;
use crate::join::{JoinCoordinator, JoinResult};
use crate::lifecycle::{pipeline, Stage};
use crate::messages;
use crate::orchestrator::{KubeClient, Orchestrator};
use crate::router::MessageRouter;
use crate::translate::{self, TranslateOptions, TranslationReport};

/// Default staging directory, relative to the working directory.
pub const DEFAULT_STAGING_DIR: &str = "k3s";

/// Point-in-time view of the agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub role: Role,
    pub is_running: bool,
    pub universe_id: String,
    pub application_id: String,
    pub resource_id: String,
    pub stage: Stage,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct AgentState {
    stage: Stage,
    is_running: bool,
    started_at: Option<DateTime<Utc>>,
    history: Vec<Stage>,
    join_result: Option<JoinResult>,
    translation: Option<TranslationReport>,
    apply: Option<ApplyReport>,
}

impl Default for AgentState {
    fn default() -> Self {
        Self {
            stage: Stage::Created,
            is_running: false,
            started_at: None,
            history: vec![Stage::Created],
            join_result: None,
            translation: None,
            apply: None,
        }
    }
}

/// A swarm agent bound to one configuration and topology file.
pub struct Agent {
    config: AgentConfig,
    topology_path: PathBuf,
    staging_dir: PathBuf,
    orchestrator: Arc<dyn Orchestrator>,
    converter: Arc<dyn ManifestConverter>,
    state: Mutex<AgentState>,
    session: Mutex<Option<Arc<JoinCoordinator>>>,
}

impl Agent {
    /// Create an agent using the in-cluster orchestrator client and the
    /// TOSCA converter.
    pub fn new(config: AgentConfig, topology_path: impl Into<PathBuf>) -> Self {
        info!(
            agent_id = %config.agent_id,
            role = %config.role,
            "Swarm agent initialised"
        );
        Self {
            config,
            topology_path: topology_path.into(),
            staging_dir: PathBuf::from(DEFAULT_STAGING_DIR),
            orchestrator: Arc::new(KubeClient::new()),
            converter: Arc::new(ToscaConverter::new()),
            state: Mutex::new(AgentState::default()),
            session: Mutex::new(None),
        }
    }

    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    pub fn with_orchestrator(mut self, orchestrator: Arc<dyn Orchestrator>) -> Self {
        self.orchestrator = orchestrator;
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn ManifestConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Current status snapshot.
    pub fn status(&self) -> AgentStatus {
        let state = self.state();
        AgentStatus {
            agent_id: self.config.agent_id.clone(),
            role: self.config.role,
            is_running: state.is_running,
            universe_id: self.config.universe_id.clone(),
            application_id: self.config.application_id.clone(),
            resource_id: self.config.resource_id.clone(),
            stage: state.stage,
            started_at: state.started_at,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running
    }

    pub fn stage(&self) -> Stage {
        self.state().stage
    }

    /// Every stage entered so far, starting with `Created`.
    pub fn history(&self) -> Vec<Stage> {
        self.state().history.clone()
    }

    pub fn join_result(&self) -> Option<JoinResult> {
        self.state().join_result.clone()
    }

    pub fn translation_report(&self) -> Option<TranslationReport> {
        self.state().translation.clone()
    }

    pub fn apply_report(&self) -> Option<ApplyReport> {
        self.state().apply.clone()
    }

    /// Handle to the overlay session, once the network stage created it.
    pub fn overlay_handle(&self) -> Option<OverlayHandle> {
        self.session().as_ref().map(|c| c.handle().clone())
    }

    /// The bound overlay listen address, once the network stage ran.
    pub fn overlay_addr(&self) -> Option<SocketAddr> {
        self.session().as_ref().map(|c| c.local_addr())
    }

    /// Peers currently connected to this agent.
    pub fn connected_peers(&self) -> BTreeSet<String> {
        self.overlay_handle()
            .map(|h| h.connected_peers())
            .unwrap_or_default()
    }

    /// Run the role's start sequence through to `Running`.
    ///
    /// On error the agent is stopped and the error returned.
    pub async fn start(&self) -> Result<(), AgentError> {
        {
            let mut state = self.state();
            if state.stage != Stage::Created {
                return Err(AgentError::InvalidState(state.stage));
            }
            state.is_running = true;
            state.started_at = Some(Utc::now());
        }

        info!(agent_id = %self.config.agent_id, role = %self.config.role, "Starting swarm agent");

        match self.run_pipeline().await {
            Ok(()) => {
                info!(agent_id = %self.config.agent_id, "Swarm agent running");
                Ok(())
            }
            Err(e) => {
                error!(
                    agent_id = %self.config.agent_id,
                    stage = %self.stage(),
                    reason = e.reason_code(),
                    error = %e,
                    "Error starting swarm agent"
                );
                self.stop();
                Err(e)
            }
        }
    }

    /// Stop the agent and close the overlay session. Idempotent.
    pub fn stop(&self) {
        let first = {
            let mut state = self.state();
            if state.stage.is_terminal() {
                false
            } else {
                state.is_running = false;
                state.stage = Stage::Stopped;
                state.history.push(Stage::Stopped);
                true
            }
        };
        if first {
            info!(agent_id = %self.config.agent_id, "Stopping swarm agent");
        }

        // A session created after an earlier stop is closed here too.
        let session = self.session().take();
        if let Some(coordinator) = session {
            coordinator.shutdown();
        }
    }

    async fn run_pipeline(&self) -> Result<(), AgentError> {
        for &stage in pipeline(self.config.role) {
            self.enter(stage)?;
            match stage {
                Stage::Initializing => self.print_config(),
                Stage::NetworkJoining => self.initialise_network().await?,
                Stage::ProcessingTopology => self.process_topology(),
                Stage::RequestingResources => self.request_resources().await?,
                Stage::Broadcasting => self.broadcast_topology(),
                Stage::TranslatingTopology => self.translate_topology()?,
                Stage::Deploying => self.deploy_application().await,
                Stage::Running | Stage::Created | Stage::Stopped => {}
            }
        }
        Ok(())
    }

    fn enter(&self, stage: Stage) -> Result<(), AgentError> {
        let mut state = self.state();
        if !state.is_running {
            return Err(AgentError::Stopped);
        }
        state.stage = stage;
        state.history.push(stage);
        drop(state);

        info!(agent_id = %self.config.agent_id, stage = %stage, "Entering stage");
        Ok(())
    }

    fn print_config(&self) {
        let c = &self.config;
        info!(
            agent_id = %c.agent_id,
            universe_id = %c.universe_id,
            api = %join_host_port(&c.api_ip, c.api_port),
            p2p_public = %join_host_port(&c.p2p_public_ip, c.p2p_public_port),
            p2p_listen = %join_host_port(&c.p2p_listen_ip, c.p2p_listen_port),
            application_id = %c.application_id,
            resource_id = %c.resource_id,
            role = %c.role,
            "Swarm agent configuration"
        );
    }

    /// Create the overlay session, register handlers, then join.
    async fn initialise_network(&self) -> Result<(), AgentError> {
        let c = &self.config;
        info!(listen = %join_host_port(&c.p2p_listen_ip, c.p2p_listen_port), "Setting up overlay session");

        let peer = PeerConfig::new(
            c.agent_id.clone(),
            &c.p2p_listen_ip,
            c.p2p_listen_port,
            &c.p2p_public_ip,
            c.p2p_public_port,
        )
        .with_metadata("peer_type", c.role.as_str())
        .with_metadata("appid", c.application_id.clone());

        let overlay = Overlay::new(peer).map_err(|e| {
            error!(error = %e, "Failed to initialise overlay session");
            AgentError::NetworkInit(e)
        })?;
        info!(listen = %overlay.local_addr(), public = %overlay.config().public_addr, "Overlay session bound");

        // Handlers must be in place before the reactor delivers anything.
        let router = MessageRouter::with_core_handlers(Arc::new(overlay.handle()));
        info!(tags = ?router.tags(), "Registered message handlers");

        let coordinator = Arc::new(JoinCoordinator::new(
            overlay,
            Arc::new(router),
            c.join_timeout,
        ));
        *self.session() = Some(Arc::clone(&coordinator));

        // Reactor start failure is fatal, unlike a failed join.
        coordinator.ensure_started()?;

        let result = coordinator.join(&c.bootstrap_ip, c.bootstrap_port).await;
        if c.role.is_leader() {
            info!(joined = result.is_success(), "Leader joined overlay");
            info!(
                connected = coordinator.handle().connected_peers().len(),
                "Connected peers"
            );
        } else {
            info!(agent_id = %c.agent_id, joined = result.is_success(), "Worker joined overlay");
        }
        if let JoinResult::Failure(reason) = &result {
            warn!(reason = %reason, "Join failed, continuing degraded");
        }

        self.state().join_result = Some(result);
        Ok(())
    }

    fn process_topology(&self) {
        let api = join_host_port(&self.config.api_ip, self.config.api_port);
        info!(api = %api, "Initialising resource authority API connection");
        info!(api = %api, "Resource authority API ready");
    }

    /// Send the resource request to the authority. Send errors are fatal.
    async fn request_resources(&self) -> Result<(), AgentError> {
        let to = self.config.authority_id.as_str();
        let tag = messages::MSG_RESOURCE_REQUEST;
        info!(authority = %to, cpu = %self.config.resource_request.cpu, "Sending resource request");

        let sent = match self.overlay_handle() {
            Some(handle) => {
                handle
                    .send(to, tag, messages::resource_request(&self.config.resource_request))
                    .await
            }
            None => Err(OverlayError::NotRunning),
        };

        sent.map_err(|source| {
            error!(authority = %to, error = %source, "Sending resource request failed");
            AgentError::Send {
                tag: tag.to_string(),
                to: to.to_string(),
                source,
            }
        })?;

        info!(authority = %to, "Resource request sent");
        Ok(())
    }

    fn broadcast_topology(&self) {
        info!(
            topology = %self.topology_path.display(),
            peers = self.connected_peers().len(),
            "Broadcasting topology to workers"
        );
        info!("Topology broadcast complete");
    }

    fn translate_topology(&self) -> Result<(), AgentError> {
        let options = TranslateOptions {
            deployment_namespace: self.config.deployment_namespace.clone(),
            namespace: self.config.namespace.clone(),
            stage_all_kinds: self.config.stage_all_kinds,
        };
        let report = translate::translate(
            self.converter.as_ref(),
            &self.topology_path,
            &self.staging_dir,
            &options,
        )?;
        self.state().translation = Some(report);
        Ok(())
    }

    async fn deploy_application(&self) {
        info!(
            application_id = %self.config.application_id,
            resource_id = %self.config.resource_id,
            "Initialising application"
        );

        match deploy::apply_all(
            self.orchestrator.as_ref(),
            &self.staging_dir,
            &self.config.namespace,
        )
        .await
        {
            Ok(report) => {
                if !report.is_complete() {
                    warn!(failed = report.failed.len(), "Application partially deployed");
                }
                self.state().apply = Some(report);
            }
            Err(e) => error!(reason = e.reason_code(), error = %e, "Deployment failed"),
        }
    }

    fn state(&self) -> MutexGuard<'_, AgentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self) -> MutexGuard<'_, Option<Arc<JoinCoordinator>>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("agent_id", &self.config.agent_id)
            .field("role", &self.config.role)
            .field("stage", &self.stage())
            .field("staging_dir", &self.staging_dir)
            .finish()
    }
}
