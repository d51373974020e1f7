//! Swarm Agent Library
//!
//! The swarm agent runs next to a cluster node. It joins the peer overlay,
//! answers peer state queries, and turns the application topology into
//! orchestrator manifests that it stages and applies. A leader agent also
//! requests resources from the authority before deploying.
//!
//! ## Architecture
//!
//! ```text
//! Agent (role state machine)
//! ├── JoinCoordinator   (overlay reactor launch + join handshake)
//! │   └── MessageRouter (tag -> handler, runs on the reactor thread)
//! ├── translate         (topology -> staged manifests)
//! └── deploy            (staged manifests -> Orchestrator)
//! ```
//!
//! ## Modules
//!
//! - `agent`: lifecycle and status
//! - `config`: YAML configuration loading and validation
//! - `join`: join coordinator
//! - `router`: message handler table
//! - `orchestrator`: Kubernetes client and mock

pub mod agent;
pub mod config;
pub mod deploy;
pub mod error;
pub mod join;
pub mod lifecycle;
pub mod logging;
pub mod messages;
pub mod orchestrator;
pub mod router;
pub mod status;
pub mod translate;

// Re-export commonly used types
pub use agent::{Agent, AgentStatus};
pub use config::{AgentConfig, ConfigError, Role};
pub use error::AgentError;
pub use join::{JoinCoordinator, JoinResult};
pub use lifecycle::Stage;
pub use orchestrator::{KubeClient, MockOrchestrator, Orchestrator};
pub use router::{MessageRouter, Outbox};
