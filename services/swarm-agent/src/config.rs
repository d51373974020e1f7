//! Configuration for the swarm agent.
//!
//! The config file is a flat YAML mapping. Required keys are checked all at
//! once so that a single error names every missing or empty key.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use serde_yaml::{Mapping, Value};
use thiserror::Error;

/// Keys that must be present and non-empty.
pub const REQUIRED_KEYS: [&str; 12] = [
    "SA_id",
    "password",
    "universe_id",
    "api_ip",
    "api_port",
    "p2p_public_ip",
    "p2p_listen_ip",
    "p2p_public_port",
    "p2p_listen_port",
    "app_id",
    "resource_id",
    "SA_role",
];

pub const DEFAULT_AUTHORITY_ID: &str = "wmin.ac.uk";
pub const DEFAULT_CPU_REQUEST: &str = "2";
pub const DEFAULT_DEPLOYMENT_NAMESPACE: &str = "swarm-system";
pub const DEFAULT_NAMESPACE: &str = "demo";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config is not a YAML mapping: {0}")]
    Parse(String),

    #[error("incomplete config: missing [{}], empty [{}]", missing.join(", "), empty.join(", "))]
    Incomplete {
        missing: Vec<String>,
        empty: Vec<String>,
    },

    #[error("invalid port for {key}: {value:?}")]
    InvalidPort { key: String, value: String },

    #[error("invalid role {0:?}, expected leader or worker")]
    InvalidRole(String),

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Agent role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Lead swarm agent: also requests resources and fans out topology.
    Leader,
    Worker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Leader => "leader",
            Role::Worker => "worker",
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "leader" => Ok(Role::Leader),
            "worker" => Ok(Role::Worker),
            _ => Err(ConfigError::InvalidRole(s.to_string())),
        }
    }
}

/// A secret string that never prints its value.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The underlying value. Do not log it.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Resource descriptor sent to the authority by the leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub cpu: String,
    pub memory: Option<String>,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            cpu: DEFAULT_CPU_REQUEST.to_string(),
            memory: None,
        }
    }
}

/// Swarm agent configuration. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_id: String,
    pub password: Secret,
    pub universe_id: String,
    pub application_id: String,
    pub resource_id: String,

    /// Resource-authority API endpoint.
    pub api_ip: String,
    pub api_port: u16,

    pub p2p_public_ip: String,
    pub p2p_public_port: u16,
    pub p2p_listen_ip: String,
    pub p2p_listen_port: u16,

    pub role: Role,

    /// Peer id of the resource authority.
    pub authority_id: String,
    pub resource_request: ResourceRequest,

    /// Namespace written into deployment manifests.
    pub deployment_namespace: String,

    /// Namespace for the other manifest kinds and the apply fallback.
    pub namespace: String,

    /// Persist service, claim and config map manifests to staging too.
    pub stage_all_kinds: bool,

    /// Upper bound on the join handshake; `None` waits indefinitely.
    pub join_timeout: Option<Duration>,

    /// Rendezvous address used for the join.
    pub bootstrap_ip: String,
    pub bootstrap_port: u16,
}

impl AgentConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Parse and validate config text.
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let doc: Value =
            serde_yaml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let map = match doc {
            Value::Mapping(map) => map,
            Value::Null => Mapping::new(),
            other => return Err(ConfigError::Parse(format!("found {}", kind_of(&other)))),
        };

        let mut missing = Vec::new();
        let mut empty = Vec::new();
        for key in REQUIRED_KEYS {
            match scalar(&map, key)? {
                None => missing.push(key.to_string()),
                Some(v) if v.trim().is_empty() => empty.push(key.to_string()),
                Some(_) => {}
            }
        }
        if !missing.is_empty() || !empty.is_empty() {
            return Err(ConfigError::Incomplete { missing, empty });
        }

        let required = |key: &str| -> Result<String, ConfigError> {
            Ok(scalar(&map, key)?.unwrap_or_default().trim().to_string())
        };

        let p2p_public_ip = required("p2p_public_ip")?;
        let p2p_public_port = port(&map, "p2p_public_port")?;

        let bootstrap_ip = optional(&map, "bootstrap_ip")?.unwrap_or_else(|| p2p_public_ip.clone());
        let bootstrap_port = match optional(&map, "bootstrap_port")? {
            Some(_) => port(&map, "bootstrap_port")?,
            None => p2p_public_port,
        };

        let join_timeout = match optional(&map, "join_timeout_secs")? {
            Some(raw) => {
                let secs: u64 = raw.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "join_timeout_secs".to_string(),
                    reason: format!("{raw:?} is not a whole number of seconds"),
                })?;
                Some(Duration::from_secs(secs))
            }
            None => None,
        };

        let stage_all_kinds = match map.get("stage_all_kinds") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "stage_all_kinds".to_string(),
                    reason: format!("expected a boolean, found {}", kind_of(other)),
                })
            }
        };

        Ok(Self {
            agent_id: required("SA_id")?,
            password: Secret::new(required("password")?),
            universe_id: required("universe_id")?,
            application_id: required("app_id")?,
            resource_id: required("resource_id")?,
            api_ip: required("api_ip")?,
            api_port: port(&map, "api_port")?,
            p2p_public_ip,
            p2p_public_port,
            p2p_listen_ip: required("p2p_listen_ip")?,
            p2p_listen_port: port(&map, "p2p_listen_port")?,
            role: required("SA_role")?.parse()?,
            authority_id: optional(&map, "authority_id")?
                .unwrap_or_else(|| DEFAULT_AUTHORITY_ID.to_string()),
            resource_request: resource_request(&map)?,
            deployment_namespace: optional(&map, "deployment_namespace")?
                .unwrap_or_else(|| DEFAULT_DEPLOYMENT_NAMESPACE.to_string()),
            namespace: optional(&map, "namespace")?
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            stage_all_kinds,
            join_timeout,
            bootstrap_ip,
            bootstrap_port,
        })
    }
}

/// Read a scalar as text. `None` when absent; null reads as empty.
fn scalar(map: &Mapping, key: &str) -> Result<Option<String>, ConfigError> {
    match map.get(key) {
        None => Ok(None),
        Some(Value::Null) => Ok(Some(String::new())),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("expected a scalar, found {}", kind_of(other)),
        }),
    }
}

/// An optional scalar; empty counts as absent.
fn optional(map: &Mapping, key: &str) -> Result<Option<String>, ConfigError> {
    Ok(scalar(map, key)?
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty()))
}

fn port(map: &Mapping, key: &str) -> Result<u16, ConfigError> {
    let raw = scalar(map, key)?.unwrap_or_default();
    raw.trim().parse().map_err(|_| ConfigError::InvalidPort {
        key: key.to_string(),
        value: raw,
    })
}

fn resource_request(map: &Mapping) -> Result<ResourceRequest, ConfigError> {
    match map.get("resource_request") {
        None | Some(Value::Null) => Ok(ResourceRequest::default()),
        Some(Value::Mapping(fields)) => Ok(ResourceRequest {
            cpu: optional(fields, "cpu")?.unwrap_or_else(|| DEFAULT_CPU_REQUEST.to_string()),
            memory: optional(fields, "memory")?,
        }),
        Some(other) => Err(ConfigError::InvalidValue {
            key: "resource_request".to_string(),
            reason: format!("expected a mapping, found {}", kind_of(other)),
        }),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const VALID: &str = r#"
SA_id: sa-leader
password: hunter2
universe_id: uni-1
api_ip: 10.0.0.5
api_port: 8080
p2p_public_ip: 203.0.113.7
p2p_public_port: 9000
p2p_listen_ip: 0.0.0.0
p2p_listen_port: "9000"
app_id: app-42
resource_id: res-7
SA_role: Leader
"#;

    #[test]
    fn test_load_valid_config() {
        let config = AgentConfig::from_yaml_str(VALID).unwrap();
        assert_eq!(config.agent_id, "sa-leader");
        assert_eq!(config.role, Role::Leader);
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.p2p_listen_port, 9000);
        assert_eq!(config.password.expose(), "hunter2");

        // Defaults
        assert_eq!(config.authority_id, DEFAULT_AUTHORITY_ID);
        assert_eq!(config.resource_request, ResourceRequest::default());
        assert_eq!(config.deployment_namespace, "swarm-system");
        assert_eq!(config.namespace, "demo");
        assert!(!config.stage_all_kinds);
        assert!(config.join_timeout.is_none());
        assert_eq!(config.bootstrap_ip, "203.0.113.7");
        assert_eq!(config.bootstrap_port, 9000);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, VALID).unwrap();
        assert_eq!(AgentConfig::load(&path).unwrap().universe_id, "uni-1");

        let missing = dir.path().join("absent.yaml");
        assert!(matches!(
            AgentConfig::load(&missing),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_password_is_redacted() {
        let config = AgentConfig::from_yaml_str(VALID).unwrap();
        let printed = format!("{:?}", config);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("***"));
        assert_eq!(config.password.to_string(), "***");
    }

    #[test]
    fn test_reports_every_missing_and_empty_key() {
        let yaml = VALID
            .replace("universe_id: uni-1\n", "")
            .replace("resource_id: res-7\n", "")
            .replace("app_id: app-42", "app_id: \"\"");
        match AgentConfig::from_yaml_str(&yaml) {
            Err(ConfigError::Incomplete { missing, empty }) => {
                assert_eq!(missing, ["universe_id", "resource_id"]);
                assert_eq!(empty, ["app_id"]);
            }
            other => panic!("expected Incomplete, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_document_misses_everything() {
        match AgentConfig::from_yaml_str("") {
            Err(ConfigError::Incomplete { missing, .. }) => {
                assert_eq!(missing.len(), REQUIRED_KEYS.len())
            }
            other => panic!("expected Incomplete, got {:?}", other),
        }
    }

    #[rstest]
    #[case("leader", Role::Leader)]
    #[case("LEADER", Role::Leader)]
    #[case("Worker", Role::Worker)]
    #[case(" worker ", Role::Worker)]
    fn test_role_parsing(#[case] raw: &str, #[case] expected: Role) {
        assert_eq!(raw.parse::<Role>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_role_rejected() {
        let yaml = VALID.replace("SA_role: Leader", "SA_role: observer");
        assert!(matches!(
            AgentConfig::from_yaml_str(&yaml),
            Err(ConfigError::InvalidRole(_))
        ));
    }

    #[rstest]
    #[case("api_port: 8080", "api_port: http")]
    #[case("p2p_public_port: 9000", "p2p_public_port: 70000")]
    fn test_invalid_port_rejected(#[case] from: &str, #[case] to: &str) {
        let yaml = VALID.replace(from, to);
        assert!(matches!(
            AgentConfig::from_yaml_str(&yaml),
            Err(ConfigError::InvalidPort { .. })
        ));
    }

    #[test]
    fn test_optional_keys() {
        let yaml = format!(
            "{}{}",
            VALID,
            r#"
authority_id: authority.example
resource_request:
  cpu: 4
  memory: 8Gi
deployment_namespace: apps
namespace: shop
stage_all_kinds: true
join_timeout_secs: 15
bootstrap_ip: 198.51.100.1
bootstrap_port: 9100
"#
        );
        let config = AgentConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(config.authority_id, "authority.example");
        assert_eq!(config.resource_request.cpu, "4");
        assert_eq!(config.resource_request.memory.as_deref(), Some("8Gi"));
        assert_eq!(config.deployment_namespace, "apps");
        assert_eq!(config.namespace, "shop");
        assert!(config.stage_all_kinds);
        assert_eq!(config.join_timeout, Some(Duration::from_secs(15)));
        assert_eq!(config.bootstrap_ip, "198.51.100.1");
        assert_eq!(config.bootstrap_port, 9100);
    }

    #[test]
    fn test_non_mapping_document_rejected() {
        assert!(matches!(
            AgentConfig::from_yaml_str("- a\n- b\n"),
            Err(ConfigError::Parse(_))
        ));
    }
}
