//! Topology descriptions and their orchestrator manifests.
//!
//! This library provides:
//! - A parser for the TOSCA simple-profile subset used to describe an
//!   application ([`parse_tosca`])
//! - Per-kind converters from node templates to Kubernetes-style manifests
//!   (deployment, service, persistent volume claims, config map)
//! - The [`ManifestConverter`] seam that agents call through
//!
//! Conversions are total: a node that cannot produce a given kind yields
//! `None` (or an empty list), never an error.

use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

pub mod convert;
pub mod tosca;

pub use convert::ToscaConverter;
pub use tosca::{parse_tosca, parse_tosca_str, NodeTemplate, ServiceTemplate};

/// Topology errors.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// The topology file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The topology file is not valid YAML or has the wrong shape.
    #[error("invalid topology document: {0}")]
    Parse(String),

    /// The document has no `topology_template.node_templates`.
    #[error("topology has no node templates")]
    MissingNodeTemplates,

    /// A node template is malformed.
    #[error("invalid node template {name}: {reason}")]
    InvalidNode { name: String, reason: String },

    /// A manifest could not be rendered.
    #[error("failed to render manifest: {0}")]
    Render(String),
}

impl From<serde_yaml::Error> for TopologyError {
    fn from(err: serde_yaml::Error) -> Self {
        TopologyError::Parse(err.to_string())
    }
}

/// One orchestrator resource document.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest(Value);

impl Manifest {
    /// Wrap a JSON value as a manifest.
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Resource kind (`Deployment`, `Service`, ...).
    pub fn kind(&self) -> &str {
        self.0.get("kind").and_then(Value::as_str).unwrap_or("")
    }

    /// `metadata.name`.
    pub fn name(&self) -> &str {
        self.0
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    /// `metadata.namespace`, if set.
    pub fn namespace(&self) -> Option<&str> {
        self.0.pointer("/metadata/namespace").and_then(Value::as_str)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Render as a YAML document.
    pub fn to_yaml(&self) -> Result<String, TopologyError> {
        serde_yaml::to_string(&self.0).map_err(|e| TopologyError::Render(e.to_string()))
    }
}

/// Turns a topology description into manifests.
///
/// Each conversion may decline a node; declining is not an error.
pub trait ManifestConverter: Send + Sync {
    /// Parse the topology file into node templates, in document order.
    fn parse(&self, path: &Path) -> Result<ServiceTemplate, TopologyError>;

    fn to_deployment(&self, node: &NodeTemplate, namespace: &str) -> Option<Manifest>;

    fn to_service(&self, node: &NodeTemplate, namespace: &str) -> Option<Manifest>;

    fn to_pvcs(&self, node: &NodeTemplate, namespace: &str) -> Vec<Manifest>;

    fn to_config_map(&self, node: &NodeTemplate, namespace: &str) -> Option<Manifest>;
}

/// Normalize a name to a DNS-1123 label.
///
/// Lowercases, maps anything outside `[a-z0-9-]` to `-`, and trims leading
/// and trailing dashes.
pub fn dns_label(name: &str) -> String {
    let mapped: String = name
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    mapped.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dns_label() {
        assert_eq!(dns_label("Web_Frontend"), "web-frontend");
        assert_eq!(dns_label("  db "), "db");
        assert_eq!(dns_label("api.v2"), "api-v2");
    }

    #[test]
    fn test_manifest_accessors() {
        let manifest = Manifest::new(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "web", "namespace": "demo"}
        }));
        assert_eq!(manifest.kind(), "Service");
        assert_eq!(manifest.name(), "web");
        assert_eq!(manifest.namespace(), Some("demo"));

        let yaml = manifest.to_yaml().unwrap();
        assert!(yaml.contains("kind: Service"));
    }
}
