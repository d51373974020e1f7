//! TOSCA service-template parsing.
//!
//! Only the parts of the simple profile that drive manifest generation are
//! read: node template names, types, properties, artifacts and
//! requirements. Everything else in the document is ignored.

use std::path::Path;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::TopologyError;

/// A parsed service template.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceTemplate {
    /// `tosca_definitions_version`, when present.
    pub definitions_version: Option<String>,

    /// Node templates in document order.
    pub node_templates: Vec<NodeTemplate>,
}

/// One node template.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeTemplate {
    pub name: String,
    pub node_type: String,
    pub properties: Map<String, Value>,
    pub artifacts: Map<String, Value>,
    pub requirements: Vec<Value>,
}

impl NodeTemplate {
    /// Create a node with no properties.
    pub fn new(name: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            node_type: node_type.into(),
            properties: Map::new(),
            artifacts: Map::new(),
            requirements: Vec::new(),
        }
    }

    /// Set one property.
    pub fn with_property(mut self, key: &str, value: Value) -> Self {
        self.properties.insert(key.to_string(), value);
        self
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }
}

#[derive(Deserialize)]
struct RawServiceTemplate {
    #[serde(default)]
    tosca_definitions_version: Option<String>,
    #[serde(default)]
    topology_template: Option<RawTopologyTemplate>,
}

#[derive(Deserialize)]
struct RawTopologyTemplate {
    #[serde(default)]
    node_templates: Option<serde_yaml::Mapping>,
}

#[derive(Deserialize)]
struct RawNodeTemplate {
    #[serde(rename = "type", default)]
    node_type: String,
    #[serde(default)]
    properties: Option<Map<String, Value>>,
    #[serde(default)]
    artifacts: Option<Map<String, Value>>,
    #[serde(default)]
    requirements: Option<Vec<Value>>,
}

/// Parse a TOSCA service template from a file.
pub fn parse_tosca(path: &Path) -> Result<ServiceTemplate, TopologyError> {
    let contents = std::fs::read_to_string(path).map_err(|source| TopologyError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_tosca_str(&contents)
}

/// Parse a TOSCA service template from YAML text.
pub fn parse_tosca_str(contents: &str) -> Result<ServiceTemplate, TopologyError> {
    let raw: RawServiceTemplate = serde_yaml::from_str(contents)?;

    let mapping = raw
        .topology_template
        .and_then(|t| t.node_templates)
        .ok_or(TopologyError::MissingNodeTemplates)?;

    let mut node_templates = Vec::with_capacity(mapping.len());
    for (key, value) in mapping {
        let name = match key {
            serde_yaml::Value::String(s) => s,
            other => {
                return Err(TopologyError::Parse(format!(
                    "node template name must be a string, got {:?}",
                    other
                )))
            }
        };

        let node: RawNodeTemplate =
            serde_yaml::from_value(value).map_err(|e| TopologyError::InvalidNode {
                name: name.clone(),
                reason: e.to_string(),
            })?;

        node_templates.push(NodeTemplate {
            name,
            node_type: node.node_type,
            properties: node.properties.unwrap_or_default(),
            artifacts: node.artifacts.unwrap_or_default(),
            requirements: node.requirements.unwrap_or_default(),
        });
    }

    Ok(ServiceTemplate {
        definitions_version: raw.tosca_definitions_version,
        node_templates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keeps_document_order() {
        let yaml = r#"
tosca_definitions_version: tosca_simple_yaml_1_3
topology_template:
  node_templates:
    zeta:
      type: tosca.nodes.Container.Application
      properties:
        image: nginx:1.25
    alpha:
      type: tosca.nodes.Root
"#;
        let template = parse_tosca_str(yaml).unwrap();
        assert_eq!(
            template.definitions_version.as_deref(),
            Some("tosca_simple_yaml_1_3")
        );
        let names: Vec<_> = template.node_templates.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["zeta", "alpha"]);
        assert_eq!(template.node_templates[0].property_str("image"), Some("nginx:1.25"));
        assert!(template.node_templates[1].properties.is_empty());
    }

    #[test]
    fn test_parse_requires_node_templates() {
        let yaml = "tosca_definitions_version: tosca_simple_yaml_1_3\n";
        assert!(matches!(
            parse_tosca_str(yaml),
            Err(TopologyError::MissingNodeTemplates)
        ));
    }

    #[test]
    fn test_parse_rejects_non_mapping_node() {
        let yaml = r#"
topology_template:
  node_templates:
    broken: [1, 2, 3]
"#;
        assert!(matches!(
            parse_tosca_str(yaml),
            Err(TopologyError::InvalidNode { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_invalid_yaml() {
        assert!(matches!(
            parse_tosca_str("topology_template: [unclosed"),
            Err(TopologyError::Parse(_))
        ));
    }
}
