//! Node template to manifest conversion.
//!
//! Recognized node properties:
//!
//! | property    | used for                                             |
//! |-------------|------------------------------------------------------|
//! | `image`     | container image (falls back to an image artifact)    |
//! | `replicas`  | deployment replica count (default 1)                 |
//! | `command`   | container entrypoint                                 |
//! | `args`      | container arguments                                  |
//! | `env`       | container environment                                |
//! | `port(s)`   | container ports and the service                      |
//! | `resources` | container resource requests                          |
//! | `volumes`   | mounts and persistent volume claims                  |
//! | `config`    | config map, injected into the container via envFrom  |

use std::path::Path;

use serde_json::{json, Map, Value};

use crate::tosca::{parse_tosca, NodeTemplate, ServiceTemplate};
use crate::{dns_label, Manifest, ManifestConverter, TopologyError};

const DEFAULT_ACCESS_MODE: &str = "ReadWriteOnce";
const DEFAULT_PROTOCOL: &str = "TCP";

/// Converter for the TOSCA container subset.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToscaConverter;

impl ToscaConverter {
    pub fn new() -> Self {
        Self
    }
}

impl ManifestConverter for ToscaConverter {
    fn parse(&self, path: &Path) -> Result<ServiceTemplate, TopologyError> {
        parse_tosca(path)
    }

    fn to_deployment(&self, node: &NodeTemplate, namespace: &str) -> Option<Manifest> {
        deployment(node, namespace)
    }

    fn to_service(&self, node: &NodeTemplate, namespace: &str) -> Option<Manifest> {
        service(node, namespace)
    }

    fn to_pvcs(&self, node: &NodeTemplate, namespace: &str) -> Vec<Manifest> {
        persistent_volume_claims(node, namespace)
    }

    fn to_config_map(&self, node: &NodeTemplate, namespace: &str) -> Option<Manifest> {
        config_map(node, namespace)
    }
}

/// Deployment for a node; `None` when the node has no image.
pub fn deployment(node: &NodeTemplate, namespace: &str) -> Option<Manifest> {
    let image = image(node)?;
    let app = dns_label(&node.name);

    let mut container = Map::new();
    container.insert("name".into(), json!(app));
    container.insert("image".into(), json!(image));

    if let Some(command) = string_list(node.property("command")) {
        container.insert("command".into(), json!(command));
    }
    if let Some(args) = string_list(node.property("args")) {
        container.insert("args".into(), json!(args));
    }

    let ports = ports(node);
    if !ports.is_empty() {
        let container_ports: Vec<Value> = ports
            .iter()
            .map(|p| {
                let mut entry = json!({
                    "containerPort": p.target_port,
                    "protocol": p.protocol,
                });
                if let Some(name) = &p.name {
                    entry["name"] = json!(name);
                }
                entry
            })
            .collect();
        container.insert("ports".into(), Value::Array(container_ports));
    }

    let env = env(node);
    if !env.is_empty() {
        container.insert("env".into(), Value::Array(env));
    }

    if config_data(node).is_some() {
        container.insert(
            "envFrom".into(),
            json!([{ "configMapRef": { "name": config_map_name(node) } }]),
        );
    }

    if let Some(requests) = resource_requests(node) {
        container.insert("resources".into(), json!({ "requests": requests }));
    }

    let volumes = volumes(node);
    let mounts: Vec<Value> = volumes
        .iter()
        .filter_map(|v| {
            v.mount_path
                .as_ref()
                .map(|path| json!({ "name": v.name, "mountPath": path }))
        })
        .collect();
    if !mounts.is_empty() {
        container.insert("volumeMounts".into(), Value::Array(mounts));
    }

    let mut pod_spec = json!({ "containers": [Value::Object(container)] });
    if !volumes.is_empty() {
        let pod_volumes: Vec<Value> = volumes
            .iter()
            .map(|v| {
                if v.size.is_some() {
                    json!({
                        "name": v.name,
                        "persistentVolumeClaim": { "claimName": pvc_name(node, &v.name) },
                    })
                } else {
                    json!({ "name": v.name, "emptyDir": {} })
                }
            })
            .collect();
        pod_spec["volumes"] = Value::Array(pod_volumes);
    }

    Some(Manifest::new(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": metadata(&app, namespace, &app),
        "spec": {
            "replicas": replicas(node),
            "selector": { "matchLabels": { "app": app } },
            "template": {
                "metadata": { "labels": { "app": app } },
                "spec": pod_spec,
            },
        },
    })))
}

/// Service for a node; `None` when the node exposes no ports.
pub fn service(node: &NodeTemplate, namespace: &str) -> Option<Manifest> {
    let ports = ports(node);
    if ports.is_empty() {
        return None;
    }
    let app = dns_label(&node.name);

    let service_ports: Vec<Value> = ports
        .iter()
        .map(|p| {
            let mut entry = json!({
                "port": p.port,
                "targetPort": p.target_port,
                "protocol": p.protocol,
            });
            if let Some(name) = &p.name {
                entry["name"] = json!(name);
            }
            entry
        })
        .collect();

    Some(Manifest::new(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": metadata(&app, namespace, &app),
        "spec": {
            "selector": { "app": app },
            "ports": service_ports,
        },
    })))
}

/// One claim per sized volume, named `<node>-<volume>`.
pub fn persistent_volume_claims(node: &NodeTemplate, namespace: &str) -> Vec<Manifest> {
    let app = dns_label(&node.name);

    volumes(node)
        .into_iter()
        .filter_map(|v| {
            let size = v.size?;
            let mut spec = json!({
                "accessModes": [v.access_mode],
                "resources": { "requests": { "storage": size } },
            });
            if let Some(class) = v.storage_class {
                spec["storageClassName"] = json!(class);
            }
            Some(Manifest::new(json!({
                "apiVersion": "v1",
                "kind": "PersistentVolumeClaim",
                "metadata": metadata(&pvc_name(node, &v.name), namespace, &app),
                "spec": spec,
            })))
        })
        .collect()
}

/// Config map named `<node>-config`; `None` when the node has no config.
pub fn config_map(node: &NodeTemplate, namespace: &str) -> Option<Manifest> {
    let data = config_data(node)?;
    let app = dns_label(&node.name);

    Some(Manifest::new(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": metadata(&config_map_name(node), namespace, &app),
        "data": data,
    })))
}

fn metadata(name: &str, namespace: &str, app: &str) -> Value {
    json!({
        "name": name,
        "namespace": namespace,
        "labels": { "app": app },
    })
}

fn config_map_name(node: &NodeTemplate) -> String {
    format!("{}-config", dns_label(&node.name))
}

fn pvc_name(node: &NodeTemplate, volume: &str) -> String {
    format!("{}-{}", dns_label(&node.name), dns_label(volume))
}

/// The container image, from `properties.image` or an image artifact.
fn image(node: &NodeTemplate) -> Option<String> {
    if let Some(image) = node.property_str("image").filter(|s| !s.trim().is_empty()) {
        return Some(image.to_string());
    }

    node.artifacts.iter().find_map(|(name, artifact)| match artifact {
        Value::String(file) if name == "image" => Some(file.clone()),
        Value::Object(fields) => {
            let is_image = fields
                .get("type")
                .and_then(Value::as_str)
                .map(|t| t.contains("Docker") || t.contains("Image"))
                .unwrap_or(name == "image");
            if is_image {
                fields.get("file").and_then(Value::as_str).map(str::to_string)
            } else {
                None
            }
        }
        _ => None,
    })
}

fn replicas(node: &NodeTemplate) -> u64 {
    node.property("replicas").and_then(as_u64).unwrap_or(1)
}

#[derive(Debug, Clone, PartialEq)]
struct PortSpec {
    port: u64,
    target_port: u64,
    protocol: String,
    name: Option<String>,
}

/// Ports from `ports` (list of ints or objects) or a single `port`.
fn ports(node: &NodeTemplate) -> Vec<PortSpec> {
    let entries: Vec<&Value> = match (node.property("ports"), node.property("port")) {
        (Some(Value::Array(list)), _) => list.iter().collect(),
        (None, Some(single)) => vec![single],
        _ => Vec::new(),
    };

    entries
        .into_iter()
        .filter_map(|entry| match entry {
            Value::Object(fields) => {
                let port = fields.get("port").and_then(as_u64)?;
                let target_port = fields.get("target_port").and_then(as_u64).unwrap_or(port);
                Some(PortSpec {
                    port,
                    target_port,
                    protocol: fields
                        .get("protocol")
                        .and_then(Value::as_str)
                        .map(str::to_uppercase)
                        .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
                    name: fields.get("name").and_then(Value::as_str).map(dns_label),
                })
            }
            other => as_u64(other).map(|port| PortSpec {
                port,
                target_port: port,
                protocol: DEFAULT_PROTOCOL.to_string(),
                name: None,
            }),
        })
        .collect()
}

fn env(node: &NodeTemplate) -> Vec<Value> {
    match node.property("env") {
        Some(Value::Object(vars)) => vars
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": scalar_string(value) }))
            .collect(),
        _ => Vec::new(),
    }
}

fn resource_requests(node: &NodeTemplate) -> Option<Map<String, Value>> {
    let fields = node.property("resources")?.as_object()?;
    let mut requests = Map::new();
    for key in ["cpu", "memory"] {
        if let Some(value) = fields.get(key) {
            requests.insert(key.to_string(), json!(scalar_string(value)));
        }
    }
    (!requests.is_empty()).then_some(requests)
}

#[derive(Debug, Clone, PartialEq)]
struct VolumeSpec {
    name: String,
    mount_path: Option<String>,
    size: Option<String>,
    access_mode: String,
    storage_class: Option<String>,
}

fn volumes(node: &NodeTemplate) -> Vec<VolumeSpec> {
    let Some(Value::Array(list)) = node.property("volumes") else {
        return Vec::new();
    };

    list.iter()
        .filter_map(Value::as_object)
        .filter_map(|fields| {
            let name = fields.get("name").and_then(Value::as_str).map(dns_label)?;
            Some(VolumeSpec {
                name,
                mount_path: fields
                    .get("mount_path")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                size: fields.get("size").map(scalar_string),
                access_mode: fields
                    .get("access_mode")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_ACCESS_MODE)
                    .to_string(),
                storage_class: fields
                    .get("storage_class")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
        })
        .collect()
}

fn config_data(node: &NodeTemplate) -> Option<Map<String, Value>> {
    let fields = node.property("config")?.as_object()?;
    if fields.is_empty() {
        return None;
    }
    Some(
        fields
            .iter()
            .map(|(k, v)| (k.clone(), json!(scalar_string(v))))
            .collect(),
    )
}

fn string_list(value: Option<&Value>) -> Option<Vec<String>> {
    match value? {
        Value::Array(items) if !items.is_empty() => Some(items.iter().map(scalar_string).collect()),
        Value::String(s) if !s.is_empty() => Some(vec![s.clone()]),
        _ => None,
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
