//! Orchestrator API client interface and implementations.
//!
//! The orchestrator interface abstracts "create resources from a manifest
//! file". [`KubeClient`] talks to the Kubernetes API with in-cluster
//! service-account credentials; [`MockOrchestrator`] records calls for tests
//! and development.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use swarm_overlay::join_host_port;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

/// Service-account mount inside a pod.
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Kinds that live outside namespaces.
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "Node",
    "PersistentVolume",
    "StorageClass",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "PriorityClass",
];

/// Plurals that do not follow the suffix rules.
const IRREGULAR_PLURALS: &[(&str, &str)] = &[("endpoints", "endpoints")];

/// Orchestrator interface.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Create every document in the manifest file. Returns the number of
    /// documents created. `namespace` applies to documents without one.
    async fn apply_file(&self, path: &Path, namespace: &str) -> Result<usize>;
}

/// Load every document of a (possibly multi-document) manifest file.
///
/// Empty documents are skipped. Each remaining document must be a mapping
/// with string `apiVersion` and `kind`.
pub fn load_manifest_documents(path: &Path) -> Result<Vec<Value>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;

    let mut documents = Vec::new();
    for (index, document) in serde_yaml::Deserializer::from_str(&contents).enumerate() {
        let value = Value::deserialize(document)
            .with_context(|| format!("Invalid YAML in {} (document {})", path.display(), index))?;
        if value.is_null() {
            continue;
        }
        if !value.is_object() {
            bail!("Document {} in {} is not a mapping", index, path.display());
        }
        for field in ["apiVersion", "kind"] {
            if value.get(field).and_then(Value::as_str).is_none() {
                bail!(
                    "Document {} in {} has no {}",
                    index,
                    path.display(),
                    field
                );
            }
        }
        documents.push(value);
    }

    Ok(documents)
}

/// Collection URL path for a resource.
pub fn collection_path(api_version: &str, kind: &str, namespace: &str) -> String {
    let group = if api_version.contains('/') {
        format!("/apis/{}", api_version)
    } else {
        format!("/api/{}", api_version)
    };

    if CLUSTER_SCOPED_KINDS.contains(&kind) {
        format!("{}/{}", group, plural(kind))
    } else {
        format!("{}/namespaces/{}/{}", group, namespace, plural(kind))
    }
}

/// Resource plural for a kind (`Deployment` -> `deployments`).
pub fn plural(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if let Some((_, plural)) = IRREGULAR_PLURALS.iter().find(|(k, _)| *k == lower) {
        return plural.to_string();
    }

    if lower.ends_with('s') || lower.ends_with('x') || lower.ends_with("ch") {
        format!("{}es", lower)
    } else if let Some(stem) = lower.strip_suffix('y') {
        if stem.ends_with(['a', 'e', 'i', 'o', 'u']) {
            format!("{}s", lower)
        } else {
            format!("{}ies", stem)
        }
    } else {
        format!("{}s", lower)
    }
}

/// In-cluster connection details.
struct InCluster {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

/// Kubernetes API client using in-cluster credentials.
///
/// Credentials load on first use; a load failure fails that apply only.
pub struct KubeClient {
    credentials_dir: PathBuf,
    timeout: Duration,
    context: OnceCell<InCluster>,
}

impl KubeClient {
    pub fn new() -> Self {
        Self::with_credentials_dir(SERVICE_ACCOUNT_DIR)
    }

    pub fn with_credentials_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            credentials_dir: dir.into(),
            timeout: Duration::from_secs(30),
            context: OnceCell::new(),
        }
    }

    async fn context(&self) -> Result<&InCluster> {
        self.context
            .get_or_try_init(|| async { self.load_in_cluster() })
            .await
    }

    fn load_in_cluster(&self) -> Result<InCluster> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .context("KUBERNETES_SERVICE_HOST is not set; not running in a cluster")?;
        let port: u16 = std::env::var("KUBERNETES_SERVICE_PORT")
            .context("KUBERNETES_SERVICE_PORT is not set; not running in a cluster")?
            .parse()
            .context("KUBERNETES_SERVICE_PORT is not a port")?;

        let token_path = self.credentials_dir.join("token");
        let token = std::fs::read_to_string(&token_path)
            .with_context(|| format!("Failed to read {}", token_path.display()))?
            .trim()
            .to_string();

        let ca_path = self.credentials_dir.join("ca.crt");
        let ca = std::fs::read(&ca_path)
            .with_context(|| format!("Failed to read {}", ca_path.display()))?;
        let certificate =
            reqwest::Certificate::from_pem(&ca).context("Invalid cluster CA certificate")?;

        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .add_root_certificate(certificate)
            .build()
            .context("Failed to build HTTP client")?;

        let base_url = format!("https://{}", join_host_port(&host, port));
        info!(api = %base_url, "Loaded in-cluster credentials");

        Ok(InCluster {
            client,
            base_url,
            token,
        })
    }

    async fn create(&self, context: &InCluster, document: &Value, namespace: &str) -> Result<()> {
        let api_version = document["apiVersion"].as_str().unwrap_or_default();
        let kind = document["kind"].as_str().unwrap_or_default();
        let name = document
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or("<unnamed>");
        let namespace = document
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .unwrap_or(namespace);

        let url = format!(
            "{}{}",
            context.base_url,
            collection_path(api_version, kind, namespace)
        );
        debug!(url = %url, kind = %kind, name = %name, "Creating resource");

        let response = context
            .client
            .post(&url)
            .bearer_auth(&context.token)
            .json(document)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, kind = %kind, name = %name, "Failed to create resource");
            bail!("Failed to create {} {}: {} - {}", kind, name, status, body);
        }

        info!(kind = %kind, name = %name, namespace = %namespace, "Resource created");
        Ok(())
    }
}

impl Default for KubeClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Orchestrator for KubeClient {
    async fn apply_file(&self, path: &Path, namespace: &str) -> Result<usize> {
        let documents = load_manifest_documents(path)?;
        let context = self.context().await?;

        for document in &documents {
            self.create(context, document, namespace).await?;
        }
        Ok(documents.len())
    }
}

/// One recorded apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedFile {
    pub path: PathBuf,
    pub namespace: String,
    pub documents: usize,
}

/// Mock orchestrator for testing and development.
///
/// Validates files like the real client and records successful applies.
#[derive(Default)]
pub struct MockOrchestrator {
    applied: Mutex<Vec<AppliedFile>>,
    fail_all: bool,
}

impl MockOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock that rejects every file.
    pub fn failing() -> Self {
        Self {
            applied: Mutex::default(),
            fail_all: true,
        }
    }

    /// Files applied so far, in call order.
    pub fn applied(&self) -> Vec<AppliedFile> {
        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    async fn apply_file(&self, path: &Path, namespace: &str) -> Result<usize> {
        if self.fail_all {
            bail!("Mock orchestrator configured to fail");
        }

        let documents = load_manifest_documents(path)?.len();
        info!(path = %path.display(), namespace = %namespace, documents, "[MOCK] Applied manifest");

        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(AppliedFile {
                path: path.to_path_buf(),
                namespace: namespace.to_string(),
                documents,
            });
        Ok(documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::tempdir;

    #[rstest]
    #[case("Deployment", "deployments")]
    #[case("Service", "services")]
    #[case("ConfigMap", "configmaps")]
    #[case("PersistentVolumeClaim", "persistentvolumeclaims")]
    #[case("Ingress", "ingresses")]
    #[case("NetworkPolicy", "networkpolicies")]
    #[case("Endpoints", "endpoints")]
    #[case("Gateway", "gateways")]
    fn test_plural(#[case] kind: &str, #[case] expected: &str) {
        assert_eq!(plural(kind), expected);
    }

    #[rstest]
    #[case("apps/v1", "Deployment", "demo", "/apis/apps/v1/namespaces/demo/deployments")]
    #[case("v1", "Service", "demo", "/api/v1/namespaces/demo/services")]
    #[case("v1", "Namespace", "demo", "/api/v1/namespaces")]
    #[case(
        "storage.k8s.io/v1",
        "StorageClass",
        "demo",
        "/apis/storage.k8s.io/v1/storageclasses"
    )]
    fn test_collection_path(
        #[case] api_version: &str,
        #[case] kind: &str,
        #[case] namespace: &str,
        #[case] expected: &str,
    ) {
        assert_eq!(collection_path(api_version, kind, namespace), expected);
    }

    #[test]
    fn test_load_multi_document_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bundle.yaml");
        std::fs::write(
            &path,
            "apiVersion: v1\nkind: Service\nmetadata:\n  name: a\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: b\n",
        )
        .unwrap();

        let documents = load_manifest_documents(&path).unwrap();
        assert_eq!(documents.len(), 2);
        assert_eq!(documents[1]["kind"], "ConfigMap");
    }

    #[rstest]
    #[case("kind: Service\n")]
    #[case("- just\n- a list\n")]
    #[case("apiVersion: v1\nkind: [unclosed\n")]
    fn test_load_rejects_malformed(#[case] contents: &str) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, contents).unwrap();
        assert!(load_manifest_documents(&path).is_err());
    }

    #[tokio::test]
    async fn test_mock_records_applies() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("svc.yaml");
        std::fs::write(&path, "apiVersion: v1\nkind: Service\nmetadata:\n  name: a\n").unwrap();

        let orchestrator = MockOrchestrator::new();
        assert_eq!(orchestrator.apply_file(&path, "demo").await.unwrap(), 1);

        let applied = orchestrator.applied();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].namespace, "demo");
    }

    #[tokio::test]
    async fn test_mock_failing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("svc.yaml");
        std::fs::write(&path, "apiVersion: v1\nkind: Service\n").unwrap();

        let orchestrator = MockOrchestrator::failing();
        assert!(orchestrator.apply_file(&path, "demo").await.is_err());
        assert!(orchestrator.applied().is_empty());
    }

    #[tokio::test]
    async fn test_kube_client_without_cluster_fails_per_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("svc.yaml");
        std::fs::write(&path, "apiVersion: v1\nkind: Service\n").unwrap();

        // No token or CA in an empty credentials dir.
        let client = KubeClient::with_credentials_dir(dir.path().join("sa"));
        assert!(client.apply_file(&path, "demo").await.is_err());
    }
}
