//! Topology translation into staged manifests.
//!
//! Deployments are always written to the staging directory as
//! `Deployment-<lowercased node name>.yaml`. The other kinds are logged, or
//! staged as `<Kind>-<name>.yaml` when `stage_all_kinds` is set.

use std::path::{Path, PathBuf};

use swarm_topology::{Manifest, ManifestConverter};
use tracing::{debug, info};

use crate::error::AgentError;

/// Namespaces and staging policy for one translation.
#[derive(Debug, Clone)]
pub struct TranslateOptions {
    pub deployment_namespace: String,
    pub namespace: String,
    pub stage_all_kinds: bool,
}

/// What a translation produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslationReport {
    /// Node templates visited.
    pub nodes: usize,

    /// Files written, in write order.
    pub staged: Vec<PathBuf>,

    /// Manifests emitted to the log only.
    pub logged: usize,

    /// Conversions that yielded nothing.
    pub skipped: usize,
}

/// Parse `topology_path` and stage its manifests under `staging_dir`.
pub fn translate(
    converter: &dyn ManifestConverter,
    topology_path: &Path,
    staging_dir: &Path,
    options: &TranslateOptions,
) -> Result<TranslationReport, AgentError> {
    info!(topology = %topology_path.display(), "Converting topology into manifests");

    let template = converter.parse(topology_path)?;
    std::fs::create_dir_all(staging_dir).map_err(|source| AgentError::Staging {
        path: staging_dir.to_path_buf(),
        source,
    })?;

    let mut report = TranslationReport {
        nodes: template.node_templates.len(),
        ..Default::default()
    };

    for node in &template.node_templates {
        match converter.to_deployment(node, &options.deployment_namespace) {
            Some(deployment) => {
                let path =
                    staging_dir.join(format!("Deployment-{}.yaml", node.name.to_lowercase()));
                stage(&deployment, &path)?;
                report.staged.push(path);
            }
            None => report.skipped += 1,
        }

        let mut extra: Vec<Manifest> = Vec::new();
        match converter.to_service(node, &options.namespace) {
            Some(service) => extra.push(service),
            None => report.skipped += 1,
        }
        let claims = converter.to_pvcs(node, &options.namespace);
        if claims.is_empty() {
            report.skipped += 1;
        }
        extra.extend(claims);
        match converter.to_config_map(node, &options.namespace) {
            Some(config_map) => extra.push(config_map),
            None => report.skipped += 1,
        }

        for manifest in extra {
            if options.stage_all_kinds {
                let path = staging_dir.join(format!("{}-{}.yaml", manifest.kind(), manifest.name()));
                stage(&manifest, &path)?;
                report.staged.push(path);
            } else {
                let yaml = manifest.to_yaml()?;
                info!(
                    node = %node.name,
                    kind = %manifest.kind(),
                    name = %manifest.name(),
                    manifest = %yaml,
                    "Generated manifest"
                );
                report.logged += 1;
            }
        }
    }

    info!(
        nodes = report.nodes,
        staged = report.staged.len(),
        logged = report.logged,
        "Topology converted"
    );
    Ok(report)
}

fn stage(manifest: &Manifest, path: &Path) -> Result<(), AgentError> {
    let yaml = manifest.to_yaml()?;
    std::fs::write(path, &yaml).map_err(|source| AgentError::Staging {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(kind = %manifest.kind(), name = %manifest.name(), "Manifest contents:\n{}", yaml);
    info!(path = %path.display(), "Saved manifest");
    Ok(())
}
