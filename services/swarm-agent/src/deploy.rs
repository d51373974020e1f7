//! Apply staged manifests through the orchestrator.

use std::path::{Path, PathBuf};

use tracing::{error, info};

use crate::error::AgentError;
use crate::orchestrator::Orchestrator;

/// Outcome of applying a staging directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Files applied with their document counts.
    pub applied: Vec<(PathBuf, usize)>,

    /// Files that failed with the error text.
    pub failed: Vec<(PathBuf, String)>,
}

impl ApplyReport {
    pub fn attempted(&self) -> usize {
        self.applied.len() + self.failed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Manifest files in `staging_dir` (`.yaml`/`.yml`), sorted by name.
pub fn staged_files(staging_dir: &Path) -> Result<Vec<PathBuf>, AgentError> {
    let entries = std::fs::read_dir(staging_dir).map_err(|source| AgentError::Staging {
        path: staging_dir.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|source| AgentError::Staging {
                path: staging_dir.to_path_buf(),
                source,
            })?
            .path();
        let is_manifest = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        if is_manifest && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Apply every staged manifest. A failing file is logged and skipped.
pub async fn apply_all(
    orchestrator: &dyn Orchestrator,
    staging_dir: &Path,
    namespace: &str,
) -> Result<ApplyReport, AgentError> {
    let files = staged_files(staging_dir)?;
    let mut report = ApplyReport::default();

    for path in files {
        info!(path = %path.display(), "Applying manifest");
        match orchestrator.apply_file(&path, namespace).await {
            Ok(documents) => report.applied.push((path, documents)),
            Err(e) => {
                error!(path = %path.display(), error = %format!("{:#}", e), "Failed applying manifest");
                report.failed.push((path, format!("{:#}", e)));
            }
        }
    }

    info!(
        applied = report.applied.len(),
        failed = report.failed.len(),
        "Manifests applied"
    );
    Ok(report)
}
