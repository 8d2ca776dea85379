//! Failure artifacts - reference/candidate/diff images plus metrics for
//! cases that violate their tolerance

use std::path::{Path, PathBuf};

use rendiff_common::{CaseDescriptor, ComparisonResult};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{HarnessError, HarnessResult};

pub const REFERENCE_PNG: &str = "reference.png";
pub const CANDIDATE_PNG: &str = "candidate.png";
pub const DIFF_PNG: &str = "diff.png";
pub const METRICS_JSON: &str = "metrics.json";

/// Contents of `metrics.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureMetrics {
    pub required_score: f64,
    pub score: f64,
    pub mismatch: u64,
}

/// Persists diagnostic bundles under `<root>/<category>/<name>/`
#[derive(Debug, Clone)]
pub struct FailureArtifactWriter {
    root: PathBuf,
}

impl FailureArtifactWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Clear out artifacts from a previous session
    pub fn reset(&self) -> HarnessResult<()> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not clear {}: {}", self.root.display(), e),
        }
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// Write the bundle for a tolerance violation and return its directory.
    ///
    /// `reference_label` adds one more directory level, used when a case is
    /// compared against several references.
    pub fn persist(
        &self,
        case: &CaseDescriptor,
        result: &ComparisonResult,
        reference_label: Option<&str>,
    ) -> HarnessResult<PathBuf> {
        let mut dir = case.artifact_dir(&self.root);
        if let Some(label) = reference_label {
            dir.push(label);
        }

        self.write_bundle(&dir, case, result)
            .map_err(|e| HarnessError::Artifact {
                path: dir.display().to_string(),
                reason: e.to_string(),
            })?;

        info!("Failure artifacts for {} written to {}", case.id(), dir.display());
        Ok(dir)
    }

    fn write_bundle(
        &self,
        dir: &Path,
        case: &CaseDescriptor,
        result: &ComparisonResult,
    ) -> HarnessResult<()> {
        std::fs::create_dir_all(dir)?;

        result.reference.save_png(&dir.join(REFERENCE_PNG))?;
        result.candidate.save_png(&dir.join(CANDIDATE_PNG))?;
        result.diff.save_png(&dir.join(DIFF_PNG))?;

        let metrics = FailureMetrics {
            required_score: case.tolerance,
            score: result.score,
            mismatch: result.mismatch,
        };
        std::fs::write(dir.join(METRICS_JSON), serde_json::to_string_pretty(&metrics)?)?;
        Ok(())
    }
}
