//! Case runner and session orchestration
//!
//! A [`Session`] owns the dev server for its whole lifetime and runs every
//! case of a [`CaseMatrix`] in declaration order through a [`CaseRunner`].
//! Per case the runner walks
//! `SpecLoaded -> CandidateCaptured -> ReferenceCaptured -> Compared`, and
//! any capture failure short-circuits straight to a failed outcome without
//! writing artifacts.

use std::path::{Path, PathBuf};
use std::time::Instant;

use rendiff_common::{
    Backend, CaseDescriptor, CaseMatrix, ImageComparator, RasterImage, SpecDocument,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::artifacts::FailureArtifactWriter;
use crate::capture::{PageDriver, RenderCapture};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::server::DevServer;

/// Score of the candidate against one reference backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceComparison {
    pub reference: Backend,
    pub score: f64,
    pub mismatch: u64,
    pub passed: bool,
    pub artifact_dir: Option<PathBuf>,
}

/// How a case ended
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CaseOutcome {
    /// Within tolerance against every reference
    Pass,
    /// Score above tolerance against at least one reference
    ToleranceViolation,
    /// A backend produced no usable raster
    CaptureFailed { backend: Backend, error: String },
    /// The case could not be run (unreadable spec, artifact IO)
    Error { error: String },
}

/// Result of running a single case
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseReport {
    pub category: String,
    pub name: String,
    pub tolerance: f64,
    pub outcome: CaseOutcome,
    pub comparisons: Vec<ReferenceComparison>,
    pub duration_ms: u64,
}

impl CaseReport {
    fn new(case: &CaseDescriptor, outcome: CaseOutcome, start: Instant) -> Self {
        Self {
            category: case.category.clone(),
            name: case.name.clone(),
            tolerance: case.tolerance,
            outcome,
            comparisons: Vec::new(),
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    pub fn passed(&self) -> bool {
        matches!(self.outcome, CaseOutcome::Pass)
    }
}

/// Result of running a whole matrix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub results: Vec<CaseReport>,
}

impl SuiteReport {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// Runs one case end to end against a live base URL
pub struct CaseRunner<D> {
    capture: RenderCapture<D>,
    comparator: ImageComparator,
    artifacts: FailureArtifactWriter,
    specs_root: PathBuf,
    spec_extension: String,
    candidate: Backend,
    references: Vec<Backend>,
}

impl<D: PageDriver> CaseRunner<D> {
    pub fn new(driver: D, config: &HarnessConfig) -> Self {
        Self {
            capture: RenderCapture::new(driver, &config.capture),
            comparator: ImageComparator::new(config.compare),
            artifacts: FailureArtifactWriter::new(&config.paths.failures_root),
            specs_root: config.paths.specs_root.clone(),
            spec_extension: config.paths.spec_extension.clone(),
            candidate: config.backends.candidate,
            references: config.backends.references.clone(),
        }
    }

    pub fn artifacts(&self) -> &FailureArtifactWriter {
        &self.artifacts
    }

    /// Run `case`.
    ///
    /// Capture failures and tolerance violations are reported in the
    /// returned [`CaseReport`]; only a comparator precondition violation is
    /// returned as an error.
    pub async fn run(&self, base_url: &str, case: &CaseDescriptor) -> HarnessResult<CaseReport> {
        let start = Instant::now();
        let id = case.id();

        let spec_path = case.spec_path(&self.specs_root, &self.spec_extension);
        let spec = match SpecDocument::from_file(&spec_path) {
            Ok(spec) => spec,
            Err(e) => {
                error!("{}: cannot load {}: {}", id, spec_path.display(), e);
                let outcome = CaseOutcome::Error {
                    error: format!("{}: {}", spec_path.display(), e),
                };
                return Ok(CaseReport::new(case, outcome, start));
            }
        };
        debug!("{}: spec loaded", id);

        let candidate = match self.capture.capture(base_url, &spec, self.candidate).await {
            Ok(image) => image,
            Err(e) => return Ok(Self::capture_failed(case, e, start)),
        };
        debug!("{}: candidate {} captured", id, self.candidate);

        let mut references: Vec<(Backend, RasterImage)> = Vec::with_capacity(self.references.len());
        for &backend in &self.references {
            match self.capture.capture(base_url, &spec, backend).await {
                Ok(image) => references.push((backend, image)),
                Err(e) => return Ok(Self::capture_failed(case, e, start)),
            }
            debug!("{}: reference {} captured", id, backend);
        }

        let nested = references.len() > 1;
        let mut comparisons = Vec::with_capacity(references.len());
        let mut artifact_error = None;

        for (backend, reference) in references {
            let result = self
                .comparator
                .compare(reference, candidate.clone())
                .map_err(|source| HarnessError::Precondition {
                    case: id.clone(),
                    source,
                })?;

            let passed = case.accepts(result.score);
            info!(
                "{}: {} vs {} score: {} (tolerance {}, {} mismatched pixels)",
                id, self.candidate, backend, result.score, case.tolerance, result.mismatch
            );

            let artifact_dir = if passed {
                None
            } else {
                let label = nested.then(|| backend.as_str());
                match self.artifacts.persist(case, &result, label) {
                    Ok(dir) => Some(dir),
                    Err(e) => {
                        error!("{}: {}", id, e);
                        artifact_error = Some(e.to_string());
                        None
                    }
                }
            };

            comparisons.push(ReferenceComparison {
                reference: backend,
                score: result.score,
                mismatch: result.mismatch,
                passed,
                artifact_dir,
            });
        }

        let outcome = if let Some(error) = artifact_error {
            CaseOutcome::Error { error }
        } else if comparisons.iter().all(|c| c.passed) {
            CaseOutcome::Pass
        } else {
            CaseOutcome::ToleranceViolation
        };

        let mut report = CaseReport::new(case, outcome, start);
        report.comparisons = comparisons;
        Ok(report)
    }

    fn capture_failed(
        case: &CaseDescriptor,
        err: crate::error::CaptureError,
        start: Instant,
    ) -> CaseReport {
        error!("{}: {}", case.id(), err);
        let outcome = CaseOutcome::CaptureFailed {
            backend: err.backend(),
            error: err.to_string(),
        };
        CaseReport::new(case, outcome, start)
    }
}

/// One harness session: a dev server shared by every case in a matrix
pub struct Session<D> {
    config: HarnessConfig,
    runner: CaseRunner<D>,
}

impl<D: PageDriver> Session<D> {
    pub fn new(config: HarnessConfig, driver: D) -> HarnessResult<Self> {
        config.validate()?;
        let runner = CaseRunner::new(driver, &config);
        Ok(Self { config, runner })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Clear old artifacts, start the dev server, run `matrix`, stop the
    /// server.
    ///
    /// The server is stopped on every exit path: normal return, error
    /// propagation, and unwinding (through [`DevServer`]'s `Drop`).
    pub async fn run(&self, matrix: &CaseMatrix) -> HarnessResult<SuiteReport> {
        self.runner.artifacts().reset()?;

        let mut server = DevServer::start(&self.config.server).await?;
        let report = self.run_cases(server.base_url(), matrix).await;
        server.shutdown().await;
        report
    }

    /// Run every case against an already running server
    pub async fn run_cases(&self, base_url: &str, matrix: &CaseMatrix) -> HarnessResult<SuiteReport> {
        let start = Instant::now();
        let mut results = Vec::with_capacity(matrix.len());
        let mut passed = 0;
        let mut failed = 0;

        info!("Running {} case(s)...", matrix.len());

        for case in matrix {
            let report = self.runner.run(base_url, case).await?;
            if report.passed() {
                passed += 1;
                info!("✓ {} ({} ms)", case.id(), report.duration_ms);
            } else {
                failed += 1;
                warn!("✗ {} ({} ms)", case.id(), report.duration_ms);
            }
            results.push(report);
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Results: {} passed, {} failed ({} ms)",
            passed, failed, duration_ms
        );

        Ok(SuiteReport {
            total: matrix.len(),
            passed,
            failed,
            duration_ms,
            results,
        })
    }

    /// Write the suite report to `<output_dir>/results.json`
    pub fn write_report(&self, report: &SuiteReport) -> HarnessResult<PathBuf> {
        write_report(&self.config.paths.output_dir, report)
    }
}

/// Write `report` as pretty JSON to `<dir>/results.json`
pub fn write_report(dir: &Path, report: &SuiteReport) -> HarnessResult<PathBuf> {
    std::fs::create_dir_all(dir)?;

    let path = dir.join("results.json");
    std::fs::write(&path, serde_json::to_string_pretty(report)?)?;

    info!("Results written to: {}", path.display());
    Ok(path)
}
