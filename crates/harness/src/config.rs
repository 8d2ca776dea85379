//! Harness configuration

use std::path::{Path, PathBuf};

use rendiff_common::{Backend, CompareOptions};
use serde::{Deserialize, Serialize};

use crate::capture::CaptureConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::server::ServerConfig;

/// Full harness configuration, loadable from TOML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub server: ServerConfig,
    pub capture: CaptureConfig,
    pub compare: CompareOptions,
    pub paths: PathsConfig,
    pub backends: BackendsConfig,
}

/// Where specs are read from and artifacts written to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of `<category>/<name>.<ext>` spec files
    pub specs_root: PathBuf,

    /// Spec file extension, without the leading dot
    pub spec_extension: String,

    /// Root for failure artifacts; cleared at session start
    pub failures_root: PathBuf,

    /// Directory for the suite report
    pub output_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            specs_root: PathBuf::from("vega-specs"),
            spec_extension: "vg.json".to_string(),
            failures_root: PathBuf::from("failures"),
            output_dir: PathBuf::from("test-results"),
        }
    }
}

/// Which backend is under test and what it is compared against
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    pub candidate: Backend,
    pub references: Vec<Backend>,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            candidate: Backend::Avenger,
            references: vec![Backend::Svg],
        }
    }
}

impl HarnessConfig {
    /// Load configuration from a TOML file, or defaults when it is absent
    pub fn load(path: &Path) -> HarnessResult<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> HarnessResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that could only fail later at capture time
    pub fn validate(&self) -> HarnessResult<()> {
        let backends = &self.backends;
        if backends.references.is_empty() {
            return Err(HarnessError::Config(
                "at least one reference backend is required".to_string(),
            ));
        }
        if backends.references.contains(&backends.candidate) {
            return Err(HarnessError::Config(format!(
                "candidate backend {} cannot also be a reference",
                backends.candidate
            )));
        }
        for (i, backend) in backends.references.iter().enumerate() {
            if backends.references[..i].contains(backend) {
                return Err(HarnessError::Config(format!(
                    "reference backend {} listed twice",
                    backend
                )));
            }
        }

        let threshold = self.compare.threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(HarnessError::Config(format!(
                "compare threshold {} is outside [0, 1]",
                threshold
            )));
        }

        if self.server.command.is_empty() {
            return Err(HarnessError::Config("server command is empty".to_string()));
        }
        if self.paths.spec_extension.is_empty() {
            return Err(HarnessError::Config("spec extension is empty".to_string()));
        }
        Ok(())
    }
}
