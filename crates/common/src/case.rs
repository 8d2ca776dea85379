//! Declarative case matrix and rendering backend identifiers

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Rendering backend activated for a capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Vega's SVG renderer
    Svg,
    /// Vega's 2D canvas renderer
    Canvas,
    /// The avenger GPU renderer
    Avenger,
}

/// How a backend presents its output in the page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Raster,
    Vector,
}

impl Backend {
    pub const ALL: [Backend; 3] = [Backend::Svg, Backend::Canvas, Backend::Avenger];

    /// The `renderer` value passed to the embedding entry point
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Svg => "svg",
            Backend::Canvas => "canvas",
            Backend::Avenger => "avenger",
        }
    }

    pub fn output_mode(&self) -> OutputMode {
        match self {
            Backend::Svg => OutputMode::Vector,
            Backend::Canvas | Backend::Avenger => OutputMode::Raster,
        }
    }

    /// CSS selector of the element holding the rendered output
    pub fn output_selector(&self) -> &'static str {
        match self.output_mode() {
            OutputMode::Raster => "canvas",
            OutputMode::Vector => "svg",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Backend::ALL
            .into_iter()
            .find(|b| b.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::UnknownBackend(s.to_string()))
    }
}

/// One row of the case matrix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseDescriptor {
    pub category: String,
    pub name: String,
    /// Largest acceptable mismatch score for this case
    pub tolerance: f64,
}

impl CaseDescriptor {
    pub fn new(category: impl Into<String>, name: impl Into<String>, tolerance: f64) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
            tolerance,
        }
    }

    /// `<category>/<name>`
    pub fn id(&self) -> String {
        format!("{}/{}", self.category, self.name)
    }

    /// `<specs_root>/<category>/<name>.<extension>`
    pub fn spec_path(&self, specs_root: &Path, extension: &str) -> PathBuf {
        specs_root
            .join(&self.category)
            .join(format!("{}.{}", self.name, extension))
    }

    /// Relative directory used for this case under a failures root
    pub fn artifact_dir(&self, failures_root: &Path) -> PathBuf {
        failures_root.join(&self.category).join(&self.name)
    }

    /// Gate a score against this case's tolerance (inclusive)
    pub fn accepts(&self, score: f64) -> bool {
        score <= self.tolerance
    }

    fn validate(&self) -> Result<()> {
        for (field, value) in [("category", &self.category), ("name", &self.name)] {
            if value.trim().is_empty() {
                return Err(Error::InvalidMatrix(format!("case has an empty {}", field)));
            }
            if value.contains(['/', '\\']) || value == "." || value == ".." {
                return Err(Error::InvalidMatrix(format!(
                    "{} '{}' must be a single path component",
                    field, value
                )));
            }
        }
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(Error::InvalidMatrix(format!(
                "case {} has invalid tolerance {}",
                self.id(),
                self.tolerance
            )));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct MatrixFile {
    cases: Vec<CaseDescriptor>,
}

/// Validated, immutable list of cases in declaration order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CaseMatrix {
    cases: Vec<CaseDescriptor>,
}

impl CaseMatrix {
    /// Validate and wrap a list of cases
    pub fn new(cases: Vec<CaseDescriptor>) -> Result<Self> {
        let mut seen = HashSet::new();
        for case in &cases {
            case.validate()?;
            if !seen.insert((case.category.as_str(), case.name.as_str())) {
                return Err(Error::InvalidMatrix(format!("duplicate case {}", case.id())));
            }
        }
        Ok(Self { cases })
    }

    /// Parse a matrix from YAML (`cases: [{category, name, tolerance}]`)
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: MatrixFile = serde_yaml::from_str(yaml)?;
        Self::new(file.cases)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let matrix = Self::from_yaml(&content)?;
        debug!("Loaded {} case(s) from {}", matrix.len(), path.display());
        Ok(matrix)
    }

    /// Keep only cases matching the given category and/or name
    pub fn filter(&self, category: Option<&str>, name: Option<&str>) -> Self {
        let cases = self
            .cases
            .iter()
            .filter(|c| category.map_or(true, |cat| c.category == cat))
            .filter(|c| name.map_or(true, |n| c.name == n))
            .cloned()
            .collect();
        Self { cases }
    }

    pub fn cases(&self) -> &[CaseDescriptor] {
        &self.cases
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CaseDescriptor> {
        self.cases.iter()
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

impl<'a> IntoIterator for &'a CaseMatrix {
    type Item = &'a CaseDescriptor;
    type IntoIter = std::slice::Iter<'a, CaseDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.cases.iter()
    }
}
