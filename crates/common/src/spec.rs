//! Opaque specification documents handed to the rendering backends

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A visualization specification.
///
/// The harness never interprets the document; it is loaded as JSON and
/// passed through to the embedding entry point untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecDocument(serde_json::Value);

impl SpecDocument {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(Self(serde_json::from_str(json)?))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bar.vg.json");
        std::fs::write(&path, r#"{"width": 200, "marks": []}"#).unwrap();

        let spec = SpecDocument::from_file(&path).unwrap();
        assert_eq!(spec.as_value()["width"], 200);
    }

    #[test]
    fn test_missing_and_malformed() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            SpecDocument::from_file(&dir.path().join("nope.vg.json")),
            Err(Error::Io(_))
        ));
        assert!(matches!(SpecDocument::from_json("{"), Err(Error::Json(_))));
    }
}
