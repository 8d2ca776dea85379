//! Error types for the harness
//!
//! Failures fall into disjoint kinds with different blast radius:
//! [`SetupError`] aborts the session, [`CaptureError`] fails one case, and
//! a comparator precondition violation ([`HarnessError::Precondition`])
//! aborts the session as a wiring defect. Tolerance violations are not
//! errors at all; they are a case outcome.

use std::time::Duration;

use rendiff_common::Backend;
use thiserror::Error;

/// Session-level setup failures
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("Dependency preparation `{command}` failed: {reason}")]
    Prepare { command: String, reason: String },

    #[error("Failed to allocate a loopback port: {0}")]
    PortAllocation(#[source] std::io::Error),

    #[error("Server failed to start: {0}")]
    Spawn(String),

    #[error("Server exited during startup on {attempts} attempt(s)")]
    ServerExited { attempts: usize },

    #[error("Server not ready at {url} after {waited:?}")]
    NotReady { url: String, waited: Duration },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Failures to obtain a usable raster from a backend
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("{backend}: blank output")]
    Blank { backend: Backend },

    #[error("{backend}: page reported script error(s): {}", messages.join("; "))]
    Script {
        backend: Backend,
        messages: Vec<String>,
    },

    #[error("{backend}: capture timed out after {after:?}")]
    Timeout { backend: Backend, after: Duration },

    #[error("{backend}: browser driver failed: {reason}")]
    Driver { backend: Backend, reason: String },

    #[error("{backend}: screenshot could not be decoded: {source}")]
    Decode {
        backend: Backend,
        #[source]
        source: rendiff_common::Error,
    },
}

impl CaptureError {
    pub fn backend(&self) -> Backend {
        match self {
            CaptureError::Blank { backend }
            | CaptureError::Script { backend, .. }
            | CaptureError::Timeout { backend, .. }
            | CaptureError::Driver { backend, .. }
            | CaptureError::Decode { backend, .. } => *backend,
        }
    }
}

/// Top-level harness error
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Setup failed: {0}")]
    Setup(#[from] SetupError),

    /// Comparator inputs violated its contract; a harness wiring defect.
    #[error("Comparator precondition violated in case {case}: {source}")]
    Precondition {
        case: String,
        #[source]
        source: rendiff_common::Error,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to write failure artifacts to {path}: {reason}")]
    Artifact { path: String, reason: String },

    #[error(transparent)]
    Common(#[from] rendiff_common::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type HarnessResult<T> = Result<T, HarnessError>;
