//! error.rs
//!
//! Error taxonomy for a generation run.
//!
//! Only `ConfigError` and `RunError` ever escape `orchestrator::run`.
//! Everything else is caught at the unit boundary and lands in the report.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Source could not be split into functions. Never fatal: the unit
/// degrades to whole-file granularity.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("{file}: parser reported errors near line {line}")]
    Unparseable { file: String, line: usize },

    #[error("{file}: no testable functions found")]
    NoFunctions { file: String },

    #[error("{file}: unsupported language")]
    UnsupportedLanguage { file: String },
}

/// Failure reported by the model gateway.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Network, timeout, rate limit, server side failure. Retry the same request.
    #[error("transient service error: {0}")]
    Transient(String),

    /// Authentication or malformed request. Never retried.
    #[error("fatal service error: {0}")]
    Fatal(String),

    #[error("cancelled")]
    Cancelled,
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to update manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid TOML in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("cannot write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum CoverageError {
    #[error("coverage build failed: {0}")]
    Build(String),

    #[error("test binary failed: {0}")]
    Execution(String),

    #[error("coverage report failed: {0}")]
    Report(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors that abort a whole run. No units are processed (config) or the
/// run cannot make progress at all (infrastructure).
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("project root {0} is not a directory")]
    ProjectRoot(PathBuf),

    #[error("output directory {path} is not writable: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to scan {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}
