//! Shared wire types and the error taxonomy for the rexec worker.
//!
//! Everything that crosses the transport boundary (requests, results,
//! structured errors) lives here so the executor core and the HTTP
//! surface agree on one shape.

use std::collections::HashMap;
use std::fmt::Display;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod codec;

pub use codec::Blob;

/// Worker-side error taxonomy. Categories map 1:1 onto the stable
/// `kind` strings carried in [`ErrorInfo`]; everything here is
/// converted into a result-level error and never crashes the worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("function or class not resolvable: {0}")]
    Resolution(String),

    #[error("failed to install {packages}: {detail}")]
    Dependency { packages: String, detail: String },

    #[error("timed out waiting for workspace lock after {0:?}")]
    WorkspaceLockTimeout(Duration),

    #[error("workspace initialization failed: {0}")]
    WorkspaceInit(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    /// Stable error-kind discriminant reported to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerError::Resolution(_) => "ResolutionError",
            WorkerError::Dependency { .. } => "DependencyError",
            WorkerError::WorkspaceLockTimeout(_) | WorkerError::WorkspaceInit(_) => {
                "WorkspaceError"
            }
            WorkerError::Manifest(_) => "ManifestError",
            WorkerError::Execution(_) | WorkerError::Io(_) => "ExecutionError",
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Function,
    ClassMethod,
}

/// A unit of work delivered to the worker.
///
/// `inline_source` absent means the call must be resolved through the
/// manifest (or the local provisioned-function registry); present means
/// the caller shipped the code alongside the call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub kind: CallKind,
    /// Function name, or `Class.method` for class-method calls.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_source: Option<String>,
    /// Opaque, adapter-encoded positional arguments.
    #[serde(default)]
    pub args: Vec<Blob>,
    #[serde(default)]
    pub kwargs: HashMap<String, Blob>,
    #[serde(default)]
    pub language_packages: Vec<String>,
    #[serde(default)]
    pub os_packages: Vec<String>,
    /// Targets a cached class instance from an earlier call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

impl ExecutionRequest {
    pub fn function(name: impl Into<String>) -> Self {
        Self {
            kind: CallKind::Function,
            name: name.into(),
            inline_source: None,
            args: Vec::new(),
            kwargs: HashMap::new(),
            language_packages: Vec::new(),
            os_packages: Vec::new(),
            instance_id: None,
        }
    }

    /// Splits `Class.method` into its parts for class-method calls.
    pub fn class_and_method(&self) -> Option<(&str, &str)> {
        self.name.split_once('.')
    }
}

/// Structured error description attached to a failed result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub trace: String,
}

impl From<&WorkerError> for ErrorInfo {
    fn from(err: &WorkerError) -> Self {
        ErrorInfo {
            kind: err.kind().to_string(),
            message: err.to_string(),
            trace: String::new(),
        }
    }
}

/// The response for every request the worker accepts. Invariants:
/// `result` is present iff `success`, `error` is present iff not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Blob>,
    /// Combined captured stdout/stderr/log text, always present.
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

impl ExecutionResult {
    pub fn ok(result: Blob, output: String) -> Self {
        ExecutionResult {
            success: true,
            result: Some(result),
            output,
            error: None,
            instance_id: None,
        }
    }

    pub fn failure(error: ErrorInfo, output: String) -> Self {
        ExecutionResult {
            success: false,
            result: None,
            output,
            error: Some(error),
            instance_id: None,
        }
    }

    pub fn from_error(err: &WorkerError) -> Self {
        Self::failure(ErrorInfo::from(err), String::new())
    }

    pub fn with_instance(mut self, instance_id: Option<String>) -> Self {
        self.instance_id = instance_id;
        self
    }
}

impl Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error {
            Some(e) => write!(f, "ExecutionResult(success: false, error: {})", e.message),
            None => write!(f, "ExecutionResult(success: true)"),
        }
    }
}
