use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::sandbox::limits::ResourceKind;
use crate::security::SecurityFinding;

/// A single problem found while validating a manifest or execution params.
///
/// `field` is a dotted path into the manifest (e.g. `script_info.version`)
/// or the parameter name, so callers can key errors to form fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Errors surfaced by the execution and policy engine.
///
/// Validation, security and permission failures carry the complete list of
/// problems found in a single pass. Execution-time failures (timeout, limit,
/// process) are normally folded into an `ExecutionResult` by the execution
/// manager and only appear here when a lower layer reports them.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("validation failed: {}", join(.0))]
    Validation(Vec<ValidationIssue>),

    #[error("security screen rejected script: {}", join(.0))]
    SecurityViolation(Vec<SecurityFinding>),

    #[error("permission denied: {}", .0.join(", "))]
    PermissionDenied(Vec<String>),

    #[error("resource limit exceeded: {resource} at {current:.2} (limit {limit:.2})")]
    ResourceLimitExceeded {
        resource: ResourceKind,
        limit: f64,
        current: f64,
    },

    #[error("execution timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("process error: {0}")]
    Process(String),

    #[error("script {0} is already running")]
    AlreadyRunning(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("file system error: {0}")]
    FileSystem(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ScriptError {
    /// True for errors raised before any process was spawned.
    pub fn is_pre_execution(&self) -> bool {
        matches!(
            self,
            ScriptError::Validation(_)
                | ScriptError::SecurityViolation(_)
                | ScriptError::PermissionDenied(_)
                | ScriptError::AlreadyRunning(_)
        )
    }
}

impl From<std::io::Error> for ScriptError {
    fn from(e: std::io::Error) -> Self {
        ScriptError::FileSystem(e.to_string())
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T, E = ScriptError> = std::result::Result<T, E>;
