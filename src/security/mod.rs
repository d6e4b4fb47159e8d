//! Static security screen for script sources.
//!
//! This is a pattern-based heuristic run before a script is ever offered
//! for execution: file size, imports, literal file paths, dangerous call
//! sites, requested resource limits and an optional content signature.
//! It is not a sandbox. Runtime containment comes from the permission set
//! handed to the interpreter and from resource monitoring.

pub mod rules;
pub mod validator;

use std::fmt;
use std::path::{Component, Path, PathBuf};

pub use rules::{RuleSet, Severity};
pub use validator::SecurityValidator;

/// Which screening step produced a finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FindingKind {
    FileSize,
    Unreadable,
    BlockedImport(String),
    UnlistedImport(String),
    PathAccess(String),
    /// A pattern rule hit, by rule id
    Pattern(String),
    ResourceCeiling(String),
    Signature,
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FindingKind::FileSize => write!(f, "file-size"),
            FindingKind::Unreadable => write!(f, "unreadable"),
            FindingKind::BlockedImport(_) => write!(f, "blocked-import"),
            FindingKind::UnlistedImport(_) => write!(f, "unlisted-import"),
            FindingKind::PathAccess(_) => write!(f, "path-access"),
            FindingKind::Pattern(id) => write!(f, "{id}"),
            FindingKind::ResourceCeiling(_) => write!(f, "resource-ceiling"),
            FindingKind::Signature => write!(f, "signature"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityFinding {
    pub kind: FindingKind,
    pub severity: Severity,
    pub message: String,
    /// 1-based source line, when the finding comes from a source scan
    pub line: Option<usize>,
}

impl SecurityFinding {
    pub fn error(kind: FindingKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: Severity::Error,
            message: message.into(),
            line: None,
        }
    }

    pub fn at_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }
}

impl fmt::Display for SecurityFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {line}: [{}] {}", self.kind, self.message),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityReport {
    pub is_valid: bool,
    pub errors: Vec<SecurityFinding>,
    pub warnings: Vec<SecurityFinding>,
}

impl SecurityReport {
    pub fn from_findings(findings: Vec<SecurityFinding>) -> Self {
        let (errors, warnings): (Vec<_>, Vec<_>) = findings
            .into_iter()
            .partition(|f| f.severity == Severity::Error);
        Self {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

/// Lexically normalizes a path: resolves `.` and `..` without touching the
/// filesystem (the target may not exist yet). Relative paths are joined to
/// `base` first.
pub fn normalize_path(path: &Path, base: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// True when `path` lies under one of `roots` (component-wise prefix, so
/// `/data` does not contain `/database`).
pub fn is_within(path: &Path, roots: &[PathBuf]) -> bool {
    roots.iter().any(|root| path.starts_with(root))
}

/// An import is allowed when it, or one of its parent packages, is listed.
/// `os.path` allows `os.path.join` but not `os`.
pub fn import_listed(module: &str, list: &[String]) -> bool {
    list.iter().any(|entry| {
        module == entry
            || module
                .strip_prefix(entry.as_str())
                .is_some_and(|rest| rest.starts_with('.'))
    })
}
