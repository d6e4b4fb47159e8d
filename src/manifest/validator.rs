/// Structural and format validation of manifest documents.
///
/// Works on the raw JSON document rather than the typed `Manifest`, so a
/// missing field is reported as an error instead of aborting the parse.
/// Every check runs; nothing short-circuits.
use std::path::Path;

use serde_json::{Map, Value};

use crate::error::ValidationIssue;

use super::Manifest;

const SCRIPT_INFO_REQUIRED: &[&str] =
    &["id", "name", "version", "description", "author", "category"];
const EXECUTION_REQUIRED: &[&str] = &["entry_point", "python_version"];
const ARGUMENT_REQUIRED: &[&str] = &["name", "type", "description"];
const VERSION_OPERATORS: &[&str] = &[">=", "<=", "==", "~="];

/// Outcome of a validation pass: the complete list of problems.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn from_issues(errors: Vec<ValidationIssue>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestValidator;

impl ManifestValidator {
    pub fn new() -> Self {
        Self
    }

    /// Full validation: structure, formats, and the entry point existing
    /// relative to `base_dir`.
    pub fn validate(&self, doc: &Value, base_dir: &Path) -> ValidationReport {
        let mut issues = self.check_structure(doc);

        let entry_point = doc
            .get("execution")
            .and_then(|e| e.get("entry_point"))
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty());
        if let Some(entry_point) = entry_point {
            let path = base_dir.join(entry_point);
            if !path.is_file() {
                issues.push(ValidationIssue::new(
                    "execution.entry_point",
                    format!("file not found: {}", path.display()),
                ));
            }
        }

        ValidationReport::from_issues(issues)
    }

    /// Validates an already typed manifest (e.g. one mutated in memory).
    pub fn validate_manifest(&self, manifest: &Manifest, base_dir: &Path) -> ValidationReport {
        match serde_json::to_value(manifest) {
            Ok(doc) => self.validate(&doc, base_dir),
            Err(e) => ValidationReport::from_issues(vec![ValidationIssue::new(
                "manifest",
                format!("cannot serialize: {e}"),
            )]),
        }
    }

    /// Every check except the on-disk entry point lookup.
    pub fn check_structure(&self, doc: &Value) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        let Some(root) = doc.as_object() else {
            issues.push(ValidationIssue::new("manifest", "must be a JSON object"));
            return issues;
        };

        let script_info = section(root, "script_info", &mut issues);
        check_required_strings(&script_info, "script_info", SCRIPT_INFO_REQUIRED, &mut issues);
        if let Some(version) = script_info.get("version").and_then(Value::as_str) {
            if !version.is_empty() && !is_semver(version) {
                issues.push(ValidationIssue::new(
                    "script_info.version",
                    format!("'{version}' is not a MAJOR.MINOR.PATCH version"),
                ));
            }
        }
        check_string_array(&script_info, "script_info", "tags", &mut issues);

        let execution = section(root, "execution", &mut issues);
        check_required_strings(&execution, "execution", EXECUTION_REQUIRED, &mut issues);
        if let Some(range) = execution.get("python_version").and_then(Value::as_str) {
            if !range.is_empty() && !is_version_range(range) {
                issues.push(ValidationIssue::new(
                    "execution.python_version",
                    format!("'{range}' must be an operator (>=, <=, ==, ~=) followed by N.N[.N]"),
                ));
            }
        }
        check_string_array(&execution, "execution", "dependencies", &mut issues);
        check_arguments(&execution, &mut issues);
        check_environment(&execution, &mut issues);
        check_resource_limits(&execution, &mut issues);

        if let Some(validation) = root.get("validation") {
            check_validation(validation, &mut issues);
        }
        if let Some(metadata) = root.get("metadata") {
            check_metadata(metadata, &mut issues);
        }

        issues
    }
}

/// Returns the named section as an object. A missing section behaves like
/// an empty one so each of its required fields is reported individually.
fn section(
    root: &Map<String, Value>,
    name: &str,
    issues: &mut Vec<ValidationIssue>,
) -> Map<String, Value> {
    match root.get(name) {
        None => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => {
            issues.push(ValidationIssue::new(name, "must be an object"));
            Map::new()
        }
    }
}

fn check_required_strings(
    obj: &Map<String, Value>,
    prefix: &str,
    fields: &[&str],
    issues: &mut Vec<ValidationIssue>,
) {
    for field in fields {
        let path = format!("{prefix}.{field}");
        match obj.get(*field) {
            None | Some(Value::Null) => issues.push(ValidationIssue::new(path, "is required")),
            Some(Value::String(s)) if s.trim().is_empty() => {
                issues.push(ValidationIssue::new(path, "must not be empty"))
            }
            Some(Value::String(_)) => {}
            Some(_) => issues.push(ValidationIssue::new(path, "must be a string")),
        }
    }
}

fn check_string_array(
    obj: &Map<String, Value>,
    prefix: &str,
    field: &str,
    issues: &mut Vec<ValidationIssue>,
) {
    match obj.get(field) {
        None => {}
        Some(Value::Array(items)) => {
            for (i, item) in items.iter().enumerate() {
                if !item.is_string() {
                    issues.push(ValidationIssue::new(
                        format!("{prefix}.{field}[{i}]"),
                        "must be a string",
                    ));
                }
            }
        }
        Some(_) => {
            issues.push(ValidationIssue::new(format!("{prefix}.{field}"), "must be an array"))
        }
    }
}

fn check_arguments(execution: &Map<String, Value>, issues: &mut Vec<ValidationIssue>) {
    let items = match execution.get("arguments") {
        None => return,
        Some(Value::Array(items)) => items,
        Some(_) => {
            issues.push(ValidationIssue::new("execution.arguments", "must be an array"));
            return;
        }
    };

    for (i, item) in items.iter().enumerate() {
        let prefix = format!("execution.arguments[{i}]");
        let Some(arg) = item.as_object() else {
            issues.push(ValidationIssue::new(prefix, "must be an object"));
            continue;
        };
        check_required_strings(arg, &prefix, ARGUMENT_REQUIRED, issues);
        if let Some(required) = arg.get("required") {
            if !required.is_boolean() {
                issues.push(ValidationIssue::new(
                    format!("{prefix}.required"),
                    "must be a boolean",
                ));
            }
        }
    }
}

fn check_environment(execution: &Map<String, Value>, issues: &mut Vec<ValidationIssue>) {
    match execution.get("environment") {
        None => {}
        Some(Value::Object(vars)) => {
            for (key, value) in vars {
                if !value.is_string() {
                    issues.push(ValidationIssue::new(
                        format!("execution.environment.{key}"),
                        "must be a string",
                    ));
                }
            }
        }
        Some(_) => issues.push(ValidationIssue::new("execution.environment", "must be an object")),
    }
}

fn check_resource_limits(execution: &Map<String, Value>, issues: &mut Vec<ValidationIssue>) {
    let limits = match execution.get("resource_limits") {
        None | Some(Value::Null) => return,
        Some(Value::Object(limits)) => limits,
        Some(_) => {
            issues.push(ValidationIssue::new("execution.resource_limits", "must be an object"));
            return;
        }
    };
    for key in ["memory", "cpu", "duration"] {
        match limits.get(key) {
            None | Some(Value::Null) => {}
            Some(v) if v.as_f64().is_some_and(|n| n > 0.0) => {}
            Some(_) => issues.push(ValidationIssue::new(
                format!("execution.resource_limits.{key}"),
                "must be a positive number",
            )),
        }
    }
}

fn check_validation(validation: &Value, issues: &mut Vec<ValidationIssue>) {
    let Some(validation) = validation.as_object() else {
        issues.push(ValidationIssue::new("validation", "must be an object"));
        return;
    };

    for key in ["input_schema", "output_schema"] {
        if let Some(schema) = validation.get(key) {
            check_schema(schema, &format!("validation.{key}"), issues);
        }
    }

    match validation.get("signature") {
        None | Some(Value::Null) | Some(Value::String(_)) => {}
        Some(_) => issues.push(ValidationIssue::new("validation.signature", "must be a string")),
    }

    match validation.get("permissions") {
        None | Some(Value::Null) => {}
        Some(Value::Object(perms)) => {
            check_string_array(perms, "validation.permissions", "allowed_imports", issues);
            check_string_array(perms, "validation.permissions", "allowed_paths", issues);
            for flag in [
                "allow_networking",
                "allow_file_system",
                "allow_subprocess",
                "allow_environment_access",
            ] {
                if perms.get(flag).is_some_and(|v| !v.is_boolean()) {
                    issues.push(ValidationIssue::new(
                        format!("validation.permissions.{flag}"),
                        "must be a boolean",
                    ));
                }
            }
        }
        Some(_) => issues.push(ValidationIssue::new("validation.permissions", "must be an object")),
    }
}

/// A schema is well-formed when it is an object whose `type` (if any) is a
/// string and whose `properties` (if any) is an object of objects.
fn check_schema(schema: &Value, path: &str, issues: &mut Vec<ValidationIssue>) {
    if schema.is_null() {
        return;
    }
    let Some(obj) = schema.as_object() else {
        issues.push(ValidationIssue::new(path, "must be an object"));
        return;
    };
    if obj.get("type").is_some_and(|t| !t.is_string()) {
        issues.push(ValidationIssue::new(format!("{path}.type"), "must be a string"));
    }
    match obj.get("properties") {
        None => {}
        Some(Value::Object(props)) => {
            for (name, prop) in props {
                if !prop.is_object() {
                    issues.push(ValidationIssue::new(
                        format!("{path}.properties.{name}"),
                        "must be an object",
                    ));
                }
            }
        }
        Some(_) => {
            issues.push(ValidationIssue::new(format!("{path}.properties"), "must be an object"))
        }
    }
    if obj.get("required").is_some_and(|r| !r.is_array()) {
        issues.push(ValidationIssue::new(format!("{path}.required"), "must be an array"));
    }
}

fn check_metadata(metadata: &Value, issues: &mut Vec<ValidationIssue>) {
    let Some(metadata) = metadata.as_object() else {
        if !metadata.is_null() {
            issues.push(ValidationIssue::new("metadata", "must be an object"));
        }
        return;
    };
    for key in ["created_at", "updated_at"] {
        match metadata.get(key).and_then(Value::as_str) {
            Some(ts) if chrono::DateTime::parse_from_rfc3339(ts).is_ok() => {}
            _ => issues.push(ValidationIssue::new(
                format!("metadata.{key}"),
                "must be an RFC 3339 timestamp",
            )),
        }
    }
    match metadata.get("last_executed") {
        None | Some(Value::Null) => {}
        Some(Value::String(ts)) if chrono::DateTime::parse_from_rfc3339(ts).is_ok() => {}
        Some(_) => issues.push(ValidationIssue::new(
            "metadata.last_executed",
            "must be an RFC 3339 timestamp",
        )),
    }
    if metadata.get("execution_count").is_some_and(|c| c.as_u64().is_none()) {
        issues.push(ValidationIssue::new(
            "metadata.execution_count",
            "must be a non-negative integer",
        ));
    }
}

fn is_numeric(part: &str) -> bool {
    !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit())
}

/// `MAJOR.MINOR.PATCH`, digits only.
pub(crate) fn is_semver(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    parts.len() == 3 && parts.iter().all(|p| is_numeric(p))
}

/// One or more comma-separated clauses, each an operator followed by
/// `N.N` or `N.N.N` (e.g. `>=3.8`, `>=3.8,<=3.12`).
pub(crate) fn is_version_range(range: &str) -> bool {
    range.split(',').all(|clause| {
        let clause = clause.trim();
        VERSION_OPERATORS.iter().any(|op| {
            clause.strip_prefix(op).is_some_and(|rest| {
                let parts: Vec<&str> = rest.trim().split('.').collect();
                (2..=3).contains(&parts.len()) && parts.iter().all(|p| is_numeric(p))
            })
        })
    })
}
