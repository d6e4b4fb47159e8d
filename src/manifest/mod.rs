//! Script manifest: the declarative document describing a script's identity,
//! entry point, arguments, dependencies and resource/permission policy.
//!
//! Manifests are produced by the template/registry layer; this crate only
//! reads, validates and updates their run metadata.

pub mod validator;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, ScriptError, ValidationIssue};

pub use validator::{ManifestValidator, ValidationReport};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub script_info: ScriptInfo,
    pub execution: ExecutionSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ManifestMetadata>,
}

/// Identity of a script. `id` is globally unique and never changes once
/// the script is registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSpec {
    /// Path of the script file, relative to the manifest's directory.
    pub entry_point: String,
    /// Interpreter version range, e.g. `>=3.8`.
    pub python_version: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub arguments: Vec<ArgumentSpec>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_limits: Option<ManifestResourceLimits>,
}

/// A declared script argument. `arg_type` is one of `string`, `number`,
/// `boolean`, `array`, `object`; any other value is a custom type that
/// accepts every JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgumentSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub arg_type: String,
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

/// Resource limits requested by the manifest (memory in MB, cpu in
/// percent, duration in seconds).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    /// Hex SHA-256 of the entry point source, optionally prefixed `sha256:`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<ManifestPermissions>,
}

/// Capabilities a manifest asks for. Absent fields leave the host
/// defaults in place.
///
/// Imports, paths, networking and filesystem access are applied as script
/// overrides at registration. Subprocess and environment access are only
/// ever checked as requirements: a manifest cannot grant them to itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestPermissions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_imports: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_paths: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_networking: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_file_system: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_subprocess: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_environment_access: Option<bool>,
}

impl ManifestPermissions {
    pub fn requests_subprocess(&self) -> bool {
        self.allow_subprocess == Some(true)
    }

    pub fn requests_environment_access(&self) -> bool {
        self.allow_environment_access == Some(true)
    }
}

/// Run statistics. Updated by the execution manager after every run that
/// reached a normal process exit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_count: u64,
}

impl ManifestMetadata {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            updated_at: now,
            last_executed: None,
            execution_count: 0,
        }
    }
}

impl Default for ManifestMetadata {
    fn default() -> Self {
        Self::new()
    }
}

impl Manifest {
    pub fn id(&self) -> &str {
        &self.script_info.id
    }

    /// Reads a manifest file. The raw document is checked with the
    /// structural validator first so that a malformed file reports every
    /// problem instead of the first serde error.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ScriptError::FileSystem(format!("{}: {e}", path.display())))?;
        let doc: Value = serde_json::from_str(&content).map_err(|e| {
            ScriptError::Validation(vec![ValidationIssue::new(
                "manifest",
                format!("invalid JSON: {e}"),
            )])
        })?;
        Self::from_value(doc)
    }

    /// Converts a raw document into a typed manifest, reporting all
    /// structural problems at once. Does not check the entry point on disk.
    pub fn from_value(doc: Value) -> Result<Self> {
        let issues = ManifestValidator::new().check_structure(&doc);
        if !issues.is_empty() {
            return Err(ScriptError::Validation(issues));
        }
        serde_json::from_value(doc).map_err(|e| {
            ScriptError::Validation(vec![ValidationIssue::new("manifest", e.to_string())])
        })
    }

    /// Writes the manifest as 2-space indented JSON, stamping
    /// `metadata.updated_at`.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        let metadata = self.metadata.get_or_insert_with(ManifestMetadata::new);
        metadata.updated_at = Utc::now().max(metadata.created_at);

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ScriptError::FileSystem(format!("serialize manifest: {e}")))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, json + "\n")?;
        debug!("Saved manifest {} to {}", self.id(), path.display());
        Ok(())
    }

    /// Absolute path of the entry point for a manifest stored in `base_dir`.
    pub fn entry_point_path(&self, base_dir: &Path) -> PathBuf {
        base_dir.join(&self.execution.entry_point)
    }

    /// Records a run that reached a normal process exit.
    pub fn record_execution(&mut self, at: DateTime<Utc>) {
        let metadata = self.metadata.get_or_insert_with(ManifestMetadata::new);
        metadata.execution_count += 1;
        metadata.last_executed = Some(at);
        metadata.updated_at = at;
    }

    pub fn declared_permissions(&self) -> Option<&ManifestPermissions> {
        self.validation.as_ref().and_then(|v| v.permissions.as_ref())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// A complete, valid manifest document for `entry_point`.
    pub(crate) fn sample_document(id: &str, entry_point: &str) -> Value {
        json!({
            "script_info": {
                "id": id,
                "name": "Text analyzer",
                "version": "1.2.0",
                "description": "Counts words in a file",
                "author": "Jane",
                "category": "analysis",
                "tags": ["text"]
            },
            "execution": {
                "entry_point": entry_point,
                "python_version": ">=3.8",
                "dependencies": [],
                "arguments": [
                    {
                        "name": "input",
                        "type": "string",
                        "description": "Input file",
                        "required": true
                    },
                    {"name": "limit", "type": "number", "description": "Max words"}
                ],
                "environment": {"MODE": "batch"}
            }
        })
    }

    pub(crate) fn sample_manifest(id: &str, entry_point: &str) -> Manifest {
        Manifest::from_value(sample_document(id, entry_point)).unwrap()
    }

    #[test]
    fn test_from_value_parses_defaults() {
        let manifest = sample_manifest("text-analyzer", "main.py");
        assert_eq!(manifest.id(), "text-analyzer");
        assert_eq!(manifest.execution.arguments.len(), 2);
        assert!(manifest.execution.arguments[0].required);
        assert!(!manifest.execution.arguments[1].required);
        assert!(manifest.validation.is_none());
        assert!(manifest.metadata.is_none());
    }

    #[test]
    fn test_from_value_reports_all_structure_errors() {
        let err = Manifest::from_value(json!({"script_info": {"id": "x"}})).unwrap_err();
        match err {
            ScriptError::Validation(issues) => {
                // name, version, description, author, category, entry_point, python_version
                assert_eq!(issues.len(), 7);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_save_uses_two_space_indent_and_stamps_updated_at() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let mut manifest = sample_manifest("a", "main.py");

        manifest.save(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.starts_with("{\n  \"script_info\": {\n    \"id\": \"a\""));
        let reloaded = Manifest::load(&path).unwrap();
        let metadata = reloaded.metadata.unwrap();
        assert_eq!(metadata.execution_count, 0);
        assert!(metadata.updated_at >= metadata.created_at);
    }

    #[test]
    fn test_save_restamps_updated_at_every_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let mut manifest = sample_manifest("a", "main.py");
        manifest.save(&path).unwrap();
        let first = manifest.metadata.as_ref().unwrap().updated_at;

        std::thread::sleep(std::time::Duration::from_millis(5));
        manifest.save(&path).unwrap();
        let second = manifest.metadata.as_ref().unwrap().updated_at;
        assert!(second > first);
    }

    #[test]
    fn test_first_save_never_stamps_before_creation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        for _ in 0..50 {
            let mut manifest = sample_manifest("a", "main.py");
            manifest.save(&path).unwrap();
            let metadata = manifest.metadata.as_ref().unwrap();
            assert!(metadata.updated_at >= metadata.created_at);
        }

        // A creation time ahead of the local clock still orders correctly.
        let mut manifest = sample_manifest("a", "main.py");
        let ahead = Utc::now() + chrono::Duration::hours(1);
        manifest.metadata = Some(ManifestMetadata {
            created_at: ahead,
            updated_at: ahead,
            last_executed: None,
            execution_count: 0,
        });
        manifest.save(&path).unwrap();
        assert_eq!(manifest.metadata.unwrap().updated_at, ahead);
    }

    #[test]
    fn test_load_rejects_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            Manifest::load(&path),
            Err(ScriptError::Validation(_))
        ));
    }

    #[test]
    fn test_record_execution_increments_count() {
        let mut manifest = sample_manifest("a", "main.py");
        let at = Utc::now();
        manifest.record_execution(at);
        manifest.record_execution(at);
        let metadata = manifest.metadata.unwrap();
        assert_eq!(metadata.execution_count, 2);
        assert_eq!(metadata.last_executed, Some(at));
    }

    #[test]
    fn test_manifest_cannot_smuggle_unknown_permission_fields() {
        let mut doc = sample_document("a", "main.py");
        doc["validation"] = json!({
            "permissions": {"allow_networking": true, "allow_root": true}
        });
        let manifest = Manifest::from_value(doc).unwrap();
        let perms = manifest.declared_permissions().unwrap();
        assert_eq!(perms.allow_networking, Some(true));
        assert_eq!(perms.allow_subprocess, None);
        assert_eq!(perms.allowed_imports, None);
    }
}
