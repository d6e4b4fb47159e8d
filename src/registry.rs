/// Script registry: the validated-once, cache-checked front door.
///
/// Registration loads a manifest, skips validation when the cache entry
/// still matches the script file, and otherwise runs the manifest and
/// security validators. A script that passes gets its manifest-declared
/// permissions and limits installed as overrides.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::ScriptCache;
use crate::error::{Result, ScriptError, ValidationIssue};
use crate::events::EventBus;
use crate::execution::manifest_dir;
use crate::manifest::{Manifest, ManifestValidator, ValidationReport};
use crate::sandbox::limits::{LimitOverrides, ResourceLimitsManager};
use crate::sandbox::permissions::PermissionManager;
use crate::security::{SecurityReport, SecurityValidator};

/// Full validation outcome for one manifest file.
#[derive(Debug, Clone)]
pub struct CheckReport {
    pub script_id: String,
    /// Present when the document is structurally sound
    pub manifest: Option<Manifest>,
    pub validation: ValidationReport,
    /// Present when the manifest passed and the entry point could be read
    pub security: Option<SecurityReport>,
}

impl CheckReport {
    pub fn is_valid(&self) -> bool {
        self.validation.is_valid && self.security.as_ref().is_some_and(|s| s.is_valid)
    }

    /// Every error as a display line, manifest problems first.
    pub fn error_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> =
            self.validation.errors.iter().map(ToString::to_string).collect();
        if let Some(security) = &self.security {
            lines.extend(security.errors.iter().map(ToString::to_string));
        }
        lines
    }

    pub fn warning_lines(&self) -> Vec<String> {
        self.security
            .as_ref()
            .map(|s| s.warnings.iter().map(ToString::to_string).collect())
            .unwrap_or_default()
    }

    fn into_error(self) -> ScriptError {
        if !self.validation.is_valid {
            return ScriptError::Validation(self.validation.errors);
        }
        match self.security {
            Some(security) => ScriptError::SecurityViolation(security.errors),
            None => ScriptError::Validation(vec![ValidationIssue::new(
                "manifest",
                "could not be checked",
            )]),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegisteredScript {
    pub manifest: Manifest,
    pub manifest_path: PathBuf,
    pub base_dir: PathBuf,
    pub entry_point: PathBuf,
    /// True when validation was skipped thanks to a valid cache entry
    pub from_cache: bool,
    pub warnings: Vec<String>,
}

pub struct ScriptRegistry {
    validator: ManifestValidator,
    security: SecurityValidator,
    cache: ScriptCache,
    permissions: Arc<PermissionManager>,
    limits: Arc<ResourceLimitsManager>,
    events: Arc<EventBus>,
    /// Registered id → manifest path
    known: Mutex<HashMap<String, PathBuf>>,
}

impl ScriptRegistry {
    pub fn new(
        security: SecurityValidator,
        cache: ScriptCache,
        permissions: Arc<PermissionManager>,
        limits: Arc<ResourceLimitsManager>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            validator: ManifestValidator::new(),
            security,
            cache,
            permissions,
            limits,
            events,
            known: Mutex::new(HashMap::new()),
        }
    }

    fn known(&self) -> MutexGuard<'_, HashMap<String, PathBuf>> {
        self.known.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn cache(&self) -> &ScriptCache {
        &self.cache
    }

    pub fn is_registered(&self, script_id: &str) -> bool {
        self.known().contains_key(script_id)
    }

    /// Runs manifest and security validation on a manifest file without
    /// registering anything.
    pub fn check(&self, manifest_path: &Path) -> Result<CheckReport> {
        let content = std::fs::read_to_string(manifest_path)
            .map_err(|e| ScriptError::FileSystem(format!("{}: {e}", manifest_path.display())))?;
        let doc: Value = serde_json::from_str(&content).map_err(|e| {
            ScriptError::Validation(vec![ValidationIssue::new(
                "manifest",
                format!("invalid JSON: {e}"),
            )])
        })?;
        let base_dir = manifest_dir(manifest_path);
        let script_id = doc
            .pointer("/script_info/id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| manifest_path.display().to_string());

        let validation = self.validator.validate(&doc, &base_dir);
        let mut manifest = None;
        let mut security = None;
        if validation.is_valid {
            let typed = Manifest::from_value(doc)?;
            security = Some(
                self.security
                    .validate_script(&typed.entry_point_path(&base_dir), &typed),
            );
            manifest = Some(typed);
        }

        Ok(CheckReport {
            script_id,
            manifest,
            validation,
            security,
        })
    }

    /// Registers (or refreshes) the script described by `manifest_path`.
    pub fn register(&self, manifest_path: &Path) -> Result<RegisteredScript> {
        let base_dir = manifest_dir(manifest_path);

        if let Ok(manifest) = Manifest::load(manifest_path) {
            let entry_point = manifest.entry_point_path(&base_dir);
            if self.cache_hit(&manifest, &entry_point) {
                debug!("Cache hit for {}, skipping validation", manifest.id());
                self.install_policy(&manifest);
                self.announce(&manifest, manifest_path);
                return Ok(RegisteredScript {
                    manifest,
                    manifest_path: manifest_path.to_path_buf(),
                    base_dir,
                    entry_point,
                    from_cache: true,
                    warnings: Vec::new(),
                });
            }
        }

        let script_id = peek_id(manifest_path);
        self.events.notify_validation_started(&script_id);
        let report = match self.check(manifest_path) {
            Ok(report) => report,
            Err(e) => {
                self.events.notify_validation_failed(&script_id, vec![e.to_string()]);
                return Err(e);
            }
        };

        if !report.is_valid() {
            let errors = report.error_lines();
            warn!("Validation failed for {} ({} problems)", report.script_id, errors.len());
            self.events.notify_validation_failed(&report.script_id, errors);
            return Err(report.into_error());
        }

        let warnings = report.warning_lines();
        let Some(manifest) = report.manifest else {
            return Err(ScriptError::Validation(vec![ValidationIssue::new(
                "manifest",
                "could not be checked",
            )]));
        };
        self.events.notify_validation_completed(manifest.id(), warnings.clone());

        let entry_point = manifest.entry_point_path(&base_dir);
        match self
            .cache
            .set(manifest.id(), manifest.script_info.clone(), manifest.clone(), &entry_point)
        {
            Ok(()) => self.events.notify_cache_updated(manifest.id()),
            Err(e) => {
                warn!("Could not cache {}: {e}", manifest.id());
                self.events.notify_cache_error(manifest.id(), &e.to_string());
            }
        }

        self.install_policy(&manifest);
        self.announce(&manifest, manifest_path);
        info!("Registered {} {}", manifest.id(), manifest.script_info.version);

        Ok(RegisteredScript {
            manifest,
            manifest_path: manifest_path.to_path_buf(),
            base_dir,
            entry_point,
            from_cache: false,
            warnings,
        })
    }

    /// Forgets a script: cache entry, permission and limit overrides.
    /// Returns whether anything was known about it.
    pub fn unregister(&self, script_id: &str) -> bool {
        let was_known = self.known().remove(script_id).is_some();
        let was_cached = match self.cache.invalidate(script_id) {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Could not invalidate cache for {script_id}: {e}");
                self.events.notify_cache_error(script_id, &e.to_string());
                false
            }
        };
        self.permissions.clear_script(script_id);
        self.limits.clear_script_limits(script_id);
        if was_known || was_cached {
            self.events.notify_script_deleted(script_id);
            info!("Unregistered {script_id}");
        }
        was_known || was_cached
    }

    /// Persists run metadata after an execution. Failures are logged, not
    /// propagated. Returns whether the save succeeded.
    pub fn record_execution(&self, manifest_path: &Path, manifest: &mut Manifest) -> bool {
        match manifest.save(manifest_path) {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not save run metadata for {}: {e}", manifest.id());
                false
            }
        }
    }

    pub fn clear_cache(&self) -> Result<()> {
        self.cache.clear()?;
        self.events.notify_cache_cleared();
        Ok(())
    }

    /// The cached result still applies when the script file is unchanged
    /// and the manifest's policy-relevant sections are identical. Run
    /// metadata is ignored.
    fn cache_hit(&self, manifest: &Manifest, entry_point: &Path) -> bool {
        if !self.cache.is_valid(manifest.id(), entry_point) {
            return false;
        }
        self.cache.get(manifest.id()).is_some_and(|entry| {
            entry.manifest.script_info == manifest.script_info
                && entry.manifest.execution == manifest.execution
                && entry.manifest.validation == manifest.validation
        })
    }

    fn install_policy(&self, manifest: &Manifest) {
        let id = manifest.id();
        match manifest.declared_permissions() {
            Some(perms) => self.permissions.apply_manifest_permissions(id, perms),
            None => self.permissions.clear_script(id),
        }
        match &manifest.execution.resource_limits {
            Some(limits) => {
                self.limits.set_script_limits(id, LimitOverrides::from_manifest(limits))
            }
            None => self.limits.clear_script_limits(id),
        }
    }

    fn announce(&self, manifest: &Manifest, manifest_path: &Path) {
        let previous = self
            .known()
            .insert(manifest.id().to_string(), manifest_path.to_path_buf());
        let info = &manifest.script_info;
        match previous {
            None => self.events.notify_script_created(&info.id, &info.name, &info.version),
            Some(_) => self.events.notify_script_updated(&info.id, &info.version),
        }
    }
}

impl std::fmt::Debug for ScriptRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRegistry")
            .field("cache", &self.cache)
            .field("registered", &self.known().len())
            .finish_non_exhaustive()
    }
}

/// Script id from a manifest file, falling back to the path when the
/// document cannot be read.
fn peek_id(manifest_path: &Path) -> String {
    std::fs::read_to_string(manifest_path)
        .ok()
        .and_then(|content| serde_json::from_str::<Value>(&content).ok())
        .and_then(|doc| doc.pointer("/script_info/id").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| manifest_path.display().to_string())
}
