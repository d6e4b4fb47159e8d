/// Per-script capability sets.
///
/// Effective permissions are layered: process-wide defaults, then the
/// script's overrides (field by field), then any unexpired temporary
/// grants. Subprocess and environment access have no override field at
/// all, so the only way to enable them is a time-boxed grant.
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::{Result, ScriptError};
use crate::manifest::ManifestPermissions;
use crate::security::{import_listed, is_within, normalize_path};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    pub allowed_imports: Vec<String>,
    pub allowed_paths: Vec<PathBuf>,
    pub allow_networking: bool,
    pub allow_file_system: bool,
    pub allow_subprocess: bool,
    pub allow_environment_access: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionKind {
    Import,
    Path,
    Networking,
    FileSystem,
    Subprocess,
    EnvironmentAccess,
}

impl fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PermissionKind::Import => "allowedImports",
            PermissionKind::Path => "allowedPaths",
            PermissionKind::Networking => "allowNetworking",
            PermissionKind::FileSystem => "allowFileSystem",
            PermissionKind::Subprocess => "allowSubprocess",
            PermissionKind::EnvironmentAccess => "allowEnvironmentAccess",
        };
        f.write_str(name)
    }
}

impl FromStr for PermissionKind {
    type Err = ScriptError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "allowedImports" | "import" => Ok(PermissionKind::Import),
            "allowedPaths" | "path" => Ok(PermissionKind::Path),
            "allowNetworking" | "networking" => Ok(PermissionKind::Networking),
            "allowFileSystem" | "filesystem" => Ok(PermissionKind::FileSystem),
            "allowSubprocess" | "subprocess" => Ok(PermissionKind::Subprocess),
            "allowEnvironmentAccess" | "environment" => Ok(PermissionKind::EnvironmentAccess),
            other => Err(ScriptError::Config(format!("unknown permission kind '{other}'"))),
        }
    }
}

/// Script-specific overrides. `None` keeps the default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionOverrides {
    pub allowed_imports: Option<Vec<String>>,
    pub allowed_paths: Option<Vec<PathBuf>>,
    pub allow_networking: Option<bool>,
    pub allow_file_system: Option<bool>,
}

impl PermissionOverrides {
    /// Overrides derived from a manifest. Subprocess and environment
    /// requests are not elevations; they are checked as requirements.
    pub fn from_manifest(perms: &ManifestPermissions) -> Self {
        Self {
            allowed_imports: perms.allowed_imports.clone(),
            allowed_paths: perms
                .allowed_paths
                .as_ref()
                .map(|paths| paths.iter().map(PathBuf::from).collect()),
            allow_networking: perms.allow_networking,
            allow_file_system: perms.allow_file_system,
        }
    }

    fn apply(&self, base: &mut PermissionSet) {
        if let Some(imports) = &self.allowed_imports {
            base.allowed_imports = imports.clone();
        }
        if let Some(paths) = &self.allowed_paths {
            base.allowed_paths = paths.clone();
        }
        if let Some(v) = self.allow_networking {
            base.allow_networking = v;
        }
        if let Some(v) = self.allow_file_system {
            base.allow_file_system = v;
        }
    }
}

/// A single elevated capability for a limited time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionGrant {
    Import(String),
    Path(PathBuf),
    Networking,
    FileSystem,
    Subprocess,
    EnvironmentAccess,
}

impl PermissionGrant {
    pub fn kind(&self) -> PermissionKind {
        match self {
            PermissionGrant::Import(_) => PermissionKind::Import,
            PermissionGrant::Path(_) => PermissionKind::Path,
            PermissionGrant::Networking => PermissionKind::Networking,
            PermissionGrant::FileSystem => PermissionKind::FileSystem,
            PermissionGrant::Subprocess => PermissionKind::Subprocess,
            PermissionGrant::EnvironmentAccess => PermissionKind::EnvironmentAccess,
        }
    }

    fn apply(&self, set: &mut PermissionSet) {
        match self {
            PermissionGrant::Import(module) => set.allowed_imports.push(module.clone()),
            PermissionGrant::Path(path) => set.allowed_paths.push(path.clone()),
            PermissionGrant::Networking => set.allow_networking = true,
            PermissionGrant::FileSystem => set.allow_file_system = true,
            PermissionGrant::Subprocess => set.allow_subprocess = true,
            PermissionGrant::EnvironmentAccess => set.allow_environment_access = true,
        }
    }
}

/// Result of diffing a required set against the effective one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionReport {
    pub is_valid: bool,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone)]
struct ActiveGrant {
    id: u64,
    grant: PermissionGrant,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct ScriptPermissions {
    overrides: PermissionOverrides,
    grants: Vec<ActiveGrant>,
}

#[derive(Debug, Default)]
struct PermissionState {
    scripts: HashMap<String, ScriptPermissions>,
    next_grant_id: u64,
}

#[derive(Debug, Clone)]
pub struct PermissionManager {
    defaults: PermissionSet,
    state: Arc<RwLock<PermissionState>>,
}

impl PermissionManager {
    /// Subprocess and environment access are forced off in the defaults
    /// whatever the caller passes.
    pub fn new(mut defaults: PermissionSet) -> Self {
        if defaults.allow_subprocess || defaults.allow_environment_access {
            warn!("Default permissions may not enable subprocess or environment access, ignoring");
        }
        defaults.allow_subprocess = false;
        defaults.allow_environment_access = false;
        Self {
            defaults,
            state: Arc::new(RwLock::new(PermissionState::default())),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, PermissionState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, PermissionState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn defaults(&self) -> &PermissionSet {
        &self.defaults
    }

    /// Effective permissions: defaults, overrides, then live grants.
    /// Expired grants found along the way are dropped.
    pub fn get_script_permissions(&self, script_id: &str) -> PermissionSet {
        let mut set = self.defaults.clone();
        let now = Instant::now();
        let has_expired = {
            let state = self.read();
            let Some(script) = state.scripts.get(script_id) else {
                return set;
            };
            script.overrides.apply(&mut set);
            for active in script.grants.iter().filter(|g| g.expires_at > now) {
                active.grant.apply(&mut set);
            }
            script.grants.iter().any(|g| g.expires_at <= now)
        };
        if has_expired {
            let mut state = self.write();
            if let Some(script) = state.scripts.get_mut(script_id) {
                let before = script.grants.len();
                script.grants.retain(|g| g.expires_at > now);
                debug!("Dropped {} expired grant(s) for {script_id}", before - script.grants.len());
            }
        }
        set
    }

    pub fn set_script_permissions(&self, script_id: &str, overrides: PermissionOverrides) {
        let mut state = self.write();
        state.scripts.entry(script_id.to_string()).or_default().overrides = overrides;
        debug!("Permissions updated for {script_id}");
    }

    /// Applies a manifest's declared capabilities as overrides. Requests
    /// for subprocess or environment access are not honoured here.
    pub fn apply_manifest_permissions(&self, script_id: &str, perms: &ManifestPermissions) {
        if perms.requests_subprocess() || perms.requests_environment_access() {
            info!(
                "Manifest for {script_id} requests subprocess/environment access; \
                 these require a temporary grant"
            );
        }
        self.set_script_permissions(script_id, PermissionOverrides::from_manifest(perms));
    }

    /// Drops overrides and grants for a script.
    pub fn clear_script(&self, script_id: &str) {
        self.write().scripts.remove(script_id);
    }

    pub fn check_permission(
        &self,
        script_id: &str,
        kind: PermissionKind,
        value: Option<&str>,
    ) -> bool {
        let set = self.get_script_permissions(script_id);
        match kind {
            PermissionKind::Import => value.is_some_and(|m| import_listed(m, &set.allowed_imports)),
            PermissionKind::Path => {
                value.is_some_and(|p| path_allowed(Path::new(p), &set.allowed_paths))
            }
            PermissionKind::Networking => set.allow_networking,
            PermissionKind::FileSystem => set.allow_file_system,
            PermissionKind::Subprocess => set.allow_subprocess,
            PermissionKind::EnvironmentAccess => set.allow_environment_access,
        }
    }

    /// Elevates one capability for `duration`. Reversion is automatic: a
    /// one-shot timer drops the grant, and reads ignore expired grants
    /// even before the timer fires. Returns the grant id.
    pub fn grant_temporary_permission(
        &self,
        script_id: &str,
        grant: PermissionGrant,
        duration: Duration,
    ) -> u64 {
        let id = {
            let mut state = self.write();
            state.next_grant_id += 1;
            let id = state.next_grant_id;
            state
                .scripts
                .entry(script_id.to_string())
                .or_default()
                .grants
                .push(ActiveGrant {
                    id,
                    grant: grant.clone(),
                    expires_at: Instant::now() + duration,
                });
            id
        };
        info!(
            "Temporary {} granted to {script_id} for {}ms",
            grant.kind(),
            duration.as_millis()
        );

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let state = Arc::clone(&self.state);
                let script_id = script_id.to_string();
                handle.spawn(async move {
                    tokio::time::sleep(duration).await;
                    let mut state = state.write().unwrap_or_else(|poisoned| poisoned.into_inner());
                    if let Some(script) = state.scripts.get_mut(&script_id) {
                        script.grants.retain(|g| g.id != id);
                    }
                    debug!("Temporary grant {id} for {script_id} expired");
                });
            }
            Err(_) => debug!("No async runtime, grant {id} expires lazily"),
        }
        id
    }

    pub fn validate_permissions(
        &self,
        script_id: &str,
        required: &PermissionSet,
    ) -> PermissionReport {
        let effective = self.get_script_permissions(script_id);
        let mut missing = Vec::new();

        let flags = [
            (required.allow_networking, effective.allow_networking, PermissionKind::Networking),
            (required.allow_file_system, effective.allow_file_system, PermissionKind::FileSystem),
            (required.allow_subprocess, effective.allow_subprocess, PermissionKind::Subprocess),
            (
                required.allow_environment_access,
                effective.allow_environment_access,
                PermissionKind::EnvironmentAccess,
            ),
        ];
        for (needed, granted, kind) in flags {
            if needed && !granted {
                missing.push(kind.to_string());
            }
        }
        for module in &required.allowed_imports {
            if !import_listed(module, &effective.allowed_imports) {
                missing.push(format!("import:{module}"));
            }
        }
        for path in &required.allowed_paths {
            if !path_allowed(path, &effective.allowed_paths) {
                missing.push(format!("path:{}", path.display()));
            }
        }

        PermissionReport {
            is_valid: missing.is_empty(),
            missing,
        }
    }

    /// JSON security profile for an in-interpreter sandbox wrapper,
    /// derived from the effective permissions.
    pub fn sandbox_profile(&self, script_id: &str) -> Value {
        profile_for(&self.get_script_permissions(script_id))
    }
}

/// Renders a permission set in the shape the interpreter-side wrapper
/// reads from `SCRIPT_SECURITY_PROFILE`.
pub fn profile_for(set: &PermissionSet) -> Value {
    let paths: Vec<String> = set
        .allowed_paths
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    let write_paths = if set.allow_file_system { paths.clone() } else { Vec::new() };
    json!({
        "allowed_imports": set.allowed_imports,
        "filesystem": {
            "read_paths": paths,
            "write_paths": write_paths,
            "allow_delete": false
        },
        "network": {
            "allowed_hosts": if set.allow_networking { vec!["*"] } else { Vec::new() },
            "allowed_ports": [],
            "allow_localhost": set.allow_networking
        },
        "system": {
            "allowed_calls": [],
            "allow_subprocesses": set.allow_subprocess
        },
        "environment": {
            "allow_access": set.allow_environment_access
        }
    })
}

fn path_allowed(path: &Path, roots: &[PathBuf]) -> bool {
    let base = Path::new("/");
    let path = normalize_path(path, base);
    let roots: Vec<PathBuf> = roots.iter().map(|r| normalize_path(r, base)).collect();
    is_within(&path, &roots)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> PermissionManager {
        PermissionManager::new(PermissionSet {
            allowed_imports: vec!["json".into(), "os.path".into()],
            allowed_paths: vec![PathBuf::from("/srv/data")],
            ..PermissionSet::default()
        })
    }

    #[test]
    fn test_defaults_apply_to_unknown_script() {
        let perms = manager().get_script_permissions("unknown");
        assert_eq!(perms.allowed_imports, vec!["json", "os.path"]);
        assert!(!perms.allow_networking);
        assert!(!perms.allow_subprocess);
    }

    #[test]
    fn test_defaults_cannot_enable_subprocess() {
        let manager = PermissionManager::new(PermissionSet {
            allow_subprocess: true,
            allow_environment_access: true,
            ..PermissionSet::default()
        });
        assert!(!manager.defaults().allow_subprocess);
        assert!(!manager.check_permission("a", PermissionKind::EnvironmentAccess, None));
    }

    #[test]
    fn test_overrides_merge_per_field() {
        let manager = manager();
        manager.set_script_permissions(
            "a",
            PermissionOverrides {
                allow_networking: Some(true),
                ..PermissionOverrides::default()
            },
        );
        let perms = manager.get_script_permissions("a");
        assert!(perms.allow_networking);
        assert_eq!(perms.allowed_imports, vec!["json", "os.path"]);
        assert!(!manager.get_script_permissions("b").allow_networking);
    }

    #[test]
    fn test_manifest_cannot_grant_subprocess_or_environment() {
        let manager = manager();
        manager.apply_manifest_permissions(
            "a",
            &ManifestPermissions {
                allow_networking: Some(true),
                allow_subprocess: Some(true),
                allow_environment_access: Some(true),
                ..ManifestPermissions::default()
            },
        );
        assert!(manager.check_permission("a", PermissionKind::Networking, None));
        assert!(!manager.check_permission("a", PermissionKind::Subprocess, None));
        assert!(!manager.check_permission("a", PermissionKind::EnvironmentAccess, None));
    }

    #[test]
    fn test_partial_manifest_keeps_undeclared_defaults() {
        let manager = PermissionManager::new(PermissionSet {
            allowed_imports: vec!["json".into()],
            allowed_paths: vec![PathBuf::from("/srv/data")],
            allow_file_system: true,
            ..PermissionSet::default()
        });
        let declared: ManifestPermissions =
            serde_json::from_value(json!({"allow_networking": true})).unwrap();
        manager.apply_manifest_permissions("a", &declared);

        let perms = manager.get_script_permissions("a");
        assert!(perms.allow_networking);
        assert!(perms.allow_file_system);
        assert_eq!(perms.allowed_imports, vec!["json"]);
        assert_eq!(perms.allowed_paths, vec![PathBuf::from("/srv/data")]);
    }

    #[test]
    fn test_manifest_can_explicitly_revoke_defaults() {
        let manager = PermissionManager::new(PermissionSet {
            allowed_imports: vec!["json".into()],
            allow_file_system: true,
            ..PermissionSet::default()
        });
        let declared: ManifestPermissions =
            serde_json::from_value(json!({"allowed_imports": [], "allow_file_system": false}))
                .unwrap();
        manager.apply_manifest_permissions("a", &declared);

        let perms = manager.get_script_permissions("a");
        assert!(!perms.allow_file_system);
        assert!(perms.allowed_imports.is_empty());
    }

    #[test]
    fn test_check_import_and_path_values() {
        let manager = manager();
        assert!(manager.check_permission("a", PermissionKind::Import, Some("os.path.join")));
        assert!(!manager.check_permission("a", PermissionKind::Import, Some("os")));
        assert!(!manager.check_permission("a", PermissionKind::Import, None));
        assert!(manager.check_permission("a", PermissionKind::Path, Some("/srv/data/in.csv")));
        assert!(!manager.check_permission("a", PermissionKind::Path, Some("/srv/data/../etc")));
        assert!(!manager.check_permission("a", PermissionKind::Path, Some("/srv/database")));
    }

    #[tokio::test]
    async fn test_temporary_grant_reverts_automatically() {
        let manager = manager();
        manager.grant_temporary_permission(
            "a",
            PermissionGrant::Networking,
            Duration::from_millis(50),
        );
        assert!(manager.check_permission("a", PermissionKind::Networking, None));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!manager.check_permission("a", PermissionKind::Networking, None));
    }

    #[tokio::test]
    async fn test_temporary_subprocess_grant_is_the_only_way_in() {
        let manager = manager();
        assert!(!manager.check_permission("a", PermissionKind::Subprocess, None));
        manager.grant_temporary_permission(
            "a",
            PermissionGrant::Subprocess,
            Duration::from_millis(30),
        );
        assert!(manager.check_permission("a", PermissionKind::Subprocess, None));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!manager.check_permission("a", PermissionKind::Subprocess, None));
    }

    #[tokio::test]
    async fn test_grant_does_not_clobber_later_overrides() {
        let manager = manager();
        manager.grant_temporary_permission(
            "a",
            PermissionGrant::Import("numpy".into()),
            Duration::from_millis(30),
        );
        manager.set_script_permissions(
            "a",
            PermissionOverrides {
                allow_file_system: Some(true),
                ..PermissionOverrides::default()
            },
        );
        assert!(manager.check_permission("a", PermissionKind::Import, Some("numpy")));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!manager.check_permission("a", PermissionKind::Import, Some("numpy")));
        assert!(manager.check_permission("a", PermissionKind::FileSystem, None));
    }

    #[test]
    fn test_grant_without_runtime_expires_on_read() {
        let manager = manager();
        manager.grant_temporary_permission(
            "a",
            PermissionGrant::FileSystem,
            Duration::from_millis(10),
        );
        assert!(manager.check_permission("a", PermissionKind::FileSystem, None));
        std::thread::sleep(Duration::from_millis(30));
        assert!(!manager.check_permission("a", PermissionKind::FileSystem, None));
    }

    #[test]
    fn test_expired_grants_are_removed_on_lookup() {
        let manager = manager();
        manager.grant_temporary_permission(
            "a",
            PermissionGrant::Networking,
            Duration::from_millis(10),
        );
        manager.grant_temporary_permission(
            "a",
            PermissionGrant::FileSystem,
            Duration::from_secs(60),
        );
        std::thread::sleep(Duration::from_millis(30));

        let perms = manager.get_script_permissions("a");
        assert!(!perms.allow_networking);
        assert!(perms.allow_file_system);
        let state = manager.read();
        let grants = &state.scripts["a"].grants;
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].grant, PermissionGrant::FileSystem);
    }

    #[test]
    fn test_validate_permissions_lists_missing() {
        let manager = manager();
        let required = PermissionSet {
            allowed_imports: vec!["json".into(), "numpy".into()],
            allowed_paths: vec![PathBuf::from("/srv/data/x"), PathBuf::from("/home")],
            allow_networking: true,
            allow_subprocess: true,
            ..PermissionSet::default()
        };
        let report = manager.validate_permissions("a", &required);
        assert!(!report.is_valid);
        assert_eq!(
            report.missing,
            vec!["allowNetworking", "allowSubprocess", "import:numpy", "path:/home"]
        );
        assert!(manager.validate_permissions("a", &PermissionSet::default()).is_valid);
    }

    #[test]
    fn test_clear_script_drops_overrides() {
        let manager = manager();
        manager.set_script_permissions(
            "a",
            PermissionOverrides {
                allow_networking: Some(true),
                ..PermissionOverrides::default()
            },
        );
        manager.clear_script("a");
        assert!(!manager.check_permission("a", PermissionKind::Networking, None));
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!(
            "allowNetworking".parse::<PermissionKind>().unwrap(),
            PermissionKind::Networking
        );
        assert_eq!("subprocess".parse::<PermissionKind>().unwrap(), PermissionKind::Subprocess);
        assert!("allowRoot".parse::<PermissionKind>().is_err());
        assert_eq!(PermissionKind::EnvironmentAccess.to_string(), "allowEnvironmentAccess");
    }

    #[test]
    fn test_sandbox_profile_shape() {
        let manager = manager();
        let profile = manager.sandbox_profile("a");
        assert_eq!(profile["allowed_imports"][0], "json");
        assert_eq!(profile["filesystem"]["read_paths"][0], "/srv/data");
        assert_eq!(profile["filesystem"]["write_paths"].as_array().unwrap().len(), 0);
        assert_eq!(profile["network"]["allowed_hosts"].as_array().unwrap().len(), 0);
        assert_eq!(profile["system"]["allow_subprocesses"], false);
        assert_eq!(profile["environment"]["allow_access"], false);
    }
}
