use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::cache::content_hash;
use crate::config::SecurityConfig;
use crate::error::{Result, ScriptError};
use crate::manifest::Manifest;

use super::rules::RuleSet;
use super::{import_listed, is_within, normalize_path, FindingKind, SecurityFinding, SecurityReport};

const IMPORT_PATTERN: &str = r"^\s*import\s+(.+)$";
const FROM_IMPORT_PATTERN: &str = r"^\s*from\s+(\S+)\s+import\b";
const OPEN_PATTERN: &str = r#"\bopen\s*\(\s*[rRbBuUfF]{0,2}["']([^"']+)["']"#;
const PATHLIB_PATTERN: &str = concat!(
    r#"\bPath\s*\(\s*[rRbBuUfF]{0,2}["']([^"']+)["']\s*\)\s*\.\s*"#,
    r"(?:open|read_text|read_bytes|write_text|write_bytes)\b",
);

/// Static screen of a script source against the configured policy.
///
/// All six steps always run and all findings are collected: size ceiling,
/// imports (block-list and allow-list), literal file paths, dangerous call
/// patterns, requested resource limits versus policy ceilings, and the
/// declared content signature.
pub struct SecurityValidator {
    config: SecurityConfig,
    rules: RuleSet,
    import_re: Regex,
    from_import_re: Regex,
    open_re: Regex,
    pathlib_re: Regex,
}

impl SecurityValidator {
    pub fn new(config: SecurityConfig) -> Result<Self> {
        let rules = RuleSet::with_extra(&config.rules)?;
        Self::with_rules(config, rules)
    }

    pub fn with_rules(config: SecurityConfig, rules: RuleSet) -> Result<Self> {
        let compile = |p: &str| {
            Regex::new(p).map_err(|e| ScriptError::Config(format!("invalid builtin pattern: {e}")))
        };
        Ok(Self {
            import_re: compile(IMPORT_PATTERN)?,
            from_import_re: compile(FROM_IMPORT_PATTERN)?,
            open_re: compile(OPEN_PATTERN)?,
            pathlib_re: compile(PATHLIB_PATTERN)?,
            config,
            rules,
        })
    }

    pub fn validate_script(&self, script_path: &Path, manifest: &Manifest) -> SecurityReport {
        let mut findings = Vec::new();
        let script_dir = script_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let source = self.read_source(script_path, &mut findings);

        if let Some(source) = &source {
            let text = String::from_utf8_lossy(source);
            self.check_imports(&text, manifest, &mut findings);
            self.check_paths(&text, &script_dir, manifest, &mut findings);
            self.check_patterns(&text, &mut findings);
        }
        self.check_ceilings(manifest, &mut findings);
        if let Some(source) = &source {
            self.check_signature(source, manifest, &mut findings);
        }

        let report = SecurityReport::from_findings(findings);
        if report.is_valid {
            debug!(
                "Security screen passed for {} ({} warnings)",
                manifest.id(),
                report.warnings.len()
            );
        } else {
            info!(
                "Security screen rejected {}: {} errors",
                manifest.id(),
                report.errors.len()
            );
        }
        report
    }

    /// Size check first; a file over the ceiling is not read at all.
    fn read_source(&self, path: &Path, findings: &mut Vec<SecurityFinding>) -> Option<Vec<u8>> {
        let size = match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!("Cannot stat script {}: {e}", path.display());
                findings.push(SecurityFinding::error(
                    FindingKind::Unreadable,
                    format!("cannot read {}: {e}", path.display()),
                ));
                return None;
            }
        };
        if size > self.config.max_script_size {
            findings.push(SecurityFinding::error(
                FindingKind::FileSize,
                format!(
                    "script is {size} bytes, larger than the {} byte limit",
                    self.config.max_script_size
                ),
            ));
            return None;
        }
        match std::fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                findings.push(SecurityFinding::error(
                    FindingKind::Unreadable,
                    format!("cannot read {}: {e}", path.display()),
                ));
                None
            }
        }
    }

    fn check_imports(
        &self,
        source: &str,
        manifest: &Manifest,
        findings: &mut Vec<SecurityFinding>,
    ) {
        let mut allowed = self.config.allowed_imports.clone();
        if let Some(perms) = manifest.declared_permissions() {
            allowed.extend(perms.allowed_imports.iter().flatten().cloned());
        }

        for (line, module) in self.imports(source) {
            if import_listed(&module, &self.config.blocked_imports) {
                findings.push(
                    SecurityFinding::error(
                        FindingKind::BlockedImport(module.clone()),
                        format!("import of '{module}' is blocked"),
                    )
                    .at_line(line),
                );
            } else if !import_listed(&module, &allowed) {
                findings.push(
                    SecurityFinding::error(
                        FindingKind::UnlistedImport(module.clone()),
                        format!("import of '{module}' is not in the allow-list"),
                    )
                    .at_line(line),
                );
            }
        }
    }

    /// `(line, module)` for every absolute import statement.
    fn imports(&self, source: &str) -> Vec<(usize, String)> {
        let mut found = Vec::new();
        for (idx, line) in source.lines().enumerate() {
            let line_no = idx + 1;
            if let Some(caps) = self.from_import_re.captures(line) {
                let module = &caps[1];
                if !module.starts_with('.') {
                    found.push((line_no, module.to_string()));
                }
            } else if let Some(caps) = self.import_re.captures(line) {
                let list = caps[1].split('#').next().unwrap_or_default();
                for item in list.split(',') {
                    let module = item.split_whitespace().next().unwrap_or_default();
                    if !module.is_empty() {
                        found.push((line_no, module.to_string()));
                    }
                }
            }
        }
        found
    }

    fn check_paths(
        &self,
        source: &str,
        script_dir: &Path,
        manifest: &Manifest,
        findings: &mut Vec<SecurityFinding>,
    ) {
        let mut roots: Vec<PathBuf> = self
            .config
            .allowed_paths
            .iter()
            .map(|root| normalize_path(root, script_dir))
            .collect();
        if let Some(perms) = manifest.declared_permissions() {
            roots.extend(
                perms
                    .allowed_paths
                    .iter()
                    .flatten()
                    .map(|root| normalize_path(Path::new(root), script_dir)),
            );
        }

        for (idx, line) in source.lines().enumerate() {
            if line.trim_start().starts_with('#') {
                continue;
            }
            let literals = self
                .open_re
                .captures_iter(line)
                .chain(self.pathlib_re.captures_iter(line))
                .map(|caps| caps[1].to_string());
            for literal in literals {
                let resolved = normalize_path(Path::new(&literal), script_dir);
                if !is_within(&resolved, &roots) {
                    findings.push(
                        SecurityFinding::error(
                            FindingKind::PathAccess(literal.clone()),
                            format!(
                                "access to '{}' is outside the allowed paths",
                                resolved.display()
                            ),
                        )
                        .at_line(idx + 1),
                    );
                }
            }
        }
    }

    fn check_patterns(&self, source: &str, findings: &mut Vec<SecurityFinding>) {
        for hit in self.rules.scan(source) {
            findings.push(SecurityFinding {
                kind: FindingKind::Pattern(hit.rule_id),
                severity: hit.severity,
                message: hit.message,
                line: Some(hit.line),
            });
        }
    }

    fn check_ceilings(&self, manifest: &Manifest, findings: &mut Vec<SecurityFinding>) {
        let Some(requested) = &manifest.execution.resource_limits else {
            return;
        };
        let ceilings = &self.config.ceilings;
        let checks = [
            ("memory", requested.memory, ceilings.max_memory_mb, "MB"),
            ("cpu", requested.cpu, ceilings.max_cpu_percent, "%"),
            ("duration", requested.duration, ceilings.max_duration_secs, "s"),
        ];
        for (name, value, ceiling, unit) in checks {
            if let Some(value) = value {
                if value > ceiling {
                    findings.push(SecurityFinding::error(
                        FindingKind::ResourceCeiling(name.to_string()),
                        format!(
                            "requested {name} {value}{unit} exceeds the policy ceiling \
                             of {ceiling}{unit}"
                        ),
                    ));
                }
            }
        }
    }

    fn check_signature(
        &self,
        source: &[u8],
        manifest: &Manifest,
        findings: &mut Vec<SecurityFinding>,
    ) {
        let declared = manifest.validation.as_ref().and_then(|v| v.signature.as_deref());
        let Some(declared) = declared else {
            return;
        };
        let declared = declared.trim();
        let declared = declared.strip_prefix("sha256:").unwrap_or(declared);
        let actual = content_hash(source);
        if !declared.eq_ignore_ascii_case(&actual) {
            findings.push(SecurityFinding::error(
                FindingKind::Signature,
                format!("content hash {actual} does not match the declared signature"),
            ));
        }
    }
}

impl std::fmt::Debug for SecurityValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityValidator")
            .field("rules", &self.rules.len())
            .field("max_script_size", &self.config.max_script_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::tests::sample_manifest;
    use crate::manifest::{ManifestPermissions, ManifestResourceLimits, ValidationSpec};

    fn policy(dir: &Path) -> SecurityConfig {
        SecurityConfig {
            max_script_size: 4096,
            allowed_imports: vec!["json".into(), "os.path".into(), "sys".into()],
            blocked_imports: vec!["subprocess".into(), "socket".into(), "requests".into()],
            allowed_paths: vec![dir.join("data")],
            ..SecurityConfig::default()
        }
    }

    fn write_script(dir: &Path, source: &str) -> PathBuf {
        let path = dir.join("main.py");
        std::fs::write(&path, source).unwrap();
        path
    }

    fn kinds(report: &SecurityReport) -> Vec<String> {
        report.errors.iter().map(|f| f.kind.to_string()).collect()
    }

    #[test]
    fn test_clean_script_passes() {
        let dir = tempfile::tempdir().unwrap();
        let script =
            write_script(dir.path(), "import json\nimport sys\nprint(json.dumps(sys.argv))\n");
        let validator = SecurityValidator::new(policy(dir.path())).unwrap();
        let report = validator.validate_script(&script, &sample_manifest("a", "main.py"));
        assert!(report.is_valid, "{:?}", report.errors);
    }

    #[test]
    fn test_blocked_import_reported_even_with_allowed_imports() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "import json\nimport requests\nfrom subprocess import run\n",
        );
        let validator = SecurityValidator::new(policy(dir.path())).unwrap();
        let report = validator.validate_script(&script, &sample_manifest("a", "main.py"));
        assert!(!report.is_valid);
        let blocked: Vec<_> = report
            .errors
            .iter()
            .filter_map(|f| match &f.kind {
                FindingKind::BlockedImport(m) => Some(m.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(blocked, vec!["requests", "subprocess"]);
    }

    #[test]
    fn test_unlisted_and_blocked_both_reported() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "import numpy as np, socket\n");
        let validator = SecurityValidator::new(policy(dir.path())).unwrap();
        let report = validator.validate_script(&script, &sample_manifest("a", "main.py"));
        assert_eq!(kinds(&report), vec!["unlisted-import", "blocked-import"]);
        assert!(report.errors.iter().all(|f| f.line == Some(1)));
    }

    #[test]
    fn test_manifest_permissions_extend_allow_list_but_not_block_list() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "import numpy\nimport socket\n");
        let mut manifest = sample_manifest("a", "main.py");
        manifest.validation = Some(ValidationSpec {
            permissions: Some(ManifestPermissions {
                allowed_imports: Some(vec!["numpy".into(), "socket".into()]),
                ..ManifestPermissions::default()
            }),
            ..ValidationSpec::default()
        });
        let validator = SecurityValidator::new(policy(dir.path())).unwrap();
        let report = validator.validate_script(&script, &manifest);
        assert_eq!(kinds(&report), vec!["blocked-import"]);
    }

    #[test]
    fn test_relative_imports_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "from . import helpers\nfrom .util import x\n");
        let validator = SecurityValidator::new(policy(dir.path())).unwrap();
        assert!(validator.validate_script(&script, &sample_manifest("a", "main.py")).is_valid);
    }

    #[test]
    fn test_paths_outside_allowed_roots_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            concat!(
                "f = open('data/input.csv')\n",
                "g = open(\"/etc/passwd\", 'r')\n",
                "h = open('data/../../escape.txt')\n",
                "Path('/etc/shadow').read_text()\n",
            ),
        );
        let validator = SecurityValidator::new(policy(dir.path())).unwrap();
        let report = validator.validate_script(&script, &sample_manifest("a", "main.py"));
        let lines: Vec<_> = report.errors.iter().map(|f| f.line.unwrap()).collect();
        assert_eq!(kinds(&report), vec!["path-access", "path-access", "path-access"]);
        assert_eq!(lines, vec![2, 3, 4]);
    }

    #[test]
    fn test_dangerous_calls_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let script =
            write_script(dir.path(), "x = eval('1+1')\nexec(code)\nos.system('rm -rf /')\n");
        let validator = SecurityValidator::new(policy(dir.path())).unwrap();
        let report = validator.validate_script(&script, &sample_manifest("a", "main.py"));
        assert_eq!(kinds(&report), vec!["eval", "exec", "os-system"]);
    }

    #[test]
    fn test_oversized_file_rejected_without_scanning() {
        let dir = tempfile::tempdir().unwrap();
        let big = format!("import socket\n{}", "x = 1\n".repeat(2000));
        let script = write_script(dir.path(), &big);
        let validator = SecurityValidator::new(policy(dir.path())).unwrap();
        let report = validator.validate_script(&script, &sample_manifest("a", "main.py"));
        assert_eq!(kinds(&report), vec!["file-size"]);
    }

    #[test]
    fn test_requested_limits_above_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "import json\n");
        let mut manifest = sample_manifest("a", "main.py");
        manifest.execution.resource_limits = Some(ManifestResourceLimits {
            memory: Some(4096.0),
            cpu: Some(50.0),
            duration: Some(7200.0),
        });
        let validator = SecurityValidator::new(policy(dir.path())).unwrap();
        let report = validator.validate_script(&script, &manifest);
        assert_eq!(kinds(&report), vec!["resource-ceiling", "resource-ceiling"]);
    }

    #[test]
    fn test_signature_must_match_content_hash() {
        let dir = tempfile::tempdir().unwrap();
        let source = "import json\n";
        let script = write_script(dir.path(), source);
        let validator = SecurityValidator::new(policy(dir.path())).unwrap();

        let mut manifest = sample_manifest("a", "main.py");
        manifest.validation = Some(ValidationSpec {
            signature: Some(format!("sha256:{}", content_hash(source.as_bytes()))),
            ..ValidationSpec::default()
        });
        assert!(validator.validate_script(&script, &manifest).is_valid);

        std::fs::write(&script, "import json\nprint('tampered')\n").unwrap();
        let report = validator.validate_script(&script, &manifest);
        assert_eq!(kinds(&report), vec!["signature"]);
    }

    #[test]
    fn test_missing_file_still_checks_ceilings() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = sample_manifest("a", "main.py");
        manifest.execution.resource_limits = Some(ManifestResourceLimits {
            memory: Some(99999.0),
            ..ManifestResourceLimits::default()
        });
        let validator = SecurityValidator::new(policy(dir.path())).unwrap();
        let report = validator.validate_script(&dir.path().join("main.py"), &manifest);
        assert_eq!(kinds(&report), vec!["unreadable", "resource-ceiling"]);
    }

    #[test]
    fn test_warnings_do_not_reject() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "import json\ndata = pickle.loads(blob)\n");
        let validator = SecurityValidator::new(policy(dir.path())).unwrap();
        let report = validator.validate_script(&script, &sample_manifest("a", "main.py"));
        assert!(report.is_valid);
        assert_eq!(report.warnings.len(), 1);
    }
}
