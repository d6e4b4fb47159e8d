use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sandbox::limits::ResourceLimits;
use crate::sandbox::permissions::PermissionSet;
use crate::security::rules::RuleConfig;

/// Host configuration. Every section has defaults, so an empty file (or
/// no file at all) yields a usable configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub runtime: RuntimeConfig,
    pub limits: ResourceLimits,
    pub monitor: MonitorConfig,
    pub security: SecurityConfig,
    pub permissions: PermissionsConfig,
    pub cache: CacheConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Interpreter binary invoked as `<interpreter> <entry_point> --name=value...`
    pub interpreter: PathBuf,
    /// Wall-clock cap for `pip install`. Script runs use the effective
    /// `max_duration_secs` limit.
    pub install_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            interpreter: PathBuf::from("python3"),
            install_timeout_secs: 600,
        }
    }
}

impl RuntimeConfig {
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MonitorConfig {
    pub sample_interval_ms: u64,
    pub check_interval_ms: u64,
    /// Ring buffer size for usage samples of one execution
    pub history_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 1000,
            check_interval_ms: 1000,
            history_capacity: 1000,
        }
    }
}

impl MonitorConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }
}

/// Upper bounds a manifest may request for its own resource limits.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LimitCeilings {
    pub max_memory_mb: f64,
    pub max_cpu_percent: f64,
    pub max_duration_secs: f64,
}

impl Default for LimitCeilings {
    fn default() -> Self {
        Self {
            max_memory_mb: 2048.0,
            max_cpu_percent: 100.0,
            max_duration_secs: 3600.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SecurityConfig {
    /// Scripts larger than this (bytes) are rejected unread
    pub max_script_size: u64,
    /// Modules a script may import. Entries match the module itself and
    /// its submodules (`os.path` allows `os.path.join`).
    pub allowed_imports: Vec<String>,
    /// Modules that are rejected even when allow-listed
    pub blocked_imports: Vec<String>,
    /// Roots that literal `open()` paths must stay under. Relative roots
    /// are resolved against the script's directory.
    pub allowed_paths: Vec<PathBuf>,
    pub ceilings: LimitCeilings,
    /// Extra pattern rules appended to the builtin set
    pub rules: Vec<RuleConfig>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_script_size: 1024 * 1024,
            allowed_imports: [
                "os.path", "sys", "typing", "json", "datetime", "math", "re", "collections",
                "itertools", "functools", "pathlib", "argparse", "csv", "logging", "dataclasses",
                "enum", "string", "statistics", "random", "time",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            blocked_imports: [
                "subprocess", "socket", "requests", "urllib.request", "http.client", "pty",
                "smtplib", "ftplib", "ctypes", "multiprocessing",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            allowed_paths: vec![PathBuf::from(".")],
            ceilings: LimitCeilings::default(),
            rules: Vec::new(),
        }
    }
}

/// Process-wide default capabilities. Subprocess and environment access
/// are deliberately absent: they default to `false` and can only be
/// enabled by a temporary grant.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct PermissionsConfig {
    pub allowed_imports: Vec<String>,
    pub allowed_paths: Vec<PathBuf>,
    pub allow_networking: bool,
    pub allow_file_system: bool,
}

impl PermissionsConfig {
    pub fn to_permission_set(&self) -> PermissionSet {
        PermissionSet {
            allowed_imports: self.allowed_imports.clone(),
            allowed_paths: self.allowed_paths.clone(),
            allow_networking: self.allow_networking,
            allow_file_system: self.allow_file_system,
            allow_subprocess: false,
            allow_environment_access: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub path: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/cache.json"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EventsConfig {
    /// Events kept per script, oldest dropped first
    pub history_capacity: usize,
    /// Buffer of the live broadcast channel
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            channel_capacity: 256,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses TOML, then expands `${VAR}` references inside string
    /// values. Comments and keys are never expanded.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let mut doc: toml::Value = toml::from_str(content)?;
        expand_env(&mut doc)?;
        let config: Config = doc.try_into()?;
        Ok(config)
    }
}

fn expand_env(value: &mut toml::Value) -> anyhow::Result<()> {
    match value {
        toml::Value::String(s) => {
            let expanded = shellexpand::env(s.as_str())?.into_owned();
            *s = expanded;
        }
        toml::Value::Array(items) => {
            for item in items {
                expand_env(item)?;
            }
        }
        toml::Value::Table(table) => {
            for (_, item) in table.iter_mut() {
                expand_env(item)?;
            }
        }
        _ => {}
    }
    Ok(())
}
