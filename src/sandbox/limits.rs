/// Resource ceilings and the limit-check loop.
///
/// The limits manager only detects breaches: it appends to the violation
/// log and notifies subscribers. Killing the process is the caller's job.
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::error::{Result, ScriptError};
use crate::manifest::ManifestResourceLimits;

use super::monitor::{ProbeFactory, ResourceMonitor, ResourceUsage, UsageHistory};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub max_memory_mb: f64,
    pub max_cpu_percent: f64,
    pub max_duration_secs: f64,
    pub max_file_size_bytes: u64,
    pub max_open_files: u64,
    pub max_threads: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: 512.0,
            max_cpu_percent: 90.0,
            max_duration_secs: 300.0,
            max_file_size_bytes: 10 * 1024 * 1024,
            max_open_files: 256,
            max_threads: 64,
        }
    }
}

impl ResourceLimits {
    pub fn max_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.max_duration_secs).unwrap_or(Duration::MAX)
    }
}

/// Per-field script overrides, merged shallowly over the defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LimitOverrides {
    pub max_memory_mb: Option<f64>,
    pub max_cpu_percent: Option<f64>,
    pub max_duration_secs: Option<f64>,
    pub max_file_size_bytes: Option<u64>,
    pub max_open_files: Option<u64>,
    pub max_threads: Option<u64>,
}

impl LimitOverrides {
    pub fn from_manifest(limits: &ManifestResourceLimits) -> Self {
        Self {
            max_memory_mb: limits.memory,
            max_cpu_percent: limits.cpu,
            max_duration_secs: limits.duration,
            ..Self::default()
        }
    }

    pub fn merge_over(&self, defaults: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            max_memory_mb: self.max_memory_mb.unwrap_or(defaults.max_memory_mb),
            max_cpu_percent: self.max_cpu_percent.unwrap_or(defaults.max_cpu_percent),
            max_duration_secs: self.max_duration_secs.unwrap_or(defaults.max_duration_secs),
            max_file_size_bytes: self.max_file_size_bytes.unwrap_or(defaults.max_file_size_bytes),
            max_open_files: self.max_open_files.unwrap_or(defaults.max_open_files),
            max_threads: self.max_threads.unwrap_or(defaults.max_threads),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    #[serde(rename = "maxMemory")]
    Memory,
    #[serde(rename = "maxCpu")]
    Cpu,
    #[serde(rename = "maxDuration")]
    Duration,
    #[serde(rename = "maxFileSize")]
    FileSize,
    #[serde(rename = "maxOpenFiles")]
    OpenFiles,
    #[serde(rename = "maxThreads")]
    Threads,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Memory => "maxMemory",
            ResourceKind::Cpu => "maxCpu",
            ResourceKind::Duration => "maxDuration",
            ResourceKind::FileSize => "maxFileSize",
            ResourceKind::OpenFiles => "maxOpenFiles",
            ResourceKind::Threads => "maxThreads",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub script_id: String,
    pub resource: ResourceKind,
    pub limit: f64,
    pub current: f64,
    pub timestamp: DateTime<Utc>,
}

impl Violation {
    pub fn to_error(&self) -> ScriptError {
        ScriptError::ResourceLimitExceeded {
            resource: self.resource,
            limit: self.limit,
            current: self.current,
        }
    }
}

/// Compares the latest sample against `limits`. Memory and CPU use the
/// instantaneous reading; duration runs from the first sample to `now`.
/// File size is not sampled here.
pub fn check_usage(
    limits: &ResourceLimits,
    first: &ResourceUsage,
    latest: &ResourceUsage,
    now: DateTime<Utc>,
) -> Vec<(ResourceKind, f64, f64)> {
    let mut breaches = Vec::new();
    if latest.current_memory > limits.max_memory_mb {
        breaches.push((ResourceKind::Memory, limits.max_memory_mb, latest.current_memory));
    }
    if latest.current_cpu > limits.max_cpu_percent {
        breaches.push((ResourceKind::Cpu, limits.max_cpu_percent, latest.current_cpu));
    }
    let elapsed = (now - first.timestamp).num_milliseconds() as f64 / 1000.0;
    if elapsed > limits.max_duration_secs {
        breaches.push((ResourceKind::Duration, limits.max_duration_secs, elapsed));
    }
    if let Some(open) = latest.open_files {
        if open > limits.max_open_files {
            breaches.push((ResourceKind::OpenFiles, limits.max_open_files as f64, open as f64));
        }
    }
    if let Some(threads) = latest.threads {
        if threads > limits.max_threads {
            breaches.push((ResourceKind::Threads, limits.max_threads as f64, threads as f64));
        }
    }
    breaches
}

/// Peak and average usage over one monitoring session.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct UsageReport {
    pub peak_memory_mb: f64,
    pub peak_cpu_percent: f64,
    pub average_memory_mb: f64,
    pub average_cpu_percent: f64,
    pub samples: usize,
}

impl UsageReport {
    fn from_history(history: &UsageHistory) -> Self {
        let peak = history.peak().unwrap_or_default();
        let average = history.average().unwrap_or_default();
        Self {
            peak_memory_mb: peak.memory,
            peak_cpu_percent: peak.cpu,
            average_memory_mb: average.memory,
            average_cpu_percent: average.cpu,
            samples: history.len(),
        }
    }
}

type ViolationLog = Arc<RwLock<HashMap<String, Vec<Violation>>>>;

struct MonitoringSession {
    monitor: ResourceMonitor,
    check_task: JoinHandle<()>,
}

pub struct ResourceLimitsManager {
    defaults: ResourceLimits,
    overrides: RwLock<HashMap<String, LimitOverrides>>,
    violations: ViolationLog,
    sessions: Mutex<HashMap<String, MonitoringSession>>,
    monitor_config: MonitorConfig,
    probe_factory: ProbeFactory,
    notify: broadcast::Sender<Violation>,
}

impl ResourceLimitsManager {
    pub fn new(
        defaults: ResourceLimits,
        monitor_config: MonitorConfig,
        probe_factory: ProbeFactory,
    ) -> Self {
        let (notify, _) = broadcast::channel(64);
        Self {
            defaults,
            overrides: RwLock::new(HashMap::new()),
            violations: Arc::new(RwLock::new(HashMap::new())),
            sessions: Mutex::new(HashMap::new()),
            monitor_config,
            probe_factory,
            notify,
        }
    }

    pub fn defaults(&self) -> &ResourceLimits {
        &self.defaults
    }

    pub fn set_script_limits(&self, script_id: &str, overrides: LimitOverrides) {
        self.overrides
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(script_id.to_string(), overrides);
        debug!("Limits updated for {script_id}");
    }

    pub fn clear_script_limits(&self, script_id: &str) {
        self.overrides
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(script_id);
    }

    pub fn get_script_limits(&self, script_id: &str) -> ResourceLimits {
        let overrides = self.overrides.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        match overrides.get(script_id) {
            Some(o) => o.merge_over(&self.defaults),
            None => self.defaults.clone(),
        }
    }

    pub fn get_violations(&self, script_id: &str) -> Vec<Violation> {
        self.violations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(script_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Live feed of every violation from every session.
    pub fn subscribe(&self) -> broadcast::Receiver<Violation> {
        self.notify.subscribe()
    }

    pub fn is_monitoring(&self, script_id: &str) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(script_id)
    }

    /// Starts sampling `pid` and a limit-check loop against the script's
    /// effective limits. Each resource is reported at most once per
    /// session. The returned receiver yields this session's violations.
    pub fn start_monitoring(
        &self,
        script_id: &str,
        pid: u32,
    ) -> Result<mpsc::UnboundedReceiver<Violation>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if sessions.contains_key(script_id) {
            return Err(ScriptError::AlreadyRunning(script_id.to_string()));
        }

        let limits = self.get_script_limits(script_id);
        let mut monitor = ResourceMonitor::new(
            self.monitor_config.sample_interval(),
            self.monitor_config.history_capacity,
        );
        monitor.start(pid, (self.probe_factory)());

        let (tx, rx) = mpsc::unbounded_channel();
        let check_task = tokio::spawn(check_loop(CheckContext {
            script_id: script_id.to_string(),
            limits,
            history: monitor.history(),
            stop: monitor.stop_token(),
            interval: self.monitor_config.check_interval(),
            log: Arc::clone(&self.violations),
            session_tx: tx,
            notify: self.notify.clone(),
        }));

        sessions.insert(script_id.to_string(), MonitoringSession { monitor, check_task });
        info!("Resource monitoring started for {script_id} (pid {pid})");
        Ok(rx)
    }

    /// Stops the monitor and its check loop, discarding the samples.
    /// Returns `None` if the script was not being monitored.
    pub async fn stop_monitoring(&self, script_id: &str) -> Option<UsageReport> {
        let session = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(script_id)?;
        let MonitoringSession { mut monitor, check_task } = session;
        monitor.stop().await;
        let _ = check_task.await;
        let report = UsageReport::from_history(&monitor.history());
        debug!(
            "Resource monitoring stopped for {script_id}: peak {:.1}MB, avg cpu {:.1}%",
            report.peak_memory_mb, report.average_cpu_percent
        );
        Some(report)
    }

    /// Synchronous teardown for callers that cannot await: drops the
    /// session, which cancels the sampler, and aborts the check loop.
    /// Returns whether a session existed.
    pub fn abort_monitoring(&self, script_id: &str) -> bool {
        let session = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(script_id);
        match session {
            Some(session) => {
                session.check_task.abort();
                debug!("Resource monitoring aborted for {script_id}");
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for ResourceLimitsManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLimitsManager")
            .field("defaults", &self.defaults)
            .field("monitor_config", &self.monitor_config)
            .finish_non_exhaustive()
    }
}

struct CheckContext {
    script_id: String,
    limits: ResourceLimits,
    history: UsageHistory,
    stop: CancellationToken,
    interval: Duration,
    log: ViolationLog,
    session_tx: mpsc::UnboundedSender<Violation>,
    notify: broadcast::Sender<Violation>,
}

async fn check_loop(ctx: CheckContext) {
    let mut ticker = tokio::time::interval(ctx.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut reported: HashSet<ResourceKind> = HashSet::new();

    loop {
        tokio::select! {
            _ = ctx.stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let (Some(first), Some(latest)) = (ctx.history.first(), ctx.history.latest()) else {
            continue;
        };
        for (resource, limit, current) in check_usage(&ctx.limits, &first, &latest, Utc::now()) {
            if !reported.insert(resource) {
                continue;
            }
            let violation = Violation {
                script_id: ctx.script_id.clone(),
                resource,
                limit,
                current,
                timestamp: Utc::now(),
            };
            warn!(
                "Script {} exceeded {resource}: {current:.2} > {limit:.2}",
                ctx.script_id
            );
            ctx.log
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .entry(ctx.script_id.clone())
                .or_default()
                .push(violation.clone());
            let _ = ctx.session_tx.send(violation.clone());
            let _ = ctx.notify.send(violation);
        }
    }
}
