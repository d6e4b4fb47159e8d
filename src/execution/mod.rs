//! Execution orchestration.
//!
//! One `execute_script` call drives a single run end to end: parameter
//! and permission checks, environment preparation, the interpreter child,
//! resource monitoring, and exactly one terminal event. Runs for distinct
//! script ids proceed independently; a second run for an id that is
//! already in flight is refused.

pub mod dependencies;
pub mod params;
pub mod state;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{Result, ScriptError};
use crate::events::{EventBus, OutputStream};
use crate::manifest::Manifest;
use crate::sandbox::limits::{ResourceLimitsManager, UsageReport, Violation};
use crate::sandbox::permissions::{PermissionManager, PermissionSet};
use crate::sandbox::process::{ExecOptions, ProcessExecutor, ProcessOutput};

pub use dependencies::DependencyInstaller;
pub use state::{ExecutionState, FailureKind};

/// Host variables passed through when a script has no environment access.
const BASE_ENV_ALLOWLIST: &[&str] = &["PATH", "PYTHONPATH", "LANG", "PYTHONIOENCODING"];

#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Directory the manifest lives in; the entry point and the child's
    /// working directory are resolved against it
    pub base_dir: PathBuf,
    /// Caller-supplied variables, applied over the manifest's environment
    pub env: HashMap<String, String>,
    /// Wall-clock cap. Defaults to the script's effective `max_duration`.
    pub timeout: Option<Duration>,
}

impl ExecutionOptions {
    pub fn in_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub script_id: String,
    /// True iff the process exited with code 0
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub failure: Option<FailureKind>,
    pub error: Option<String>,
    pub violation: Option<Violation>,
    pub peak_memory_mb: f64,
    pub average_cpu_percent: f64,
}

struct ActiveExecution {
    execution_id: Uuid,
    executor: Arc<ProcessExecutor>,
    /// Cancelled by `kill_execution`
    cancel: CancellationToken,
    /// Cancelled once the run has fully cleaned up
    finished: CancellationToken,
}

pub struct ExecutionManager {
    interpreter: PathBuf,
    permissions: Arc<PermissionManager>,
    limits: Arc<ResourceLimitsManager>,
    events: Arc<EventBus>,
    active: Mutex<HashMap<String, ActiveExecution>>,
    states: Mutex<HashMap<String, ExecutionState>>,
}

impl ExecutionManager {
    pub fn new(
        interpreter: impl Into<PathBuf>,
        permissions: Arc<PermissionManager>,
        limits: Arc<ResourceLimitsManager>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            interpreter: interpreter.into(),
            permissions,
            limits,
            events,
            active: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
        }
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, ActiveExecution>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state of a script, or the state its last run ended in.
    pub fn state(&self, script_id: &str) -> ExecutionState {
        self.states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(script_id)
            .copied()
            .unwrap_or_default()
    }

    fn transition(&self, script_id: &str, next: ExecutionState) {
        let mut states = self.states.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let current = states.get(script_id).copied().unwrap_or_default();
        if current.can_transition_to(next) {
            states.insert(script_id.to_string(), next);
        } else {
            error!("Rejected state transition for {script_id}: {current} -> {next}");
        }
    }

    pub fn is_running(&self, script_id: &str) -> bool {
        self.active().contains_key(script_id)
    }

    pub fn active_executions(&self) -> Vec<String> {
        self.active().keys().cloned().collect()
    }

    /// Runs a script to completion.
    ///
    /// Returns `Err` only when the run never started: invalid params,
    /// missing permissions, or a run already in flight for this id.
    /// Timeouts, limit violations, process errors and cancellation come
    /// back as an unsuccessful `ExecutionResult`. On a normal process
    /// exit the manifest's run metadata is updated in place.
    ///
    /// Dropping the returned future mid-run kills the child and ends the
    /// run as cancelled.
    pub async fn execute_script(
        &self,
        manifest: &mut Manifest,
        params: &Map<String, Value>,
        options: ExecutionOptions,
    ) -> Result<ExecutionResult> {
        let script_id = manifest.id().to_string();
        let execution_id = Uuid::new_v4();
        let executor = Arc::new(ProcessExecutor::new(&self.interpreter));
        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();

        {
            let mut active = self.active();
            if active.contains_key(&script_id) {
                return Err(ScriptError::AlreadyRunning(script_id));
            }
            active.insert(
                script_id.clone(),
                ActiveExecution {
                    execution_id,
                    executor: Arc::clone(&executor),
                    cancel: cancel.clone(),
                    finished: finished.clone(),
                },
            );
        }
        self.transition(&script_id, ExecutionState::Validating);

        let prepared = self.prepare(manifest, params, &options);
        let (args, env, clear_env) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.active().remove(&script_id);
                self.transition(&script_id, ExecutionState::Failed);
                finished.cancel();
                warn!("Execution of {script_id} refused: {e}");
                return Err(e);
            }
        };

        let limits = self.limits.get_script_limits(&script_id);
        let timeout = options.timeout.unwrap_or_else(|| limits.max_duration());
        // The child runs in base_dir, so a relative entry point would
        // resolve twice.
        let mut entry_point = manifest.entry_point_path(&options.base_dir);
        if entry_point.is_relative() {
            if let Ok(cwd) = std::env::current_dir() {
                entry_point = cwd.join(entry_point);
            }
        }

        info!("Executing {script_id} ({execution_id})");
        self.events.notify_execution_started(&script_id, execution_id);
        self.transition(&script_id, ExecutionState::Running);

        let (pid_tx, pid_rx) = oneshot::channel();
        let exec_options = ExecOptions {
            timeout,
            env,
            clear_env,
            working_dir: Some(options.base_dir.clone()).filter(|d| !d.as_os_str().is_empty()),
            on_output: Some(self.progress_sink(&script_id, execution_id, OutputStream::Stdout)),
            on_error: Some(self.progress_sink(&script_id, execution_id, OutputStream::Stderr)),
            on_spawn: Some(pid_tx),
        };

        let started = Instant::now();
        let mut guard = RunGuard {
            manager: self,
            script_id: script_id.clone(),
            execution_id,
            started,
            finished: finished.clone(),
            armed: true,
        };
        let run = executor.execute_script(&entry_point, &args, exec_options);
        tokio::pin!(run);

        let mut pid_rx = Some(pid_rx);
        let mut violations: Option<mpsc::UnboundedReceiver<Violation>> = None;
        let mut violation: Option<Violation> = None;
        let mut cancel_seen = false;

        let output = loop {
            tokio::select! {
                output = &mut run => break output,
                pid = recv_pid(&mut pid_rx) => {
                    pid_rx = None;
                    let Some(pid) = pid else { continue };
                    if cancel.is_cancelled() {
                        executor.kill_process();
                        continue;
                    }
                    match self.limits.start_monitoring(&script_id, pid) {
                        Ok(rx) => violations = Some(rx),
                        Err(e) => warn!("Monitoring unavailable for {script_id}: {e}"),
                    }
                }
                v = next_violation(&mut violations) => match v {
                    Some(v) if violation.is_none() => {
                        warn!("Killing {script_id}: {}", v.to_error());
                        violation = Some(v);
                        executor.kill_process();
                    }
                    Some(_) => {}
                    None => violations = None,
                },
                _ = cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    executor.kill_process();
                }
            }
        };

        let usage = self.limits.stop_monitoring(&script_id).await.unwrap_or_default();
        guard.armed = false;
        let duration = started.elapsed();
        let cancelled = cancel.is_cancelled();
        let result = self.finish(
            manifest,
            execution_id,
            output,
            Outcome {
                violation,
                cancelled,
                timeout,
                usage,
                duration,
            },
        );

        self.active().remove(&script_id);
        self.publish_terminal(&result);
        finished.cancel();
        Ok(result)
    }

    /// Kills the in-flight run for `script_id` and waits until it has torn
    /// down (process, monitor, active entry, terminal event). Returns
    /// `false` if nothing was running or a kill is already under way.
    pub async fn kill_execution(&self, script_id: &str) -> bool {
        let finished = {
            let active = self.active();
            let Some(entry) = active.get(script_id) else {
                return false;
            };
            if entry.cancel.is_cancelled() {
                return false;
            }
            info!("Cancelling {script_id} ({})", entry.execution_id);
            entry.cancel.cancel();
            entry.executor.kill_process();
            entry.finished.clone()
        };
        finished.cancelled().await;
        true
    }

    /// Validates params and permissions, and builds the child's argv and
    /// environment.
    fn prepare(
        &self,
        manifest: &Manifest,
        params: &Map<String, Value>,
        options: &ExecutionOptions,
    ) -> Result<(Vec<String>, HashMap<String, String>, bool)> {
        let script_id = manifest.id();

        let issues = params::validate_params(&manifest.execution.arguments, params);
        if !issues.is_empty() {
            let lines = issues.iter().map(|i| i.to_string()).collect();
            self.events.notify_validation_failed(script_id, lines);
            return Err(ScriptError::Validation(issues));
        }

        let required = required_permissions(manifest);
        let report = self.permissions.validate_permissions(script_id, &required);
        if !report.is_valid {
            return Err(ScriptError::PermissionDenied(report.missing));
        }

        let effective = self.permissions.get_script_permissions(script_id);
        let clear_env = !effective.allow_environment_access;
        let mut env: HashMap<String, String> = HashMap::new();
        if clear_env {
            for key in BASE_ENV_ALLOWLIST {
                if let Ok(value) = std::env::var(key) {
                    env.insert((*key).to_string(), value);
                }
            }
        }
        env.extend(manifest.execution.environment.iter().map(|(k, v)| (k.clone(), v.clone())));
        env.extend(options.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env.insert("SCRIPT_ID".to_string(), script_id.to_string());
        env.insert("SCRIPT_VERSION".to_string(), manifest.script_info.version.clone());
        env.insert(
            "SCRIPT_SECURITY_PROFILE".to_string(),
            self.permissions.sandbox_profile(script_id).to_string(),
        );

        let args = params::format_args(&manifest.execution.arguments, params);
        Ok((args, env, clear_env))
    }

    fn progress_sink(
        &self,
        script_id: &str,
        execution_id: Uuid,
        stream: OutputStream,
    ) -> crate::sandbox::process::OutputSink {
        let events = Arc::clone(&self.events);
        let script_id = script_id.to_string();
        Box::new(move |line: &str| {
            events.notify_execution_progress(&script_id, execution_id, stream, line);
        })
    }

    fn finish(
        &self,
        manifest: &mut Manifest,
        execution_id: Uuid,
        output: Result<ProcessOutput>,
        outcome: Outcome,
    ) -> ExecutionResult {
        let script_id = manifest.id().to_string();
        let mut result = ExecutionResult {
            execution_id,
            script_id: script_id.clone(),
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration: outcome.duration,
            failure: None,
            error: None,
            violation: None,
            peak_memory_mb: outcome.usage.peak_memory_mb,
            average_cpu_percent: outcome.usage.average_cpu_percent,
        };

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                error!("Execution of {script_id} failed: {e}");
                result.failure = Some(FailureKind::Process);
                result.error = Some(e.to_string());
                self.transition(&script_id, ExecutionState::Failed);
                return result;
            }
        };
        result.exit_code = output.exit_code;
        result.stdout = output.stdout;
        result.stderr = output.stderr;

        if outcome.cancelled {
            result.failure = Some(FailureKind::Cancelled);
            result.error = Some("execution cancelled".to_string());
            self.transition(&script_id, ExecutionState::Cancelled);
        } else if let Some(violation) = outcome.violation {
            result.failure = Some(FailureKind::ResourceLimit);
            result.error = Some(violation.to_error().to_string());
            result.violation = Some(violation);
            self.transition(&script_id, ExecutionState::Failed);
        } else if output.timed_out {
            result.failure = Some(FailureKind::Timeout);
            result.error = Some(ScriptError::Timeout(outcome.timeout).to_string());
            self.transition(&script_id, ExecutionState::Failed);
        } else if let Some(code) = output.exit_code {
            manifest.record_execution(Utc::now());
            result.success = code == 0;
            if result.success {
                self.transition(&script_id, ExecutionState::Completed);
            } else {
                result.failure = Some(FailureKind::ExitCode);
                result.error = Some(format!("script exited with code {code}"));
                self.transition(&script_id, ExecutionState::Failed);
            }
        } else {
            result.failure = Some(FailureKind::Process);
            result.error = Some("process terminated by a signal".to_string());
            self.transition(&script_id, ExecutionState::Failed);
        }

        info!(
            "Execution of {script_id} finished: success={} in {}ms",
            result.success,
            result.duration.as_millis()
        );
        result
    }

    fn publish_terminal(&self, result: &ExecutionResult) {
        let duration_ms = u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX);
        let id = &result.script_id;
        match (result.failure, result.exit_code) {
            (Some(FailureKind::Cancelled), _) => {
                self.events.notify_execution_cancelled(id, result.execution_id, duration_ms);
            }
            (None | Some(FailureKind::ExitCode), Some(code)) => {
                self.events.notify_execution_completed(
                    id,
                    result.execution_id,
                    code,
                    duration_ms,
                    result.peak_memory_mb,
                    result.average_cpu_percent,
                );
            }
            (kind, _) => {
                self.events.notify_execution_failed(
                    id,
                    result.execution_id,
                    kind.unwrap_or(FailureKind::Process),
                    result.error.as_deref().unwrap_or("execution failed"),
                    duration_ms,
                );
            }
        }
    }
}

impl std::fmt::Debug for ExecutionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionManager")
            .field("interpreter", &self.interpreter)
            .field("active", &self.active_executions())
            .finish_non_exhaustive()
    }
}

/// Tears a run down when its future is dropped mid-flight. The child is
/// already killed on drop; this releases the script id, the monitoring
/// session and any `kill_execution` waiter, and publishes the terminal
/// event the run would otherwise never emit.
struct RunGuard<'a> {
    manager: &'a ExecutionManager,
    script_id: String,
    execution_id: Uuid,
    started: Instant,
    finished: CancellationToken,
    armed: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("Execution of {} abandoned by its caller, cleaning up", self.script_id);
        self.manager.limits.abort_monitoring(&self.script_id);
        self.manager.active().remove(&self.script_id);
        self.manager.transition(&self.script_id, ExecutionState::Cancelled);
        let duration_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.manager
            .events
            .notify_execution_cancelled(&self.script_id, self.execution_id, duration_ms);
        self.finished.cancel();
    }
}

struct Outcome {
    violation: Option<Violation>,
    cancelled: bool,
    timeout: Duration,
    usage: UsageReport,
    duration: Duration,
}

/// Capabilities a manifest needs at run time. Subprocess and environment
/// access are never granted by the manifest itself, so declaring them
/// makes the run depend on a live temporary grant.
fn required_permissions(manifest: &Manifest) -> PermissionSet {
    match manifest.declared_permissions() {
        Some(perms) => PermissionSet {
            allow_networking: perms.allow_networking.unwrap_or(false),
            allow_file_system: perms.allow_file_system.unwrap_or(false),
            allow_subprocess: perms.requests_subprocess(),
            allow_environment_access: perms.requests_environment_access(),
            ..PermissionSet::default()
        },
        None => PermissionSet::default(),
    }
}

async fn recv_pid(rx: &mut Option<oneshot::Receiver<u32>>) -> Option<u32> {
    match rx {
        Some(rx) => rx.await.ok(),
        None => std::future::pending().await,
    }
}

async fn next_violation(rx: &mut Option<mpsc::UnboundedReceiver<Violation>>) -> Option<Violation> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Resolves the directory a manifest file lives in.
pub fn manifest_dir(manifest_path: &Path) -> PathBuf {
    manifest_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}
