use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{Result, ScriptError};
use crate::events::EventBus;
use crate::manifest::Manifest;
use crate::sandbox::process::{ExecOptions, ProcessExecutor};

/// Installs a manifest's declared dependencies with
/// `<interpreter> -m pip install <deps...>`.
#[derive(Debug)]
pub struct DependencyInstaller {
    interpreter: PathBuf,
    timeout: Duration,
    events: Arc<EventBus>,
}

impl DependencyInstaller {
    pub fn new(interpreter: impl Into<PathBuf>, timeout: Duration, events: Arc<EventBus>) -> Self {
        Self {
            interpreter: interpreter.into(),
            timeout,
            events,
        }
    }

    pub async fn install(&self, manifest: &Manifest) -> Result<()> {
        let script_id = manifest.id();
        let deps = &manifest.execution.dependencies;
        self.events.notify_dependencies_installing(script_id, deps);
        if deps.is_empty() {
            self.events.notify_dependencies_installed(script_id, deps);
            return Ok(());
        }

        info!("Installing {} dependencies for {script_id}", deps.len());
        let mut args = vec!["-m".to_string(), "pip".to_string(), "install".to_string()];
        args.extend(deps.iter().cloned());

        let executor = ProcessExecutor::new(&self.interpreter);
        let outcome = executor
            .execute_command(
                &args,
                ExecOptions {
                    timeout: self.timeout,
                    ..ExecOptions::default()
                },
            )
            .await;

        let failure = match outcome {
            Ok(out) if out.exit_code == Some(0) => None,
            Ok(out) if out.timed_out => Some(format!(
                "dependency installation timed out after {}s",
                self.timeout.as_secs()
            )),
            Ok(out) => Some(format!(
                "pip exited with {}: {}",
                out.exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "no exit code".to_string()),
                out.stderr.trim()
            )),
            Err(e) => Some(e.to_string()),
        };

        match failure {
            None => {
                self.events.notify_dependencies_installed(script_id, deps);
                Ok(())
            }
            Some(message) => {
                warn!("Dependency installation for {script_id} failed: {message}");
                self.events.notify_dependencies_error(script_id, &message);
                Err(ScriptError::Process(message))
            }
        }
    }
}
