use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, ScriptError};

/// Upper bound on waiting for the output pipes after the child is gone.
/// A grandchild that inherited the pipes can keep them open indefinitely.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Receives output incrementally, one line (newline included) at a time.
pub type OutputSink = Box<dyn FnMut(&str) + Send + 'static>;

pub struct ExecOptions {
    pub timeout: Duration,
    pub env: HashMap<String, String>,
    /// Start from an empty environment instead of inheriting the host's
    pub clear_env: bool,
    pub working_dir: Option<PathBuf>,
    pub on_output: Option<OutputSink>,
    pub on_error: Option<OutputSink>,
    /// Receives the child's pid right after spawn
    pub on_spawn: Option<oneshot::Sender<u32>>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            env: HashMap::new(),
            clear_env: false,
            working_dir: None,
            on_output: None,
            on_error: None,
            on_spawn: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed (timeout or explicit kill) or
    /// ended by a signal
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub timed_out: bool,
    pub killed: bool,
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Killed,
}

/// Runs one interpreter process at a time.
///
/// The executor does not guard against concurrent `execute_script` calls;
/// callers use one executor per in-flight script.
pub struct ProcessExecutor {
    interpreter: PathBuf,
    current: Mutex<Option<CancellationToken>>,
}

impl ProcessExecutor {
    pub fn new(interpreter: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            current: Mutex::new(None),
        }
    }

    pub fn interpreter(&self) -> &Path {
        &self.interpreter
    }

    fn current(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.current().is_some()
    }

    /// Kills the in-flight process. Returns `false` when nothing is
    /// running; calling it repeatedly is harmless.
    pub fn kill_process(&self) -> bool {
        match self.current().as_ref() {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Spawns `<interpreter> <script> <args...>`, streams output to the
    /// sinks and races exit against `options.timeout` and `kill_process`.
    /// Output captured before a kill is kept.
    pub async fn execute_script(
        &self,
        script: &Path,
        args: &[String],
        options: ExecOptions,
    ) -> Result<ProcessOutput> {
        let mut argv: Vec<OsString> = Vec::with_capacity(args.len() + 1);
        argv.push(script.as_os_str().to_os_string());
        argv.extend(args.iter().map(OsString::from));
        self.run(&script.display().to_string(), argv, options).await
    }

    /// Runs `<interpreter> <args...>` with no script path, e.g.
    /// `python3 -m pip install ...`.
    pub async fn execute_command(
        &self,
        args: &[String],
        options: ExecOptions,
    ) -> Result<ProcessOutput> {
        let label = format!("{} {}", self.interpreter.display(), args.join(" "));
        self.run(&label, args.iter().map(OsString::from).collect(), options).await
    }

    async fn run(
        &self,
        label: &str,
        argv: Vec<OsString>,
        mut options: ExecOptions,
    ) -> Result<ProcessOutput> {
        let mut cmd = Command::new(&self.interpreter);
        cmd.args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if options.clear_env {
            cmd.env_clear();
        }
        cmd.envs(&options.env).env("PYTHONUNBUFFERED", "1");
        if let Some(dir) = &options.working_dir {
            cmd.current_dir(dir);
        }

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            ScriptError::Process(format!("failed to spawn {}: {e}", self.interpreter.display()))
        })?;
        let pid = child.id();
        info!("Spawned {label} (pid {})", pid.unwrap_or_default());

        let token = CancellationToken::new();
        *self.current() = Some(token.clone());
        if let (Some(tx), Some(pid)) = (options.on_spawn.take(), pid) {
            let _ = tx.send(pid);
        }

        let stdout_buf = Arc::new(Mutex::new(String::new()));
        let stderr_buf = Arc::new(Mutex::new(String::new()));
        let mut readers = OutputReaders(Vec::with_capacity(2));
        if let Some(out) = child.stdout.take() {
            readers.0.push(spawn_reader(out, Arc::clone(&stdout_buf), options.on_output.take()));
        }
        if let Some(err) = child.stderr.take() {
            readers.0.push(spawn_reader(err, Arc::clone(&stderr_buf), options.on_error.take()));
        }

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = tokio::time::sleep(options.timeout) => Outcome::TimedOut,
            _ = token.cancelled() => Outcome::Killed,
        };

        let (exit_code, timed_out, killed) = match outcome {
            Outcome::Exited(Ok(status)) => (status.code(), false, false),
            Outcome::Exited(Err(e)) => {
                drop(readers);
                *self.current() = None;
                return Err(ScriptError::Process(format!("wait failed: {e}")));
            }
            Outcome::TimedOut => {
                warn!("{label} timed out after {}ms, killing", options.timeout.as_millis());
                terminate(&mut child).await;
                (None, true, false)
            }
            Outcome::Killed => {
                info!("{label} killed");
                terminate(&mut child).await;
                (None, false, true)
            }
        };

        for reader in readers.0.iter_mut() {
            if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
                debug!("Output pipe still open after exit, abandoning reader");
            }
        }
        drop(readers);
        *self.current() = None;

        let duration = started.elapsed();
        debug!("{label} finished in {}ms (exit {exit_code:?})", duration.as_millis());
        Ok(ProcessOutput {
            stdout: take_buffer(&stdout_buf),
            stderr: take_buffer(&stderr_buf),
            exit_code,
            duration,
            timed_out,
            killed,
        })
    }
}

impl std::fmt::Debug for ProcessExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessExecutor")
            .field("interpreter", &self.interpreter)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn terminate(child: &mut tokio::process::Child) {
    if let Err(e) = child.start_kill() {
        debug!("kill failed (process likely exited): {e}");
    }
    if let Err(e) = child.wait().await {
        warn!("Failed to reap killed process: {e}");
    }
}

/// Pipe reader tasks of one run. Whatever path leaves `run`, dropping
/// this aborts readers that are still attached to the pipes.
struct OutputReaders(Vec<JoinHandle<()>>);

impl Drop for OutputReaders {
    fn drop(&mut self) {
        for reader in &self.0 {
            reader.abort();
        }
    }
}

fn spawn_reader<R>(
    stream: R,
    buffer: Arc<Mutex<String>>,
    mut sink: Option<OutputSink>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    buffer
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push_str(&text);
                    if let Some(sink) = sink.as_mut() {
                        sink(&text);
                    }
                }
                Err(e) => {
                    debug!("Output read error: {e}");
                    break;
                }
            }
        }
    })
}

fn take_buffer(buffer: &Arc<Mutex<String>>) -> String {
    std::mem::take(&mut *buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;

    fn script(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn test_dropped_readers_release_their_pipes() {
        let (_writer, pipe) = tokio::io::duplex(64);
        let buffer = Arc::new(Mutex::new(String::new()));
        let readers = OutputReaders(vec![spawn_reader(pipe, Arc::clone(&buffer), None)]);
        tokio::task::yield_now().await;
        assert_eq!(Arc::strong_count(&buffer), 2);

        // The writer is still open, so only an abort ends the reader
        drop(readers);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(Arc::strong_count(&buffer), 1);
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "run.sh", "echo \"hello $1\"\necho oops >&2\nexit 3\n");
        let executor = ProcessExecutor::new("sh");

        let out = executor
            .execute_script(&path, &["--name=x".to_string()], ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello --name=x\n");
        assert_eq!(out.stderr, "oops\n");
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.timed_out);
        assert!(!out.killed);
        assert!(!executor.is_running());
    }

    #[tokio::test]
    async fn test_streams_lines_to_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "run.sh", "echo one\necho two\necho err >&2\n");
        let lines = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let (l, e) = (Arc::clone(&lines), Arc::clone(&errors));

        let out = ProcessExecutor::new("sh")
            .execute_script(
                &path,
                &[],
                ExecOptions {
                    on_output: Some(Box::new(move |s: &str| l.lock().unwrap().push(s.to_string()))),
                    on_error: Some(Box::new(move |s: &str| e.lock().unwrap().push(s.to_string()))),
                    ..ExecOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(*lines.lock().unwrap(), vec!["one\n", "two\n"]);
        assert_eq!(*errors.lock().unwrap(), vec!["err\n"]);
        assert_eq!(out.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_timeout_kills_and_keeps_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "slow.sh", "echo started\nexec sleep 5\n");

        let out = ProcessExecutor::new("sh")
            .execute_script(
                &path,
                &[],
                ExecOptions {
                    timeout: Duration::from_millis(300),
                    ..ExecOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, None);
        assert_eq!(out.stdout, "started\n");
        assert!(out.duration < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_kill_process_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "slow.sh", "exec sleep 5\n");
        let executor = Arc::new(ProcessExecutor::new("sh"));
        assert!(!executor.kill_process());

        let (tx, rx) = oneshot::channel();
        let task = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move {
                executor
                    .execute_script(
                        &path,
                        &[],
                        ExecOptions {
                            on_spawn: Some(tx),
                            ..ExecOptions::default()
                        },
                    )
                    .await
            })
        };
        let pid = rx.await.unwrap();
        assert!(pid > 0);
        assert!(executor.is_running());
        assert!(executor.kill_process());
        assert!(!executor.kill_process());

        let out = task.await.unwrap().unwrap();
        assert!(out.killed);
        assert!(!out.timed_out);
        assert_eq!(out.exit_code, None);
        assert!(!executor.kill_process());
    }

    #[tokio::test]
    async fn test_environment_and_unbuffered_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "env.sh", "echo \"$GREETING $PYTHONUNBUFFERED ${HOME:-unset}\"\n");
        let mut env = HashMap::new();
        env.insert("GREETING".to_string(), "hi".to_string());
        env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());

        let out = ProcessExecutor::new("sh")
            .execute_script(
                &path,
                &[],
                ExecOptions {
                    env,
                    clear_env: true,
                    ..ExecOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(out.stdout, "hi 1 unset\n");
    }

    #[tokio::test]
    async fn test_execute_command_without_script() {
        let out = ProcessExecutor::new("sh")
            .execute_command(&["-c".to_string(), "echo $0".to_string()], ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(out.stdout, "sh\n");
        assert_eq!(out.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_process_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(&dir, "x.sh", "exit 0\n");
        let err = ProcessExecutor::new("/nonexistent/interpreter")
            .execute_script(&path, &[], ExecOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::Process(_)));
    }
}
