use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use scriptguard::cache::ScriptCache;
use scriptguard::config::Config;
use scriptguard::events::{EventBus, OutputStream, ScriptEventKind};
use scriptguard::execution::params::parse_cli_params;
use scriptguard::execution::{DependencyInstaller, ExecutionManager, ExecutionOptions, FailureKind};
use scriptguard::registry::ScriptRegistry;
use scriptguard::sandbox::limits::ResourceLimitsManager;
use scriptguard::sandbox::monitor::sysinfo_probe_factory;
use scriptguard::sandbox::permissions::PermissionManager;
use scriptguard::security::SecurityValidator;

const DEFAULT_CONFIG_PATH: &str = "config/scriptguard.toml";

fn print_help() {
    println!(
        "\
scriptguard v{}

Validates and runs user scripts under manifest-declared policy.

USAGE:
    scriptguard [OPTIONS] <COMMAND>

COMMANDS:
    validate <MANIFEST>                  Check a manifest and its script, print every problem
    run <MANIFEST> [NAME=VALUE...]       Register and execute a script with the given params
    clear-cache                          Drop every cached validation result

OPTIONS:
    -c, --config <PATH>    TOML configuration file [default: {DEFAULT_CONFIG_PATH}]
    -h, --help             Print this help message and exit
    -V, --version          Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing
                (e.g. debug, scriptguard=debug,warn)

EXAMPLES:
    scriptguard validate scripts/wordcount/manifest.json
    scriptguard run scripts/wordcount/manifest.json input=notes.txt limit=10
    RUST_LOG=debug scriptguard -c /etc/scriptguard.toml run manifest.json",
        env!("CARGO_PKG_VERSION"),
    );
}

enum Command {
    Validate(PathBuf),
    Run { manifest: PathBuf, params: Vec<String> },
    ClearCache,
}

struct Cli {
    config_path: Option<PathBuf>,
    command: Command,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Cli> {
    let mut config_path = None;
    let mut positional = Vec::new();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().ok_or_else(|| anyhow!("{arg} needs a path"))?;
                config_path = Some(PathBuf::from(path));
            }
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        Some("validate") => {
            let manifest = positional
                .next()
                .ok_or_else(|| anyhow!("validate needs a manifest path"))?;
            Command::Validate(PathBuf::from(manifest))
        }
        Some("run") => {
            let manifest = positional.next().ok_or_else(|| anyhow!("run needs a manifest path"))?;
            Command::Run {
                manifest: PathBuf::from(manifest),
                params: positional.collect(),
            }
        }
        Some("clear-cache") => Command::ClearCache,
        Some(other) => bail!("unknown command '{other}' (see --help)"),
        None => bail!("no command given (see --help)"),
    };
    Ok(Cli { config_path, command })
}

/// Explicit paths must exist; the default path may be absent.
fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            Config::load(path)
        }
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            info!("Loading configuration from {DEFAULT_CONFIG_PATH}");
            Config::load(Path::new(DEFAULT_CONFIG_PATH))
        }
        None => {
            info!("No configuration file, using defaults");
            Ok(Config::default())
        }
    }
}

/// Components shared by every command.
struct Engine {
    config: Config,
    events: Arc<EventBus>,
    registry: ScriptRegistry,
    manager: Arc<ExecutionManager>,
}

impl Engine {
    fn build(config: Config) -> Result<Self> {
        let events = Arc::new(EventBus::new(&config.events));
        let permissions = Arc::new(PermissionManager::new(config.permissions.to_permission_set()));
        let limits = Arc::new(ResourceLimitsManager::new(
            config.limits.clone(),
            config.monitor.clone(),
            sysinfo_probe_factory(),
        ));
        let registry = ScriptRegistry::new(
            SecurityValidator::new(config.security.clone())?,
            ScriptCache::open(&config.cache.path),
            Arc::clone(&permissions),
            Arc::clone(&limits),
            Arc::clone(&events),
        );
        let manager = Arc::new(ExecutionManager::new(
            config.runtime.interpreter.clone(),
            permissions,
            limits,
            Arc::clone(&events),
        ));
        Ok(Self {
            config,
            events,
            registry,
            manager,
        })
    }
}

fn validate(engine: &Engine, manifest_path: &Path) -> Result<i32> {
    let report = engine.registry.check(manifest_path)?;
    for warning in report.warning_lines() {
        println!("warning: {warning}");
    }
    if report.is_valid() {
        println!("{}: ok", report.script_id);
        return Ok(0);
    }
    for line in report.error_lines() {
        println!("error: {line}");
    }
    println!("{}: {} problem(s)", report.script_id, report.error_lines().len());
    Ok(1)
}

async fn run(engine: &Engine, manifest_path: &Path, pairs: &[String]) -> Result<i32> {
    let registered = engine.registry.register(manifest_path)?;
    for warning in &registered.warnings {
        println!("warning: {warning}");
    }
    let mut manifest = registered.manifest;
    let script_id = manifest.id().to_string();

    let params = parse_cli_params(&manifest.execution.arguments, pairs)
        .map_err(|issue| anyhow!("invalid parameter {issue}"))?;

    if !manifest.execution.dependencies.is_empty() {
        DependencyInstaller::new(
            engine.config.runtime.interpreter.clone(),
            engine.config.runtime.install_timeout(),
            Arc::clone(&engine.events),
        )
        .install(&manifest)
        .await?;
    }

    // Live output, until the run's terminal event
    let mut rx = engine.events.subscribe();
    let printer_id = script_id.clone();
    let printer = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) if event.script_id == printer_id => match &event.kind {
                    ScriptEventKind::ExecutionProgress { stream, output, .. } => match stream {
                        OutputStream::Stdout => print!("{output}"),
                        OutputStream::Stderr => eprint!("{output}"),
                    },
                    kind if kind.is_terminal() => break,
                    _ => {}
                },
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("Output display lagged, {n} events skipped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let count_before = manifest.metadata.as_ref().map_or(0, |m| m.execution_count);
    // The run future keeps being polled after Ctrl-C so it can clean up.
    let outcome = {
        let execution = engine.manager.execute_script(
            &mut manifest,
            &params,
            ExecutionOptions::in_dir(registered.base_dir.clone()),
        );
        tokio::pin!(execution);

        let mut interrupted = false;
        loop {
            tokio::select! {
                outcome = &mut execution => break outcome,
                _ = tokio::signal::ctrl_c(), if !interrupted => {
                    interrupted = true;
                    info!("Interrupt received, cancelling {script_id}");
                    let manager = Arc::clone(&engine.manager);
                    let id = script_id.clone();
                    tokio::spawn(async move { manager.kill_execution(&id).await });
                }
            }
        }
    };

    let result = match outcome {
        Ok(result) => result,
        Err(e) => {
            printer.abort();
            return Err(e.into());
        }
    };
    if let Err(e) = printer.await {
        warn!("Output display task failed: {e}");
    }

    let count_after = manifest.metadata.as_ref().map_or(0, |m| m.execution_count);
    if count_after != count_before {
        engine.registry.record_execution(manifest_path, &mut manifest);
    }

    let secs = result.duration.as_secs_f64();
    match result.failure {
        None => println!("{script_id}: completed in {secs:.2}s"),
        Some(FailureKind::ExitCode) => println!(
            "{script_id}: exited with code {} after {secs:.2}s",
            result.exit_code.unwrap_or(-1)
        ),
        Some(kind) if kind.is_system_stop() => println!(
            "{script_id}: stopped by the system after {secs:.2}s: {}",
            result.error.as_deref().unwrap_or("limit reached")
        ),
        Some(FailureKind::Cancelled) => println!("{script_id}: cancelled after {secs:.2}s"),
        Some(_) => println!(
            "{script_id}: failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        ),
    }
    info!(
        "Peak memory {:.1} MB, average CPU {:.1}%",
        result.peak_memory_mb, result.average_cpu_percent
    );

    Ok(result.exit_code.unwrap_or(1))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("scriptguard v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("scriptguard=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = parse_args(std::env::args().skip(1))?;
    let config = load_config(cli.config_path.as_deref())?;
    let engine = Engine::build(config)?;

    let code = match cli.command {
        Command::Validate(manifest) => validate(&engine, &manifest)?,
        Command::Run { manifest, params } => run(&engine, &manifest, &params).await?,
        Command::ClearCache => {
            engine.registry.clear_cache()?;
            println!("cache cleared");
            0
        }
    };
    std::process::exit(code);
}
