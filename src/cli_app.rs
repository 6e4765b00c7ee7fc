//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use nfs_mount_supervisor::core::config::Config;
use nfs_mount_supervisor::core::errors::NfsmError;
use nfs_mount_supervisor::daemon::loop_main::{ShutdownReport, run_daemon};
use nfs_mount_supervisor::daemon::pidfile::{
    PidFile, STOP_GRACE, StopOutcome, read_live_pid, stop_instance,
};
use nfs_mount_supervisor::daemon::state_file::{DaemonState, read_state};
use nfs_mount_supervisor::supervisor::SharePhase;

/// nfsmgr: keeps declared NFS shares mounted and their containers in step.
#[derive(Debug, Parser)]
#[command(
    name = "nfsmgr",
    author,
    version,
    about = "NFS mount supervisor",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run the supervisor in the foreground until SIGTERM/SIGINT.
    Start(PidfileArgs),
    /// Stop a running instance.
    Stop(PidfileArgs),
    /// Stop a running instance (if any), then start.
    Restart(PidfileArgs),
    /// Show per-share state from the daemon's state file.
    Status,
    /// Load and validate the configuration.
    Validate,
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct PidfileArgs {
    /// PID file path (defaults to `paths.pid_file` from the config).
    #[arg(long, value_name = "PATH")]
    pidfile: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input or configuration.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// Internal bug or invariant violation.
    #[error("{0}")]
    Internal(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Internal(_) | Self::Json(_) => 3,
        }
    }
}

impl From<NfsmError> for CliError {
    fn from(error: NfsmError) -> Self {
        match error {
            NfsmError::InvalidConfig { .. }
            | NfsmError::MissingConfig { .. }
            | NfsmError::ConfigParse { .. } => Self::User(error.to_string()),
            NfsmError::Serialization { .. } => Self::Internal(error.to_string()),
            _ => Self::Runtime(error.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Start(args) => run_start(cli, args),
        Command::Stop(args) => run_stop(cli, args),
        Command::Restart(args) => {
            run_stop(cli, args)?;
            run_start(cli, args)
        }
        Command::Status => run_status(cli),
        Command::Validate => run_validate(cli),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    Ok(Config::load(cli.config.as_deref())?)
}

fn pidfile_path(config: &Config, args: &PidfileArgs) -> PathBuf {
    args.pidfile
        .clone()
        .unwrap_or_else(|| config.paths.pid_file.clone())
}

// ---------------------------------------------------------------------------
// start / stop
// ---------------------------------------------------------------------------

fn run_start(cli: &Cli, args: &PidfileArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let pid_path = pidfile_path(&config, args);
    let pidfile = PidFile::acquire(&pid_path).map_err(|e| match e {
        NfsmError::Runtime { details } => CliError::User(details),
        other => CliError::from(other),
    })?;

    if output_mode(cli) == OutputMode::Human {
        eprintln!(
            "nfsmgr v{} supervising {} share(s); pid file {}",
            env!("CARGO_PKG_VERSION"),
            config.shares.len(),
            pidfile.path().display()
        );
    }

    let report = run_daemon(&config)?;
    drop(pidfile);

    match output_mode(cli) {
        OutputMode::Human => print_shutdown_report(&report),
        OutputMode::Json => write_json_line(&json!({
            "command": "start",
            "clean": report.is_clean(),
            "unmounted": report.unmounted,
            "failed": report
                .failed
                .iter()
                .map(|(share, error)| json!({"share": share, "error": error}))
                .collect::<Vec<_>>(),
            "abandoned": report.abandoned,
        }))?,
    }

    if report.is_clean() {
        Ok(())
    } else {
        Err(CliError::Runtime(format!(
            "shutdown incomplete: {} failed, {} abandoned",
            report.failed.len(),
            report.abandoned.len()
        )))
    }
}

fn print_shutdown_report(report: &ShutdownReport) {
    println!("Shutdown:");
    for share in &report.unmounted {
        println!("  {:<20}  {}", share, "unmounted".green());
    }
    for (share, error) in &report.failed {
        println!("  {:<20}  {}  {error}", share, "failed".red());
    }
    for share in &report.abandoned {
        println!("  {:<20}  {}", share, "abandoned".red().bold());
    }
}

fn run_stop(cli: &Cli, args: &PidfileArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let pid_path = pidfile_path(&config, args);
    let outcome = stop_instance(&pid_path, STOP_GRACE)?;

    let (status, pid) = match outcome {
        StopOutcome::NotRunning => ("not_running", None),
        StopOutcome::Terminated { pid } => ("terminated", Some(pid)),
        StopOutcome::Killed { pid } => ("killed", Some(pid)),
    };
    match output_mode(cli) {
        OutputMode::Human => match outcome {
            StopOutcome::NotRunning => println!("nfsmgr is not running"),
            StopOutcome::Terminated { pid } => println!("stopped nfsmgr (pid {pid})"),
            StopOutcome::Killed { pid } => {
                println!(
                    "{} nfsmgr (pid {pid}) did not exit within {}s and was killed",
                    "warning:".yellow(),
                    STOP_GRACE.as_secs()
                );
            }
        },
        OutputMode::Json => write_json_line(&json!({
            "command": "stop",
            "status": status,
            "pid": pid,
            "pid_file": pid_path,
        }))?,
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// status / validate
// ---------------------------------------------------------------------------

fn run_status(cli: &Cli) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let live_pid = read_live_pid(&config.paths.pid_file).unwrap_or(None);
    let state = match read_state(&config.paths.state_file) {
        Ok(state) => Some(state),
        Err(NfsmError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(CliError::Runtime(e.to_string())),
    };

    match output_mode(cli) {
        OutputMode::Human => print_status(&config, live_pid, state.as_ref()),
        OutputMode::Json => {
            let payload = json!({
                "running": live_pid.is_some(),
                "pid": live_pid,
                "state_file": config.paths.state_file,
                "stale": state.as_ref().is_some_and(DaemonState::is_stale),
                "state": state,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn print_status(config: &Config, live_pid: Option<i32>, state: Option<&DaemonState>) {
    println!("nfsmgr v{}", env!("CARGO_PKG_VERSION"));
    println!("  Config: {}", config.paths.config_file.display());
    match live_pid {
        Some(pid) => println!("  Daemon: {} (pid {pid})", "running".green()),
        None => println!("  Daemon: {}", "not running".yellow()),
    }

    let Some(state) = state else {
        println!(
            "  No state file at {}",
            config.paths.state_file.display()
        );
        return;
    };
    println!(
        "  Updated: {}  Uptime: {}s  Mounted: {}/{}",
        state.last_updated,
        state.uptime_seconds,
        state.mounted_count(),
        state.shares.len()
    );
    if state.is_stale() {
        println!(
            "  {} state file is older than expected; the daemon may be wedged",
            "warning:".yellow()
        );
    }
    if state.dropped_log_events > 0 {
        println!(
            "  {} {} activity log event(s) dropped",
            "warning:".yellow(),
            state.dropped_log_events
        );
    }

    println!(
        "\n  {:<16}  {:<18}  {:>8}  {:<24}  {}",
        "Share", "Phase", "Failures", "Mount Point", "Last Error"
    );
    println!("  {}", "-".repeat(90));
    for share in &state.shares {
        println!(
            "  {:<16}  {:<18}  {:>8}  {:<24}  {}",
            share.name,
            paint_phase(share.phase),
            share.consecutive_failures,
            share.local_path.display().to_string(),
            share.last_error.as_deref().unwrap_or("-")
        );
    }
}

fn paint_phase(phase: SharePhase) -> colored::ColoredString {
    let label = phase.as_str();
    match phase {
        SharePhase::Mounted => label.green(),
        SharePhase::Failed | SharePhase::Stale => label.red(),
        _ => label.yellow(),
    }
}

fn run_validate(cli: &Cli) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let hash = config.stable_hash()?;

    match output_mode(cli) {
        OutputMode::Human => {
            println!(
                "{} {} ({} share(s), hash {hash})",
                "valid:".green(),
                config.paths.config_file.display(),
                config.shares.len()
            );
            for share in &config.shares {
                println!(
                    "  {:<16}  {:<32} -> {:<24}  container={}{}",
                    share.name,
                    share.source_spec(),
                    share.local_path.display().to_string(),
                    share.container().unwrap_or("none"),
                    if share.delete_on_mount {
                        "  delete_on_mount"
                    } else {
                        ""
                    }
                );
            }
        }
        OutputMode::Json => write_json_line(&json!({
            "valid": true,
            "config_file": config.paths.config_file,
            "config_hash": hash,
            "shares": config.shares,
        }))?,
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// output helpers
// ---------------------------------------------------------------------------

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("NFSM_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
