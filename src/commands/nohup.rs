//! `mobileshell nohup` — the detached launcher entry point.
//!
//! Not user-facing: the supervisor re-execs the same binary with this
//! subcommand to spawn one launcher per process. Everything this function
//! does happens in a process that has already been handed a workspace id and
//! a process id by [`crate::supervisor::Supervisor::execute`]; its own job is
//! only to resolve those into a [`crate::launcher::LaunchSpec`] and run it to
//! completion.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::launcher::{self, LaunchSpec};
use crate::process::dir::ProcessDir;
use crate::workspace::WorkspaceRegistry;

pub struct NohupArgs {
    pub state_dir: PathBuf,
    pub workspace_id: String,
    pub process_id: String,
    pub output_type_hint: Option<String>,
    pub command: String,
}

pub async fn run(args: NohupArgs) -> Result<()> {
    let registry = WorkspaceRegistry::new(&args.state_dir);
    let workspace = registry
        .get(&args.workspace_id)
        .with_context(|| format!("resolving workspace {}", args.workspace_id))?;

    let process_dir = ProcessDir::new(
        registry.workspace_dir(&args.workspace_id),
        &args.workspace_id,
        &args.process_id,
    );

    // A detached child has no attached terminal; its own diagnostics go to a
    // per-process log file rather than stdout/stderr, which are reserved for
    // the user command being launched.
    let _guard = init_launcher_logging(&process_dir)?;

    tracing::info!(
        workspace_id = %args.workspace_id,
        process_id = %args.process_id,
        command = %args.command,
        "launcher starting"
    );

    let spec = LaunchSpec {
        process_dir,
        workspace_directory: workspace.directory.clone(),
        pre_command: workspace.pre_command.clone(),
        command: args.command,
        output_type_hint: args.output_type_hint,
    };

    launcher::run(spec).await
}

fn init_launcher_logging(dir: &ProcessDir) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.launcher_log_path())
        .context("opening launcher log file")?;
    let (writer, guard) = tracing_appender::non_blocking(log_file);

    let _ = tracing_subscriber::fmt()
        .with_writer(writer)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_ansi(false)
        .try_init();

    Ok(guard)
}
