//! MobileShell CLI
//!
//! Three subcommands share one binary: `run` starts the HTTP server,
//! `add-password` registers a shared secret, and `nohup` is the detached
//! launcher re-exec target spawned by the supervisor — never invoked
//! directly by a user.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use mobileshell::commands::{add_password, nohup, run};

#[derive(Parser)]
#[command(name = "mobileshell")]
#[command(about = "Remote command execution from a browser, with durable process supervision")]
#[command(version = env!("MOBILESHELL_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server.
    Run {
        /// Directory holding workspaces, sessions, and hashed passwords.
        /// Falls back to $STATE_DIRECTORY, then a platform data directory.
        #[arg(long)]
        state_dir: Option<PathBuf>,

        /// Port to listen on.
        #[arg(long)]
        port: Option<u16>,

        /// Allow running as root (refused by default).
        #[arg(long, default_value_t = false)]
        allow_root: bool,

        /// Render unminified HTML/include debug affordances in the (external)
        /// templating layer. Accepted and threaded through for that
        /// collaborator; unused by this crate's JSON API surface.
        #[arg(long, default_value_t = false)]
        debug_html: bool,
    },

    /// Register a new shared password. Rejects passwords under 36 characters.
    AddPassword {
        /// Directory holding hashed-passwords/. Same resolution as `run`.
        #[arg(long)]
        state_dir: Option<PathBuf>,

        /// Read the password from stdin without the interactive prompt.
        #[arg(long, default_value_t = false)]
        from_stdin: bool,
    },

    /// Detached launcher entry point. Not user-facing: spawned by the
    /// supervisor to own exactly one process directory for its lifetime.
    #[command(hide = true)]
    Nohup {
        #[arg(long)]
        state_dir: PathBuf,

        #[arg(long)]
        workspace_id: String,

        #[arg(long)]
        process_id: String,

        #[arg(long)]
        output_type_hint: Option<String>,

        /// The full shell command to run, passed through after `--`.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            state_dir,
            port,
            allow_root,
            debug_html,
        } => {
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
                .init();

            run::run(run::RunArgs {
                state_dir,
                port,
                allow_root,
                debug_html,
            })
            .await
        }

        Commands::AddPassword { state_dir, from_stdin } => {
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
                .init();

            add_password::run(add_password::AddPasswordArgs { state_dir, from_stdin })
        }

        Commands::Nohup {
            state_dir,
            workspace_id,
            process_id,
            output_type_hint,
            command,
        } => {
            nohup::run(nohup::NohupArgs {
                state_dir,
                workspace_id,
                process_id,
                output_type_hint,
                command: command.join(" "),
            })
            .await
        }
    }
}
