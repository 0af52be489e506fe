//! `mobileshell run` — starts the HTTP server.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use crate::auth::AuthStore;
use crate::config::Config;
use crate::live::LiveViewMultiplexer;
use crate::security::ConnectionTracker;
use crate::server::{run_server, AppState};
use crate::supervisor::Supervisor;
use crate::workspace::WorkspaceRegistry;

/// Generous per-IP websocket connection ceiling: one phone can reasonably
/// hold a process-updates socket per workspace plus a handful of terminal
/// attaches open at once. This guards against a runaway client, not against
/// legitimate multi-tab use.
const MAX_WEBSOCKET_CONNECTIONS_PER_IP: usize = 64;

pub struct RunArgs {
    pub state_dir: Option<PathBuf>,
    pub port: Option<u16>,
    pub allow_root: bool,
    pub debug_html: bool,
}

pub async fn run(args: RunArgs) -> Result<()> {
    #[cfg(unix)]
    if !args.allow_root && nix::unistd::Uid::effective().is_root() {
        anyhow::bail!("refusing to run as root without --allow-root");
    }

    let config_path = args
        .state_dir
        .clone()
        .unwrap_or_else(|| Config::default().state_dir)
        .join("config.toml");

    let mut config = Config::load_or_default(&config_path).context("loading configuration")?;
    if let Some(state_dir) = args.state_dir {
        config.state_dir = state_dir;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    config.allow_root = args.allow_root;
    config.debug_html = args.debug_html;
    config.validate().context("validating configuration")?;

    std::fs::create_dir_all(&config.state_dir).context("creating state directory")?;

    let auth = AuthStore::new(&config.state_dir);
    if !auth.any_password_registered() {
        tracing::warn!(
            "no password registered yet; run `mobileshell add-password` before exposing this server"
        );
    }

    let workspaces = WorkspaceRegistry::new(&config.state_dir);
    let supervisor = Supervisor::new(workspaces.clone());
    let live = LiveViewMultiplexer::new(supervisor.clone());

    let reconciler = supervisor.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(10));
        loop {
            interval.tick().await;
            if let Err(err) = reconciler.reconcile_all() {
                tracing::warn!(error = %err, "periodic reconciliation failed");
            }
        }
    });

    tokio::spawn(live.clone().run());

    let mobileshell_binary = std::env::current_exe().context("resolving current executable path")?;

    let state = AppState {
        auth,
        workspaces,
        supervisor,
        live,
        mobileshell_binary,
        terminals: Arc::new(dashmap::DashMap::new()),
        connections: ConnectionTracker::new(MAX_WEBSOCKET_CONNECTIONS_PER_IP),
    };

    run_server(config.bind_addr(), state).await
}
