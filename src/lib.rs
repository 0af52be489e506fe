//! MobileShell — single-host remote command-execution service.
//!
//! The library exposes every piece the `mobileshell` binary wires together:
//! the durable process directory/log pair, the workspace registry, the
//! detached launcher, the supervisor/reconciler, the interactive PTY session,
//! the live-view multiplexer, and the auth boundary. `main.rs` is a thin CLI
//! shell around these modules so the core logic stays testable without a
//! running server.

pub mod auth;
pub mod commands;
pub mod config;
pub mod error;
pub mod launcher;
pub mod live;
pub mod process;
pub mod pty;
pub mod security;
pub mod server;
pub mod supervisor;
pub mod version;
pub mod workspace;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use live::LiveViewMultiplexer;
pub use pty::TerminalSession;
pub use server::{create_router, run_server, AppState};
pub use supervisor::Supervisor;
pub use version::DateVersion;
pub use workspace::{Workspace, WorkspaceRegistry, WorkspaceUpdate};
