//! Supervisor and reconciler
//!
//! The supervisor never keeps an in-memory table of running processes: every
//! operation reads or writes the process directory directly, and liveness is
//! always reverified against the OS rather than trusted from a cache. That is
//! what lets the whole server restart without losing track of anything a
//! launcher already detached.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::process::dir::{ExitStatus, ProcessDir, ProcessInfo};
use crate::workspace::WorkspaceRegistry;

const SEND_STDIN_TIMEOUT: Duration = Duration::from_secs(5);
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct Supervisor {
    workspaces: WorkspaceRegistry,
}

impl Supervisor {
    pub fn new(workspaces: WorkspaceRegistry) -> Self {
        Self { workspaces }
    }

    pub fn workspaces(&self) -> &WorkspaceRegistry {
        &self.workspaces
    }

    /// Bytes of stdout produced since `offset` (the length already seen by
    /// the caller), along with the total stdout length recorded so far. The
    /// new-bytes slice is itself capped at `max_new_bytes` from its tail so
    /// a viewer that hasn't polled in a while doesn't get a multi-megabyte
    /// catch-up frame — but the returned total length always reflects the
    /// full log, so a caller tracking "how much have I seen" by that total
    /// never mistakes a capped read for "nothing new".
    pub fn read_stdout_since(
        &self,
        workspace_id: &str,
        process_id: &str,
        offset: usize,
        max_new_bytes: usize,
    ) -> Result<(Vec<u8>, usize)> {
        let pd = self.process_dir(workspace_id, process_id);
        let raw = pd.read_raw_stdout()?;
        let total = raw.len();
        if total <= offset {
            return Ok((Vec::new(), total));
        }
        let mut new_bytes = raw[offset..].to_vec();
        if new_bytes.len() > max_new_bytes {
            let start = new_bytes.len() - max_new_bytes;
            new_bytes.drain(0..start);
        }
        Ok((new_bytes, total))
    }

    fn process_dir(&self, workspace_id: &str, process_id: &str) -> ProcessDir {
        ProcessDir::new(
            self.workspaces.workspace_dir(workspace_id),
            workspace_id,
            process_id,
        )
    }

    /// Create the process directory and hand off to a freshly spawned
    /// `nohup` child. The supervisor itself never runs the user's command;
    /// it only ever waits for the launcher to exist and detach.
    pub async fn execute(
        &self,
        workspace_id: &str,
        command: &str,
        mobileshell_binary: &PathBuf,
    ) -> Result<ProcessInfo> {
        self.execute_with_hint(workspace_id, command, None, mobileshell_binary).await
    }

    /// Same as [`Self::execute`], but forwards a caller-supplied content-type
    /// hint (e.g. `markdown`) to the launcher for commands whose output
    /// shouldn't be sniffed.
    pub async fn execute_with_hint(
        &self,
        workspace_id: &str,
        command: &str,
        output_type_hint: Option<&str>,
        mobileshell_binary: &PathBuf,
    ) -> Result<ProcessInfo> {
        let workspace = self.workspaces.get(workspace_id)?;
        let process_id = Uuid::new_v4().simple().to_string();
        let dir = self.process_dir(workspace_id, &process_id);

        let mut cmd = tokio::process::Command::new(mobileshell_binary);
        cmd.arg("nohup")
            .arg("--state-dir")
            .arg(self.workspaces.state_dir())
            .arg("--workspace-id")
            .arg(workspace_id)
            .arg("--process-id")
            .arg(&process_id);
        if let Some(hint) = output_type_hint {
            cmd.arg("--output-type-hint").arg(hint);
        }
        cmd.arg("--")
            .arg(command)
            .current_dir(&workspace.directory)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        let mut child = cmd.spawn().context("spawning detached launcher")?;

        // Wait for the launcher to either write a pid (it has detached and
        // is running the command) or exit on its own (it failed before
        // getting that far).
        for _ in 0..200 {
            if dir.read_pid().is_some() {
                break;
            }
            if let Ok(Some(_)) = child.try_wait() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        dir.info().context("reading newly created process info")
    }

    pub fn list_processes(&self, workspace_id: &str) -> Result<Vec<ProcessInfo>> {
        let dir = self.workspaces.workspace_dir(workspace_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut processes = Vec::new();
        for entry in std::fs::read_dir(&dir).context("reading workspace directory")? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            let pd = self.process_dir(workspace_id, &id);
            if !pd.exists() || pd.read_command().is_err() {
                continue;
            }
            reconcile_one(&pd);
            if let Ok(info) = pd.info() {
                processes.push(info);
            }
        }
        processes.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(processes)
    }

    pub fn get_process(&self, workspace_id: &str, process_id: &str) -> Result<ProcessInfo> {
        let pd = self.process_dir(workspace_id, process_id);
        reconcile_one(&pd);
        pd.info()
    }

    /// Deliver a signal, preferring the launcher's control socket (which logs
    /// a `signal-sent` record) and falling back to signaling the pid
    /// directly if the control socket is unreachable.
    pub async fn send_signal(&self, workspace_id: &str, process_id: &str, signum: i32) -> Result<()> {
        anyhow::ensure!((1..=31).contains(&signum), "signal number out of range: {signum}");
        let pd = self.process_dir(workspace_id, process_id);

        if send_control_message(&pd, ControlRequest::SendSignal { signum }).await.is_ok() {
            return Ok(());
        }

        let pid = pd.read_pid().context("process has no recorded pid")?;
        // SAFETY: pid was read from our own process directory.
        let rc = unsafe { libc::kill(pid as i32, signum) };
        anyhow::ensure!(rc == 0, "kill({pid}, {signum}) failed");
        Ok(())
    }

    /// Write directly to the process's `stdin.pipe`, appending a trailing
    /// newline if the caller didn't supply one. Bounded by
    /// [`SEND_STDIN_TIMEOUT`]: a launcher that never opened its read end (or
    /// died without the reconciler catching up yet) fails the request rather
    /// than hanging the caller on the FIFO open.
    pub async fn send_stdin(&self, workspace_id: &str, process_id: &str, bytes: &[u8]) -> Result<()> {
        let pd = self.process_dir(workspace_id, process_id);
        let pipe_path = pd.ensure_stdin_pipe().context("resolving stdin fifo")?;

        let mut payload = bytes.to_vec();
        if payload.last() != Some(&b'\n') {
            payload.push(b'\n');
        }

        tokio::time::timeout(SEND_STDIN_TIMEOUT, async {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&pipe_path)
                .await
                .context("opening stdin fifo")?;
            file.write_all(&payload).await.context("writing to stdin fifo")
        })
        .await
        .context("timed out sending stdin")?
    }

    /// Force-terminate a process directly, bypassing the control socket:
    /// SIGTERM, wait, then SIGKILL if it's still alive.
    pub fn terminate(&self, workspace_id: &str, process_id: &str) -> Result<()> {
        let pd = self.process_dir(workspace_id, process_id);
        let pid = pd.read_pid().context("process has no recorded pid")?;
        crate::launcher::terminate_pid(pid, TERMINATE_GRACE);
        Ok(())
    }

    /// Sweep every workspace's processes, synthesizing completion for any
    /// whose pid is no longer alive. Safe to call concurrently with itself
    /// and with on-demand reconciliation in `list_processes`/`get_process`,
    /// since `ProcessDir::finish` is idempotent.
    pub fn reconcile_all(&self) -> Result<()> {
        for workspace in self.workspaces.list()? {
            let _ = self.list_processes(&workspace.id);
        }
        Ok(())
    }
}

#[derive(serde::Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
enum ControlRequest {
    SendSignal { signum: i32 },
}

async fn send_control_message(dir: &ProcessDir, request: ControlRequest) -> Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut stream = tokio::net::UnixStream::connect(dir.control_sock_path())
        .await
        .context("connecting to control socket")?;
    let payload = serde_json::to_vec(&request)?;
    stream.write_all(&payload).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Probe whether a pid is alive with a null signal, without affecting it.
/// If it is dead and the process hasn't already recorded completion,
/// synthesize an unknown-exit-status completion so observers don't wait
/// forever on a process whose launcher died without writing its own status
/// (e.g. it was killed with SIGKILL itself).
fn reconcile_one(dir: &ProcessDir) {
    if dir.is_completed() {
        return;
    }
    let Some(pid) = dir.read_pid() else { return };
    // SAFETY: a null signal only probes liveness; it never affects the
    // target.
    let alive = unsafe { libc::kill(pid as i32, 0) } == 0;
    if !alive {
        let _ = dir.finish(&ExitStatus::from_code(-1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn reconcile_marks_dead_pid_as_completed() {
        let dir = TempDir::new().unwrap();
        let pd = ProcessDir::new(dir.path(), "ws", "proc1");
        pd.create("echo hi").unwrap();
        // A pid essentially guaranteed not to be alive in the test sandbox.
        pd.write_pid(999_999).unwrap();

        reconcile_one(&pd);

        assert!(pd.is_completed());
        assert_eq!(pd.read_exit_status().unwrap().code, -1);
    }

    #[test]
    fn reconcile_leaves_already_completed_process_untouched() {
        let dir = TempDir::new().unwrap();
        let pd = ProcessDir::new(dir.path(), "ws", "proc1");
        pd.create("echo hi").unwrap();
        pd.write_pid(999_999).unwrap();
        pd.finish(&ExitStatus::from_code(0)).unwrap();

        reconcile_one(&pd);

        assert_eq!(pd.read_exit_status().unwrap().code, 0);
    }

    #[test]
    fn reconcile_ignores_process_with_no_pid_yet() {
        let dir = TempDir::new().unwrap();
        let pd = ProcessDir::new(dir.path(), "ws", "proc1");
        pd.create("echo hi").unwrap();

        reconcile_one(&pd);

        assert!(!pd.is_completed());
    }
}
