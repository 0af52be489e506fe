//! Process directory schema
//!
//! Every launched command owns one directory,
//! `<workspace>/<command-id>/`, holding exactly the files this module knows
//! how to read and write. Ownership is partitioned by file: the supervisor
//! writes `command`/`created`; the launcher writes everything else. That
//! partitioning is what lets multiple processes share a workspace directory
//! without any locking.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::log;

pub const COMMAND: &str = "command";
pub const CREATED: &str = "created";
pub const PID: &str = "pid";
pub const OUTPUT_LOG: &str = "output.log";
pub const STDIN_PIPE: &str = "stdin.pipe";
pub const CONTROL_SOCK: &str = "control.sock";
pub const EXIT_STATUS: &str = "exit-status";
pub const COMPLETED: &str = "completed";
pub const BINARY_DATA: &str = "binary-data";
pub const OUTPUT_TYPE: &str = "output-type";
pub const LAUNCHER_LOG: &str = "launcher.log";

/// A materialized view of one process directory's on-disk state.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub id: String,
    pub workspace_id: String,
    pub command: String,
    pub created: DateTime<Utc>,
    pub pid: Option<u32>,
    pub completed: bool,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub binary_data: bool,
    pub output_type: Option<String>,
}

/// Exit status, as recorded in the `exit-status` file: `<code>[ <signal-name>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i32,
    pub signal: Option<String>,
}

impl ExitStatus {
    pub fn from_code(code: i32) -> Self {
        Self { code, signal: None }
    }

    pub fn from_signal(signum: i32, name: &str) -> Self {
        Self {
            code: 128 + signum,
            signal: Some(name.to_string()),
        }
    }

    pub fn to_file_contents(&self) -> String {
        match &self.signal {
            Some(name) => format!("{} {}", self.code, name),
            None => self.code.to_string(),
        }
    }

    pub fn parse(contents: &str) -> Option<Self> {
        let contents = contents.trim();
        let mut parts = contents.splitn(2, ' ');
        let code: i32 = parts.next()?.parse().ok()?;
        let signal = parts.next().map(|s| s.to_string());
        Some(Self { code, signal })
    }
}

/// A handle to one process's directory on disk. Cheap to construct; every
/// method does its own filesystem I/O, matching the "no in-memory process
/// table" design.
#[derive(Debug, Clone)]
pub struct ProcessDir {
    path: PathBuf,
    workspace_id: String,
    id: String,
}

impl ProcessDir {
    pub fn new(workspace_dir: impl AsRef<Path>, workspace_id: &str, id: &str) -> Self {
        Self {
            path: workspace_dir.as_ref().join(id),
            workspace_id: workspace_id.to_string(),
            id: id.to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Create the directory and write the supervisor-owned files. Called
    /// once by `Execute` before the launcher is spawned.
    pub fn create(&self, command: &str) -> Result<()> {
        fs::create_dir_all(&self.path)
            .with_context(|| format!("creating process directory {}", self.path.display()))?;
        fs::write(self.file(COMMAND), command).context("writing command file")?;
        fs::write(self.file(CREATED), Utc::now().to_rfc3339()).context("writing created file")?;
        Ok(())
    }

    pub fn write_pid(&self, pid: u32) -> Result<()> {
        fs::write(self.file(PID), pid.to_string()).context("writing pid file")
    }

    pub fn read_pid(&self) -> Option<u32> {
        fs::read_to_string(self.file(PID)).ok()?.trim().parse().ok()
    }

    pub fn read_command(&self) -> Result<String> {
        fs::read_to_string(self.file(COMMAND)).context("reading command file")
    }

    pub fn read_created(&self) -> Result<DateTime<Utc>> {
        let raw = fs::read_to_string(self.file(CREATED)).context("reading created file")?;
        DateTime::parse_from_rfc3339(raw.trim())
            .map(|d| d.with_timezone(&Utc))
            .context("parsing created timestamp")
    }

    /// Create the FIFO the launcher holds open for stdin, if it doesn't
    /// already exist.
    #[cfg(unix)]
    pub fn ensure_stdin_pipe(&self) -> Result<PathBuf> {
        let path = self.file(STDIN_PIPE);
        if !path.exists() {
            nix::unistd::mkfifo(&path, nix::sys::stat::Mode::from_bits_truncate(0o600))
                .with_context(|| format!("creating stdin fifo {}", path.display()))?;
        }
        Ok(path)
    }

    pub fn control_sock_path(&self) -> PathBuf {
        self.file(CONTROL_SOCK)
    }

    pub fn is_completed(&self) -> bool {
        self.file(COMPLETED).exists()
    }

    pub fn read_exit_status(&self) -> Option<ExitStatus> {
        let raw = fs::read_to_string(self.file(EXIT_STATUS)).ok()?;
        ExitStatus::parse(&raw)
    }

    /// Write `exit-status`, fsynced, then write `completed`. `completed` is
    /// created exclusively: a second writer racing to finish the same
    /// process (e.g. concurrent reconciler passes) sees `EEXIST` and treats
    /// it as success rather than erroring, per the open-question resolution
    /// on idempotent completion.
    pub fn finish(&self, status: &ExitStatus) -> Result<()> {
        let exit_path = self.file(EXIT_STATUS);
        if !exit_path.exists() {
            let mut f = File::create(&exit_path).context("creating exit-status file")?;
            f.write_all(status.to_file_contents().as_bytes())?;
            f.sync_all().context("fsyncing exit-status file")?;
        }

        let completed_path = self.file(COMPLETED);
        match OpenOptions::new().create_new(true).write(true).open(&completed_path) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e).context("creating completed marker"),
        }
    }

    pub fn mark_binary_data(&self) -> Result<()> {
        let path = self.file(BINARY_DATA);
        if !path.exists() {
            File::create(&path).context("creating binary-data marker")?;
        }
        Ok(())
    }

    pub fn is_binary_data(&self) -> bool {
        self.file(BINARY_DATA).exists()
    }

    pub fn write_output_type(&self, content_type: &str) -> Result<()> {
        fs::write(self.file(OUTPUT_TYPE), content_type).context("writing output-type file")
    }

    pub fn read_output_type(&self) -> Option<String> {
        fs::read_to_string(self.file(OUTPUT_TYPE)).ok().map(|s| s.trim().to_string())
    }

    pub fn output_log_path(&self) -> PathBuf {
        self.file(OUTPUT_LOG)
    }

    pub fn launcher_log_path(&self) -> PathBuf {
        self.file(LAUNCHER_LOG)
    }

    /// Materialize a full `ProcessInfo` snapshot by reading every file.
    pub fn info(&self) -> Result<ProcessInfo> {
        let command = self.read_command()?;
        let created = self.read_created()?;
        let pid = self.read_pid();
        let completed = self.is_completed();
        let status = self.read_exit_status();

        Ok(ProcessInfo {
            id: self.id.clone(),
            workspace_id: self.workspace_id.clone(),
            command,
            created,
            pid,
            completed,
            exit_code: status.as_ref().map(|s| s.code),
            signal: status.and_then(|s| s.signal),
            binary_data: self.is_binary_data(),
            output_type: self.read_output_type(),
        })
    }

    pub fn read_all(&self) -> Result<log::Streams> {
        log::read_all(self.output_log_path())
    }

    pub fn read_raw_stdout(&self) -> Result<Vec<u8>> {
        log::read_raw_stdout(self.output_log_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_writes_command_and_created() {
        let dir = TempDir::new().unwrap();
        let pd = ProcessDir::new(dir.path(), "ws1", "proc1");
        pd.create("echo hi").unwrap();

        assert_eq!(pd.read_command().unwrap(), "echo hi");
        assert!(pd.read_created().is_ok());
        assert!(!pd.is_completed());
    }

    #[test]
    fn finish_is_idempotent_under_double_call() {
        let dir = TempDir::new().unwrap();
        let pd = ProcessDir::new(dir.path(), "ws1", "proc1");
        pd.create("sleep 1").unwrap();
        pd.write_pid(1234).unwrap();

        let status = ExitStatus::from_code(0);
        pd.finish(&status).unwrap();
        pd.finish(&status).unwrap();

        assert!(pd.is_completed());
        assert_eq!(pd.read_exit_status(), Some(status));
    }

    #[test]
    fn exit_status_encodes_signal_termination() {
        let status = ExitStatus::from_signal(15, "SIGTERM");
        assert_eq!(status.code, 143);
        assert_eq!(status.to_file_contents(), "143 SIGTERM");
        assert_eq!(ExitStatus::parse("143 SIGTERM"), Some(status));
    }

    #[test]
    fn exit_status_without_signal_has_no_trailing_name() {
        let status = ExitStatus::from_code(0);
        assert_eq!(status.to_file_contents(), "0");
        assert_eq!(ExitStatus::parse("0"), Some(status));
    }

    #[test]
    fn info_reports_incomplete_process_before_finish() {
        let dir = TempDir::new().unwrap();
        let pd = ProcessDir::new(dir.path(), "ws1", "proc1");
        pd.create("sleep 30").unwrap();
        pd.write_pid(999).unwrap();

        let info = pd.info().unwrap();
        assert_eq!(info.pid, Some(999));
        assert!(!info.completed);
        assert!(info.exit_code.is_none());
    }
}
