//! Detached launcher
//!
//! This is the code that runs inside the `nohup` subcommand: a small process,
//! re-exec'd from the same binary, that owns exactly one process directory
//! for its whole lifetime. It detaches from its controlling terminal and the
//! supervisor's process group before running the user's command, so that a
//! server restart (or crash) never takes the child down with it.
//!
//! Everything this module writes to disk goes through [`crate::process::dir`]
//! and [`crate::process::log`] so a separate supervisor process can observe
//! and reconcile state with no coordination beyond the filesystem.

use anyhow::{Context, Result};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::process::dir::{ExitStatus, ProcessDir};
use crate::process::log::{LogWriter, Stream};

const CONTENT_SNIFF_BYTES: usize = 512;
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(2);

/// Launch parameters resolved by the `nohup` subcommand before detaching.
pub struct LaunchSpec {
    pub process_dir: ProcessDir,
    pub workspace_directory: std::path::PathBuf,
    pub pre_command: Option<String>,
    pub command: String,
    /// Caller-supplied content-type hint (e.g. `markdown`), honored verbatim
    /// when set instead of the sniffed default.
    pub output_type_hint: Option<String>,
}

/// Runs the launched command to completion, pumping stdout/stderr/stdin and
/// servicing the control socket. Returns once the child has exited and
/// `finish()` has been recorded; never returns an `Err` for a failed *user*
/// command, only for launcher-internal I/O failures.
pub async fn run(spec: LaunchSpec) -> Result<()> {
    let dir = spec.process_dir;
    dir.create(&spec.command)
        .context("creating process directory")?;

    let full_command = match &spec.pre_command {
        Some(pre) if !pre.trim().is_empty() => format!("{} && {}", pre, spec.command),
        _ => spec.command.clone(),
    };

    let stdin_pipe = dir.ensure_stdin_pipe().context("creating stdin fifo")?;
    let log_writer = Arc::new(Mutex::new(
        LogWriter::open(dir.output_log_path()).context("opening output log")?,
    ));

    let mut child = spawn_detached(&full_command, &spec.workspace_directory)
        .context("spawning command")?;

    dir.write_pid(child.id().context("child has no pid")?)
        .context("writing pid file")?;

    let control_listener = bind_control_socket(&dir).context("binding control socket")?;

    let stdout = child.stdout.take().context("child missing stdout handle")?;
    let stderr = child.stderr.take().context("child missing stderr handle")?;
    let child_stdin = child.stdin.take().context("child missing stdin handle")?;

    // Spawned rather than merely pinned: the child can fill its stdout/stderr
    // pipe buffers and block on write(2) long before it exits, so these must
    // run concurrently with the wait below, not only after it.
    let stdout_task = tokio::spawn(pump_output(stdout, Stream::Stdout, log_writer.clone(), dir.clone()));
    let stderr_task = tokio::spawn(pump_output(stderr, Stream::Stderr, log_writer.clone(), dir.clone()));
    let stdin_task = tokio::spawn(pump_stdin(stdin_pipe, child_stdin, log_writer.clone()));

    let child_handle = Arc::new(Mutex::new(child));
    let control_task = tokio::spawn(run_control_loop(
        control_listener,
        child_handle.clone(),
        log_writer.clone(),
    ));

    let exit_status = wait_for_child(child_handle.clone()).await;

    // stdout/stderr end on their own once the child's fds close; give them a
    // bounded window to drain rather than hanging on a leaked descriptor.
    let _ = tokio::time::timeout(std::time::Duration::from_millis(200), async {
        let _ = stdout_task.await;
        let _ = stderr_task.await;
    })
    .await;
    stdin_task.abort();
    control_task.abort();

    {
        let mut writer = log_writer.lock().await;
        writer.sync().ok();
    }

    finalize_output_type(&dir, spec.output_type_hint.as_deref()).context("classifying output")?;

    let status = exit_status.unwrap_or_else(|| ExitStatus::from_code(-1));
    dir.finish(&status).context("writing completion marker")?;

    Ok(())
}

fn spawn_detached(command: &str, cwd: &Path) -> Result<tokio::process::Child> {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // SAFETY: setsid() only affects the child after fork, before exec; it
    // detaches the child from the launcher's controlling terminal and starts
    // a new session so it survives the launcher process group being
    // signaled.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    cmd.spawn().context("failed to spawn child command")
}

fn bind_control_socket(dir: &ProcessDir) -> Result<UnixListener> {
    let path = dir.control_sock_path();
    if path.exists() {
        std::fs::remove_file(&path).ok();
    }
    UnixListener::bind(&path).with_context(|| format!("binding {}", path.display()))
}

async fn pump_output(
    mut reader: impl tokio::io::AsyncRead + Unpin,
    stream: Stream,
    log_writer: Arc<Mutex<LogWriter>>,
    dir: ProcessDir,
) {
    let mut buf = [0u8; 8192];
    let mut sniffed = 0usize;
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if stream == Stream::Stdout && sniffed < CONTENT_SNIFF_BYTES {
                    sniffed += n;
                    if !is_probably_text(&buf[..n]) {
                        let _ = dir.mark_binary_data();
                    }
                }
                let mut writer = log_writer.lock().await;
                if writer.append(stream, &buf[..n]).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
            Err(_) => break,
        }
    }
}

/// Reads whatever the supervisor writes into `stdin.pipe` and relays it both
/// into the log (as a `stdin` record, for the durable round-trip) and into
/// the child's real stdin, so the write actually reaches the running command.
async fn pump_stdin(
    pipe_path: std::path::PathBuf,
    mut child_stdin: tokio::process::ChildStdin,
    log_writer: Arc<Mutex<LogWriter>>,
) {
    use tokio::io::AsyncWriteExt;

    // Open our own read end so the fifo never observes EOF while the
    // launcher is alive: a client disconnecting between writes must not
    // make every other reader see end-of-file.
    let _keep_alive = std::fs::OpenOptions::new().read(true).open(&pipe_path);

    let file = match tokio::fs::OpenOptions::new().read(true).open(&pipe_path).await {
        Ok(f) => f,
        Err(_) => return,
    };
    let mut reader = tokio::io::BufReader::new(file);
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                continue;
            }
            Ok(n) => {
                {
                    let mut writer = log_writer.lock().await;
                    let _ = writer.append(Stream::Stdin, &buf[..n]);
                    let _ = writer.flush();
                }
                if child_stdin.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

/// Stdin is deliberately not part of this protocol: it goes straight to
/// `stdin.pipe` (see [`pump_stdin`]), which is the only channel that can
/// forward bytes into the child's real stdin without an extra hop.
#[derive(serde::Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
enum ControlMessage {
    SendSignal { signum: i32 },
    Resize { cols: u16, rows: u16 },
}

async fn run_control_loop(
    listener: UnixListener,
    child: Arc<Mutex<tokio::process::Child>>,
    log_writer: Arc<Mutex<LogWriter>>,
) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(_) => continue,
        };
        let child = child.clone();
        let log_writer = log_writer.clone();
        tokio::spawn(async move {
            handle_control_connection(stream, child, log_writer).await;
        });
    }
}

async fn handle_control_connection(
    mut stream: UnixStream,
    child: Arc<Mutex<tokio::process::Child>>,
    log_writer: Arc<Mutex<LogWriter>>,
) {
    let mut buf = Vec::new();
    if stream.read_to_end(&mut buf).await.is_err() {
        return;
    }
    let Ok(message) = serde_json::from_slice::<ControlMessage>(&buf) else {
        return;
    };

    match message {
        ControlMessage::SendSignal { signum } => {
            let guard = child.lock().await;
            if let Some(pid) = guard.id() {
                // SAFETY: kill(2) on a pid we own, with a validated signal
                // number.
                unsafe {
                    libc::kill(pid as i32, signum);
                }
            }
            let mut writer = log_writer.lock().await;
            let record = format!("{signum} {}", signal_name(signum));
            let _ = writer.append(Stream::SignalSent, record.as_bytes());
        }
        ControlMessage::Resize { .. } => {
            // Resizing a plain child process's controlling terminal isn't
            // meaningful here; interactive PTY sessions are resized through
            // `pty.rs` instead. Accepted for protocol symmetry with that
            // path and otherwise ignored.
        }
    }
}

async fn wait_for_child(child: Arc<Mutex<tokio::process::Child>>) -> Option<ExitStatus> {
    let status = {
        let mut guard = child.lock().await;
        guard.wait().await.ok()?
    };

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            let name = signal_name(signal);
            return Some(ExitStatus::from_signal(signal, name));
        }
    }
    Some(ExitStatus::from_code(status.code().unwrap_or(-1)))
}

fn signal_name(signum: i32) -> &'static str {
    match signum {
        1 => "SIGHUP",
        2 => "SIGINT",
        3 => "SIGQUIT",
        6 => "SIGABRT",
        9 => "SIGKILL",
        11 => "SIGSEGV",
        13 => "SIGPIPE",
        15 => "SIGTERM",
        _ => "SIGUNKNOWN",
    }
}

/// Send `signal`, wait up to [`SHUTDOWN_GRACE`] for exit, then escalate to
/// `SIGKILL`. Exposed so the supervisor's `SendSignal` can reuse the same
/// escalation policy a live terminal session uses when it closes its child.
pub fn terminate_pid(pid: u32, grace: std::time::Duration) {
    // SAFETY: signaling a pid previously observed in our own process
    // directory.
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
    std::thread::sleep(grace);
    // A null signal tells us whether the pid is still alive without
    // affecting it.
    let alive = unsafe { libc::kill(pid as i32, 0) } == 0;
    if alive {
        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }
    }
}

fn is_probably_text(bytes: &[u8]) -> bool {
    std::str::from_utf8(bytes).is_ok() && !bytes.contains(&0)
}

fn finalize_output_type(dir: &ProcessDir, hint: Option<&str>) -> Result<()> {
    if let Some(hint) = hint {
        if !hint.trim().is_empty() {
            return dir.write_output_type(hint.trim());
        }
    }

    let prefix = crate::process::log::scan_stdout_prefix(dir.output_log_path(), CONTENT_SNIFF_BYTES)?;
    let content_type = if dir.is_binary_data() || !is_probably_text(&prefix) {
        "application/octet-stream"
    } else {
        "text/plain; charset=utf-8"
    };
    dir.write_output_type(content_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn signal_names_cover_common_termination_signals() {
        assert_eq!(signal_name(15), "SIGTERM");
        assert_eq!(signal_name(9), "SIGKILL");
        assert_eq!(signal_name(255), "SIGUNKNOWN");
    }

    #[test]
    fn text_sniffing_rejects_nul_bytes() {
        assert!(is_probably_text(b"plain output\n"));
        assert!(!is_probably_text(b"binary\0blob"));
    }

    #[tokio::test]
    async fn run_captures_stdout_and_records_a_clean_exit() {
        let dir = TempDir::new().unwrap();
        let process_dir = ProcessDir::new(dir.path(), "ws1", "proc1");
        let spec = LaunchSpec {
            process_dir: process_dir.clone(),
            workspace_directory: dir.path().to_path_buf(),
            pre_command: None,
            command: "printf 'hello\\nworld'".to_string(),
            output_type_hint: None,
        };

        run(spec).await.unwrap();

        assert!(process_dir.is_completed());
        let status = process_dir.read_exit_status().unwrap();
        assert_eq!(status.code, 0);
        assert!(status.signal.is_none());

        let raw = process_dir.read_raw_stdout().unwrap();
        assert_eq!(raw, b"hello\nworld");
        assert_eq!(
            process_dir.read_output_type().unwrap(),
            "text/plain; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn run_honors_an_explicit_output_type_hint() {
        let dir = TempDir::new().unwrap();
        let process_dir = ProcessDir::new(dir.path(), "ws1", "proc1");
        let spec = LaunchSpec {
            process_dir: process_dir.clone(),
            workspace_directory: dir.path().to_path_buf(),
            pre_command: None,
            command: "printf '# heading'".to_string(),
            output_type_hint: Some("text/markdown".to_string()),
        };

        run(spec).await.unwrap();

        assert_eq!(process_dir.read_output_type().unwrap(), "text/markdown");
    }

    #[tokio::test]
    async fn sigterm_is_recorded_as_exit_code_143() {
        let dir = TempDir::new().unwrap();
        let process_dir = ProcessDir::new(dir.path(), "ws1", "proc1");
        let spec = LaunchSpec {
            process_dir: process_dir.clone(),
            workspace_directory: dir.path().to_path_buf(),
            pre_command: None,
            command: "sleep 30".to_string(),
            output_type_hint: None,
        };

        let pd_for_signal = process_dir.clone();
        let signaler = tokio::spawn(async move {
            for _ in 0..200 {
                if let Some(pid) = pd_for_signal.read_pid() {
                    unsafe {
                        libc::kill(pid as i32, libc::SIGTERM);
                    }
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            }
        });

        run(spec).await.unwrap();
        signaler.await.unwrap();

        let status = process_dir.read_exit_status().unwrap();
        assert_eq!(status.code, 143);
        assert_eq!(status.signal.as_deref(), Some("SIGTERM"));
    }

    #[tokio::test]
    async fn stdin_written_to_the_fifo_reaches_the_child() {
        let dir = TempDir::new().unwrap();
        let process_dir = ProcessDir::new(dir.path(), "ws1", "proc1");
        let spec = LaunchSpec {
            process_dir: process_dir.clone(),
            workspace_directory: dir.path().to_path_buf(),
            pre_command: None,
            command: "head -c 5".to_string(),
            output_type_hint: None,
        };

        let pd_for_writer = process_dir.clone();
        let writer = tokio::spawn(async move {
            let pipe_path = pd_for_writer.file(crate::process::dir::STDIN_PIPE);
            for _ in 0..200 {
                if pipe_path.exists() {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&pipe_path)
                .await
                .unwrap();
            use tokio::io::AsyncWriteExt;
            file.write_all(b"abcde").await.unwrap();
        });

        run(spec).await.unwrap();
        writer.await.unwrap();

        let raw = process_dir.read_raw_stdout().unwrap();
        assert_eq!(raw, b"abcde");
    }
}
