//! Cross-module durability scenarios: a detached launcher's output survives
//! exactly as §8 of the design spec requires, and a second `Supervisor`
//! instance rooted at the same state directory — standing in for a
//! restarted server — converges orphaned processes the same way the first
//! one would have.

use mobileshell::launcher::{self, LaunchSpec};
use mobileshell::process::dir::{ExitStatus, ProcessDir};
use mobileshell::supervisor::Supervisor;
use mobileshell::workspace::WorkspaceRegistry;

/// S1 — launching a command that writes every byte value to stdout must
/// round-trip byte-for-byte through the framed log, and the binary-data
/// marker must be set.
#[tokio::test]
async fn binary_stdout_round_trips_through_the_launcher_and_the_log() {
    let dir = tempfile::TempDir::new().unwrap();
    let process_dir = ProcessDir::new(dir.path(), "ws1", "proc1");

    // printf octal escapes for every byte value 0..=255, including NUL.
    let mut command = String::from("printf '");
    for byte in 0u16..=255 {
        command.push_str(&format!("\\{:03o}", byte));
    }
    command.push('\'');

    let spec = LaunchSpec {
        process_dir: process_dir.clone(),
        workspace_directory: dir.path().to_path_buf(),
        pre_command: None,
        command,
        output_type_hint: None,
    };

    launcher::run(spec).await.unwrap();

    assert!(process_dir.is_completed());
    assert!(process_dir.is_binary_data());

    let raw = process_dir.read_raw_stdout().unwrap();
    assert_eq!(raw.len(), 256);
    let distinct: std::collections::HashSet<u8> = raw.iter().copied().collect();
    assert_eq!(distinct.len(), 256, "all 256 byte values must appear");
    for (i, byte) in raw.iter().enumerate() {
        assert_eq!(*byte as usize, i, "bytes must stay in source order");
    }
}

/// S4 — a process whose launcher died without recording `exit-status` is
/// converged to a synthetic `-1` exit by whichever `Supervisor` next lists
/// it, and that holds even across what stands in for a server restart: a
/// brand new `Supervisor` built from the same on-disk state directory.
#[tokio::test]
async fn orphaned_process_is_reconciled_by_a_freshly_constructed_supervisor() {
    let dir = tempfile::TempDir::new().unwrap();
    let registry = WorkspaceRegistry::new(dir.path());
    let workspace = registry.create("ws", dir.path().to_path_buf(), None, None).unwrap();

    let pd = ProcessDir::new(registry.workspace_dir(&workspace.id), &workspace.id, "orphan");
    pd.create("sleep 1000").unwrap();
    // A pid essentially guaranteed to be dead in the test sandbox, simulating
    // a launcher that was killed (e.g. SIGKILL) before it could write its
    // own exit-status/completed pair.
    pd.write_pid(999_999).unwrap();

    // Stand-in for "the server restarted": a new Supervisor, no shared
    // in-memory state with anything that ran before.
    let supervisor_after_restart = Supervisor::new(registry);
    let processes = supervisor_after_restart.list_processes(&workspace.id).unwrap();

    assert_eq!(processes.len(), 1);
    assert!(processes[0].completed);
    assert_eq!(processes[0].exit_code, Some(-1));

    // Running the reconciliation pass again must be a no-op, not a second
    // write or an error.
    let processes_again = supervisor_after_restart.list_processes(&workspace.id).unwrap();
    assert_eq!(processes_again[0].exit_code, Some(-1));
    assert_eq!(pd.read_exit_status(), Some(ExitStatus::from_code(-1)));
}

/// S5 — stdin submitted through the supervisor's public API (not by writing
/// the fifo directly) reaches the running child and is captured in the log.
#[tokio::test]
async fn supervisor_send_stdin_reaches_a_running_cat_and_is_logged() {
    let dir = tempfile::TempDir::new().unwrap();
    let registry = WorkspaceRegistry::new(dir.path());
    let workspace = registry.create("ws", dir.path().to_path_buf(), None, None).unwrap();
    let supervisor = Supervisor::new(registry.clone());

    let process_dir = ProcessDir::new(registry.workspace_dir(&workspace.id), &workspace.id, "cat1");
    let spec = LaunchSpec {
        process_dir: process_dir.clone(),
        workspace_directory: workspace.directory.clone(),
        pre_command: None,
        command: "cat".to_string(),
        output_type_hint: None,
    };

    let launch = tokio::spawn(launcher::run(spec));

    // Wait for the launcher to publish a pid before sending stdin, matching
    // how a real caller would poll after `Execute`.
    for _ in 0..200 {
        if process_dir.read_pid().is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }

    supervisor.send_stdin(&workspace.id, "cat1", b"hello").await.unwrap();

    // `cat` only exits on EOF; terminate it via the supervisor to let the
    // launcher record completion.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    supervisor.send_signal(&workspace.id, "cat1", 15).await.unwrap();

    launch.await.unwrap().unwrap();

    let all = process_dir.read_all().unwrap();
    assert_eq!(all.stdin, b"hello\n");
    assert_eq!(all.stdout, b"hello\n");
}
